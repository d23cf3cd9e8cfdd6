//! Encrypted byte-oriented socket.
//!
//! [`SecureTransport`] bridges raw TCP and the block cipher. The raw
//! primitives loop until the requested count is transferred or the socket
//! errors; any error flips the `connected` flag and surfaces the partial
//! count to the caller; there is no retry at this layer. The secure
//! primitives pad to the cipher block size and run the cipher in place.
//!
//! One reader and one writer may operate concurrently on the same
//! transport; the pipeline stages above rely on that.

use crate::error::TransportError;
use crate::handshake;
use crate::metrics::DataMetrics;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use veil_crypto::{padded_len, RandomSource, SymmetricKey};

/// A TCP stream with an installed session key and framed secure I/O.
pub struct SecureTransport {
    /// Read-locked for I/O (readers and writers share the guard; `&TcpStream`
    /// implements `Read`/`Write`), write-locked only to install or replace
    /// the stream.
    stream: RwLock<Option<TcpStream>>,
    connected: AtomicBool,
    peer: RwLock<Option<SocketAddr>>,
    /// Set once by the handshake, read-only afterwards.
    key: RwLock<Option<Arc<SymmetricKey>>>,
    metrics: DataMetrics,
    rng: RandomSource,
}

impl SecureTransport {
    /// Create an unconnected transport. `rng` seeds the key material the
    /// client side generates during the handshake.
    #[must_use]
    pub fn new(rng: RandomSource) -> Self {
        Self {
            stream: RwLock::new(None),
            connected: AtomicBool::new(false),
            peer: RwLock::new(None),
            key: RwLock::new(None),
            metrics: DataMetrics::default(),
            rng,
        }
    }

    /// Wrap an already-accepted stream (server side). The handshake has not
    /// run yet; the acceptor drives it before handing the transport out.
    #[must_use]
    pub fn from_stream(stream: TcpStream, rng: RandomSource) -> Self {
        let peer = stream.peer_addr().ok();
        let transport = Self::new(rng);
        *transport.stream.write().expect("stream lock poisoned") = Some(stream);
        *transport.peer.write().expect("peer lock poisoned") = peer;
        transport.connected.store(true, Ordering::Release);
        transport
    }

    /// Resolve `host:port`, connect, and run the client handshake.
    ///
    /// On success the transport is connected and secure. On any failure the
    /// transport is left disconnected.
    ///
    /// # Errors
    ///
    /// Returns the resolution, connection, or handshake error.
    pub fn connect(&self, host: &str, port: u16, no_delay: bool) -> Result<(), TransportError> {
        self.disconnect();

        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(TransportError::Io)?;
        let addr = addrs
            .next()
            .ok_or_else(|| TransportError::NoAddress(format!("{host}:{port}")))?;

        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(no_delay)?;

        *self.stream.write().expect("stream lock poisoned") = Some(stream);
        *self.peer.write().expect("peer lock poisoned") = Some(addr);
        *self.key.write().expect("key lock poisoned") = None;
        self.connected.store(true, Ordering::Release);
        debug!(%addr, "connected, starting handshake");

        if let Err(err) = handshake::client_handshake(self) {
            warn!(%addr, error = %err, "client handshake failed");
            self.disconnect();
            return Err(err.into());
        }
        Ok(())
    }

    /// Shut the socket down and mark the transport disconnected. Blocked
    /// raw reads and writes return with what they have.
    pub fn disconnect(&self) {
        if let Some(stream) = self.stream.read().expect("stream lock poisoned").as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.connected.store(false, Ordering::Release);
    }

    /// Whether the transport believes it is connected. Updated by every raw
    /// operation; may lag the real socket state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether a session key is installed. Without one no secure data can
    /// move.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.key.read().expect("key lock poisoned").is_some()
    }

    /// Address of the remote endpoint, if connected.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.read().expect("peer lock poisoned")
    }

    /// Transfer counters for this transport.
    #[must_use]
    pub fn metrics(&self) -> &DataMetrics {
        &self.metrics
    }

    /// The injectable random source this transport was built with.
    #[must_use]
    pub fn random_source(&self) -> &RandomSource {
        &self.rng
    }

    /// The installed session key, shared with the parallel cipher stages.
    #[must_use]
    pub fn session_key(&self) -> Option<Arc<SymmetricKey>> {
        self.key.read().expect("key lock poisoned").clone()
    }

    /// Install the session key. Called once per connection by the
    /// handshake.
    pub(crate) fn install_key(&self, key: SymmetricKey) {
        *self.key.write().expect("key lock poisoned") = Some(Arc::new(key));
    }

    /// Read until `buf` is full or the socket errors. Returns the number of
    /// bytes obtained; a short count means the connection dropped.
    pub fn read_raw(&self, buf: &mut [u8]) -> usize {
        let guard = self.stream.read().expect("stream lock poisoned");
        let Some(stream) = guard.as_ref() else {
            self.connected.store(false, Ordering::Release);
            return 0;
        };

        let mut stream = stream;
        let mut total = 0;
        while total < buf.len() {
            match stream.read(&mut buf[total..]) {
                Ok(0) => {
                    self.connected.store(false, Ordering::Release);
                    break;
                }
                Ok(n) => {
                    total += n;
                    self.metrics.add_read(n as u64);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.connected.store(false, Ordering::Release);
                    break;
                }
            }
        }
        total
    }

    /// Write all of `buf` or stop at the first socket error. Returns the
    /// number of bytes sent; a short count means the connection dropped.
    pub fn write_raw(&self, buf: &[u8]) -> usize {
        let guard = self.stream.read().expect("stream lock poisoned");
        let Some(stream) = guard.as_ref() else {
            self.connected.store(false, Ordering::Release);
            return 0;
        };

        let mut stream = stream;
        let mut total = 0;
        while total < buf.len() {
            match stream.write(&buf[total..]) {
                Ok(0) => {
                    self.connected.store(false, Ordering::Release);
                    break;
                }
                Ok(n) => {
                    total += n;
                    self.metrics.add_written(n as u64);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.connected.store(false, Ordering::Release);
                    break;
                }
            }
        }
        total
    }

    /// Read `n` logical bytes that the peer wrote with
    /// [`write_secure`](Self::write_secure): receive the padded ciphertext
    /// and decrypt it in place. When `buf` has room for the padded length
    /// the transfer is zero-copy; otherwise a block-aligned scratch is used.
    ///
    /// Returns `min(n, bytes received)`.
    pub fn read_secure(&self, buf: &mut [u8], n: usize) -> usize {
        let Some(key) = self.session_key() else {
            warn!("read_secure without a session key");
            return 0;
        };

        let padded = padded_len(n);
        if buf.len() >= padded {
            let received = self.read_raw(&mut buf[..padded]);
            if received > 0 {
                key.decrypt_in_place(buf, received, true);
            }
            return n.min(received);
        }

        let mut scratch = vec![0u8; padded];
        let received = self.read_raw(&mut scratch);
        if received > 0 {
            key.decrypt_in_place(&mut scratch, received, true);
        }
        let usable = n.min(received).min(buf.len());
        buf[..usable].copy_from_slice(&scratch[..usable]);
        n.min(received)
    }

    /// Encrypt `n` logical bytes of `buf` in place (padding to the block
    /// size; `buf` must have room for the padded length) and send the
    /// ciphertext.
    ///
    /// Returns `min(n, bytes sent)`.
    pub fn write_secure(&self, buf: &mut [u8], n: usize) -> usize {
        let Some(key) = self.session_key() else {
            warn!("write_secure without a session key");
            return 0;
        };

        let total = key.encrypt_in_place(buf, n, true);
        let written = self.write_raw(&buf[..total]);
        n.min(written)
    }
}

impl std::fmt::Debug for SecureTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureTransport")
            .field("connected", &self.is_connected())
            .field("secure", &self.is_secure())
            .field("peer", &self.peer_addr())
            .finish()
    }
}
