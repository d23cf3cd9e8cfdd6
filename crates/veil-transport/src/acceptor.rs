//! Listener that establishes secure sessions and hands them to a user
//! session function.
//!
//! The acceptor generates one long-lived keypair at construction and runs
//! the server handshake on every inbound connection in a dedicated thread.
//! The session thread is fire-and-forget: the user handler owns the
//! transport's lifetime after the handshake, and any fault (handshake
//! failure or a handler panic) is routed to the optional error callback.

use crate::error::TransportError;
use crate::handshake::server_handshake;
use crate::secure::SecureTransport;
use std::net::{TcpListener, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};
use veil_crypto::{KeyPair, RandomSource};

/// User session function, invoked once the handshake has succeeded.
pub type SessionHandler = Arc<dyn Fn(Arc<SecureTransport>) + Send + Sync>;

/// Callback for handshake failures and session-function panics.
pub type SessionErrorHandler = Arc<dyn Fn(TransportError, Arc<SecureTransport>) + Send + Sync>;

/// Acceptor tuning knobs.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Modulus size of the long-lived keypair.
    pub key_bits: usize,
    /// `TCP_NODELAY` for accepted connections.
    pub no_delay: bool,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            key_bits: 2048,
            no_delay: false,
        }
    }
}

/// Listens on a TCP port and spawns one secure session task per inbound
/// connection.
pub struct Acceptor {
    listener: TcpListener,
    keypair: Arc<KeyPair>,
    handler: SessionHandler,
    error_handler: Option<SessionErrorHandler>,
    rng: RandomSource,
    config: AcceptorConfig,
}

impl Acceptor {
    /// Bind to `addr` and generate the long-lived keypair.
    ///
    /// # Errors
    ///
    /// Returns a socket error if binding fails, or a crypto error if key
    /// generation fails.
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        handler: SessionHandler,
        error_handler: Option<SessionErrorHandler>,
        rng: RandomSource,
        config: AcceptorConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        let keypair = Arc::new(KeyPair::generate(config.key_bits)?);
        info!(
            addr = %listener.local_addr()?,
            key_bits = config.key_bits,
            "acceptor listening"
        );
        Ok(Self {
            listener,
            keypair,
            handler,
            error_handler,
            rng,
            config,
        })
    }

    /// The bound local address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Block until one connection arrives, then spawn its session thread.
    ///
    /// The thread runs the server handshake and, on success, the user
    /// handler. Faults go to the error callback; this call only fails on
    /// accept-level socket errors.
    ///
    /// # Errors
    ///
    /// Returns the socket error from `accept`.
    pub fn accept_one(&self) -> Result<(), TransportError> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(self.config.no_delay)?;
        debug!(%peer, "accepted connection");

        let transport = Arc::new(SecureTransport::from_stream(stream, self.rng.clone()));
        let keypair = Arc::clone(&self.keypair);
        let handler = Arc::clone(&self.handler);
        let error_handler = self.error_handler.clone();

        std::thread::Builder::new()
            .name("veil-session".into())
            .spawn(move || run_session(transport, &keypair, &handler, error_handler.as_ref()))?;
        Ok(())
    }

    /// Accept connections until the listener errors.
    ///
    /// # Errors
    ///
    /// Returns the first accept-level socket error.
    pub fn run(&self) -> Result<(), TransportError> {
        loop {
            self.accept_one()?;
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("addr", &self.listener.local_addr().ok())
            .field("key_bits", &self.config.key_bits)
            .finish()
    }
}

/// Body of one session thread: handshake, then the user handler under a
/// panic guard.
fn run_session(
    transport: Arc<SecureTransport>,
    keypair: &KeyPair,
    handler: &SessionHandler,
    error_handler: Option<&SessionErrorHandler>,
) {
    if let Err(err) = server_handshake(&transport, keypair) {
        warn!(peer = ?transport.peer_addr(), error = %err, "server handshake failed");
        transport.disconnect();
        if let Some(cb) = error_handler {
            cb(err.into(), transport);
        }
        return;
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(Arc::clone(&transport))));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(peer = ?transport.peer_addr(), %message, "session function panicked");
        if let Some(cb) = error_handler {
            cb(TransportError::SessionPanic(message), transport);
        }
    }
}
