//! Session establishment: magic/timestamp exchange and hybrid key setup.
//!
//! ## Message Flow
//!
//! ```text
//! Server → Client: SessionHello        (40 bytes, clear)
//! Client → Server: SessionHelloReply   (24 bytes, clear; echoes magic + timestamp)
//! Server → Client: u64 length + PEM public key (NUL-terminated, clear)
//! Client → Server: u64 length + RSA-OAEP(key ‖ echo)
//! Client → Server: echo                (block-cipher encrypted)
//! ```
//!
//! The client generates the symmetric key and echo bytes from the
//! transport's injected random source, wraps them with the server's public
//! key, installs the key, and sends the echo through the freshly keyed
//! cipher. The server decrypts the envelope, installs the key, and compares
//! the echo: key confirmation, not authentication.
//!
//! The timestamp is echoed verbatim and compared for equality; it is never
//! validated against a clock, so it amounts to a second magic value.

use crate::error::HandshakeError;
use crate::secure::SecureTransport;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use veil_crypto::{ExchangeKey, KeyPair, KeyRole, SymmetricKey, SYMMETRIC_KEY_LEN};
use zeroize::Zeroizing;

/// 16-byte ASCII magic identifying a VEIL endpoint.
pub const HANDSHAKE_MAGIC: [u8; 16] = *b"VEIL-SECURE-NET\0";

/// Echo length requested by the server.
pub const ECHO_LEN: usize = 64;

/// Encoded size of [`SessionHello`].
pub const HELLO_SIZE: usize = 40;

/// Encoded size of [`SessionHelloReply`].
pub const HELLO_REPLY_SIZE: usize = 24;

/// Upper bound accepted for the peer's PEM public key on the wire.
const PEM_LEN_LIMIT: u64 = 2048;

/// Opening message, sent by the server in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHello {
    /// Endpoint magic; a mismatch terminates the handshake.
    pub magic: [u8; 16],
    /// Requested symmetric key length in bytes.
    pub key_len: u16,
    /// Requested echo length in bytes.
    pub echo_len: u16,
    /// Server wall-clock seconds, echoed back verbatim.
    pub local_time: u64,
    /// Client IPv4 address as the server sees it (0 for IPv6 peers).
    pub peer_ip: u32,
}

impl SessionHello {
    /// Encode to the fixed 40-byte wire layout (little-endian fields at
    /// natural-alignment offsets; the gaps are zero).
    #[must_use]
    pub fn encode(&self) -> [u8; HELLO_SIZE] {
        let mut buf = [0u8; HELLO_SIZE];
        buf[..16].copy_from_slice(&self.magic);
        buf[16..18].copy_from_slice(&self.key_len.to_le_bytes());
        buf[18..20].copy_from_slice(&self.echo_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.local_time.to_le_bytes());
        buf[32..36].copy_from_slice(&self.peer_ip.to_le_bytes());
        buf
    }

    /// Decode from the 40-byte wire layout.
    #[must_use]
    pub fn decode(buf: &[u8; HELLO_SIZE]) -> Self {
        Self {
            magic: buf[..16].try_into().expect("fixed slice"),
            key_len: u16::from_le_bytes([buf[16], buf[17]]),
            echo_len: u16::from_le_bytes([buf[18], buf[19]]),
            local_time: u64::from_le_bytes(buf[24..32].try_into().expect("fixed slice")),
            peer_ip: u32::from_le_bytes(buf[32..36].try_into().expect("fixed slice")),
        }
    }
}

/// Client's answer to [`SessionHello`], also in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHelloReply {
    /// Endpoint magic.
    pub magic: [u8; 16],
    /// The server's timestamp, returned unchanged.
    pub local_time: u64,
}

impl SessionHelloReply {
    /// Encode to the fixed 24-byte wire layout.
    #[must_use]
    pub fn encode(&self) -> [u8; HELLO_REPLY_SIZE] {
        let mut buf = [0u8; HELLO_REPLY_SIZE];
        buf[..16].copy_from_slice(&self.magic);
        buf[16..24].copy_from_slice(&self.local_time.to_le_bytes());
        buf
    }

    /// Decode from the 24-byte wire layout.
    #[must_use]
    pub fn decode(buf: &[u8; HELLO_REPLY_SIZE]) -> Self {
        Self {
            magic: buf[..16].try_into().expect("fixed slice"),
            local_time: u64::from_le_bytes(buf[16..24].try_into().expect("fixed slice")),
        }
    }
}

/// Server wall time in whole seconds.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Peer IPv4 address as a host integer; IPv6 peers report 0.
fn peer_ipv4(addr: Option<SocketAddr>) -> u32 {
    match addr {
        Some(SocketAddr::V4(v4)) => u32::from(*v4.ip()),
        _ => 0,
    }
}

/// Run the server side of the handshake over an accepted transport.
///
/// On success the transport has the session key installed and the echo has
/// been verified against the decrypted envelope.
///
/// # Errors
///
/// Any verification failure or short transfer aborts the handshake; the
/// caller must not treat the connection as secure afterwards.
pub fn server_handshake(
    transport: &SecureTransport,
    keypair: &KeyPair,
) -> Result<(), HandshakeError> {
    let hello = SessionHello {
        magic: HANDSHAKE_MAGIC,
        key_len: SYMMETRIC_KEY_LEN as u16,
        echo_len: ECHO_LEN as u16,
        local_time: unix_now(),
        peer_ip: peer_ipv4(transport.peer_addr()),
    };
    if transport.write_raw(&hello.encode()) < HELLO_SIZE {
        return Err(HandshakeError::Truncated("hello"));
    }

    let mut reply_buf = [0u8; HELLO_REPLY_SIZE];
    if transport.read_raw(&mut reply_buf) < HELLO_REPLY_SIZE {
        return Err(HandshakeError::Truncated("hello reply"));
    }
    let reply = SessionHelloReply::decode(&reply_buf);
    if reply.magic != HANDSHAKE_MAGIC {
        return Err(HandshakeError::MagicMismatch);
    }
    if reply.local_time != hello.local_time {
        return Err(HandshakeError::TimestampMismatch);
    }

    // Publish the encrypting half, NUL-terminated like any other PEM file.
    let mut pem = keypair.public.to_pem()?.into_bytes();
    pem.push(0);
    if transport.write_raw(&(pem.len() as u64).to_le_bytes()) < 8
        || transport.write_raw(&pem) < pem.len()
    {
        return Err(HandshakeError::Truncated("public key"));
    }

    let mut len_buf = [0u8; 8];
    if transport.read_raw(&mut len_buf) < 8 {
        return Err(HandshakeError::Truncated("envelope length"));
    }
    let wrapped_len = u64::from_le_bytes(len_buf);
    if wrapped_len as usize > keypair.public.max_ciphertext_len() {
        return Err(HandshakeError::WrappedKeyOversize(wrapped_len));
    }
    let mut wrapped = vec![0u8; wrapped_len as usize];
    if transport.read_raw(&mut wrapped) < wrapped.len() {
        return Err(HandshakeError::Truncated("envelope"));
    }

    let envelope = Zeroizing::new(keypair.private.decrypt(&wrapped)?);
    let expected = SYMMETRIC_KEY_LEN + ECHO_LEN;
    if envelope.len() < expected {
        return Err(HandshakeError::EnvelopeTooShort {
            expected,
            actual: envelope.len(),
        });
    }
    let key = SymmetricKey::new(&envelope[..SYMMETRIC_KEY_LEN])?;
    transport.install_key(key);

    let mut echo = [0u8; ECHO_LEN];
    if transport.read_secure(&mut echo, ECHO_LEN) < ECHO_LEN {
        return Err(HandshakeError::Truncated("echo"));
    }
    if echo[..] != envelope[SYMMETRIC_KEY_LEN..expected] {
        return Err(HandshakeError::EchoMismatch);
    }

    debug!(peer = ?transport.peer_addr(), "server handshake complete");
    Ok(())
}

/// Run the client side of the handshake. Called by
/// [`SecureTransport::connect`] right after the TCP connection opens.
///
/// # Errors
///
/// Any verification failure or short transfer aborts the handshake.
pub(crate) fn client_handshake(transport: &SecureTransport) -> Result<(), HandshakeError> {
    let mut hello_buf = [0u8; HELLO_SIZE];
    if transport.read_raw(&mut hello_buf) < HELLO_SIZE {
        return Err(HandshakeError::Truncated("hello"));
    }
    let hello = SessionHello::decode(&hello_buf);
    if hello.magic != HANDSHAKE_MAGIC {
        return Err(HandshakeError::MagicMismatch);
    }

    let reply = SessionHelloReply {
        magic: HANDSHAKE_MAGIC,
        local_time: hello.local_time,
    };
    if transport.write_raw(&reply.encode()) < HELLO_REPLY_SIZE {
        return Err(HandshakeError::Truncated("hello reply"));
    }

    let mut len_buf = [0u8; 8];
    if transport.read_raw(&mut len_buf) < 8 {
        return Err(HandshakeError::Truncated("public key length"));
    }
    let pem_len = u64::from_le_bytes(len_buf);
    if pem_len == 0 || pem_len > PEM_LEN_LIMIT {
        return Err(HandshakeError::PublicKeyOversize(pem_len));
    }
    let mut pem = vec![0u8; pem_len as usize];
    if transport.read_raw(&mut pem) < pem.len() {
        return Err(HandshakeError::Truncated("public key"));
    }
    while pem.last() == Some(&0) {
        pem.pop();
    }
    let pem = std::str::from_utf8(&pem).map_err(|_| HandshakeError::PemNotText)?;
    let public = ExchangeKey::from_pem(pem, KeyRole::Public)?;

    let key_len = hello.key_len as usize;
    let echo_len = hello.echo_len as usize;
    if key_len + echo_len > public.max_plaintext_len() {
        return Err(HandshakeError::EnvelopeOverCapacity {
            needed: key_len + echo_len,
            max: public.max_plaintext_len(),
        });
    }

    // Generate key ‖ echo from the injected source, wrap it, and install the
    // key before the echo goes out through the cipher.
    let mut envelope = Zeroizing::new(vec![0u8; key_len + echo_len]);
    (transport.random_source())(&mut envelope[..]);
    let key = SymmetricKey::new(&envelope[..key_len])?;
    let wrapped = public.encrypt(&envelope)?;
    transport.install_key(key);

    if transport.write_raw(&(wrapped.len() as u64).to_le_bytes()) < 8
        || transport.write_raw(&wrapped) < wrapped.len()
    {
        return Err(HandshakeError::Truncated("envelope"));
    }

    let mut echo = vec![0u8; veil_crypto::padded_len(echo_len)];
    echo[..echo_len].copy_from_slice(&envelope[key_len..]);
    if transport.write_secure(&mut echo, echo_len) < echo_len {
        return Err(HandshakeError::Truncated("echo"));
    }

    debug!(peer = ?transport.peer_addr(), "client handshake complete");
    Ok(())
}
