//! Error types for the transport layer.

use thiserror::Error;
use veil_crypto::CryptoError;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure (resolution, connect, option setting)
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Hostname resolved to no usable address
    #[error("no address found for {0}")]
    NoAddress(String),

    /// Secure session establishment failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// A user session function panicked
    #[error("session function panicked: {0}")]
    SessionPanic(String),
}

impl From<CryptoError> for TransportError {
    fn from(err: CryptoError) -> Self {
        Self::Handshake(HandshakeError::Crypto(err))
    }
}

/// Handshake-level errors. Any of these leaves the connection unusable;
/// callers must not treat the session as secure afterwards.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Peer sent a hello or reply with the wrong magic string
    #[error("handshake magic mismatch")]
    MagicMismatch,

    /// Peer echoed back a different timestamp than it was sent
    #[error("handshake timestamp mismatch")]
    TimestampMismatch,

    /// Advertised public key length exceeds the negotiation limit
    #[error("peer public key of {0} bytes exceeds the negotiation limit")]
    PublicKeyOversize(u64),

    /// Wrapped key envelope is larger than the keypair can have produced
    #[error("wrapped envelope of {0} bytes exceeds key capacity")]
    WrappedKeyOversize(u64),

    /// Key plus echo material does not fit in one asymmetric operation
    #[error("envelope of {needed} bytes exceeds key capacity of {max} bytes")]
    EnvelopeOverCapacity {
        /// Key plus echo length requested by the hello
        needed: usize,
        /// Largest plaintext the peer's public key can wrap
        max: usize,
    },

    /// Decrypted envelope is shorter than key plus echo
    #[error("decrypted envelope of {actual} bytes, expected {expected}")]
    EnvelopeTooShort {
        /// Key length plus echo length
        expected: usize,
        /// Decrypted length
        actual: usize,
    },

    /// Block-cipher echo did not match the envelope contents
    #[error("key confirmation echo mismatch")]
    EchoMismatch,

    /// The peer's PEM document was not valid UTF-8
    #[error("public key is not valid text")]
    PemNotText,

    /// A handshake read or write moved fewer bytes than required
    #[error("connection dropped during {0}")]
    Truncated(&'static str),

    /// Key parsing, wrapping, or unwrapping failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
