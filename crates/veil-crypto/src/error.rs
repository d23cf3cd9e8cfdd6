//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Symmetric key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// Plaintext exceeds what a single asymmetric operation can wrap
    #[error("plaintext of {actual} bytes exceeds key capacity of {max} bytes")]
    PlaintextTooLarge {
        /// Maximum plaintext length for this key
        max: usize,
        /// Offered plaintext length
        actual: usize,
    },

    /// Asymmetric encrypt/decrypt failed
    #[error("asymmetric operation failed: {0}")]
    Asymmetric(#[from] rsa::Error),

    /// PEM parsing or serialization failed
    #[error("PEM error: {0}")]
    Pem(String),

    /// Operation requires the other half of the keypair
    #[error("operation requires a {0:?} key")]
    WrongKeyRole(crate::keyx::KeyRole),

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
