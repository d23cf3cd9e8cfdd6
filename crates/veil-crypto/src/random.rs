//! Random byte generation.
//!
//! All default randomness comes from the operating system CSPRNG. Components
//! that need randomness accept a [`RandomSource`] so tests can inject a
//! deterministic generator.

use crate::CryptoError;
use std::sync::Arc;

/// An injectable byte generator. Implementations fill the entire slice.
pub type RandomSource = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS generator is unavailable.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
}

/// The default [`RandomSource`], backed by the OS CSPRNG.
///
/// # Panics
///
/// The returned closure panics if the OS generator fails; key generation
/// without entropy has no sensible fallback.
#[must_use]
pub fn os_random() -> RandomSource {
    Arc::new(|buf| {
        getrandom::getrandom(buf).expect("OS random generator unavailable");
    })
}
