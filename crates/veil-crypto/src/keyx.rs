//! Hybrid key-exchange capability: RSA keypairs with OAEP wrapping and
//! PKCS#1 PEM import/export.
//!
//! The handshake uses a single asymmetric operation to wrap the symmetric
//! key and echo material; everything here is sized for that one envelope.
//! OAEP over SHA-1 bounds the plaintext at `modulus − 42` bytes.

use crate::CryptoError;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::pkcs8::LineEnding;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

/// OAEP overhead for SHA-1: two digests plus two bytes.
const OAEP_OVERHEAD: usize = 42;

/// Which half of a keypair a handle carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Encrypt-only half, safe to publish.
    Public,
    /// Decrypt half, never leaves the acceptor.
    Private,
}

enum KeyMaterial {
    Public(RsaPublicKey),
    Private(RsaPrivateKey),
}

/// One half of an asymmetric keypair.
pub struct ExchangeKey {
    material: KeyMaterial,
}

/// A generated keypair. The private half stays with the acceptor for the
/// lifetime of the listener; the public half travels in PEM form.
pub struct KeyPair {
    /// Encrypting half.
    pub public: ExchangeKey,
    /// Decrypting half.
    pub private: ExchangeKey,
}

impl KeyPair {
    /// Generate a fresh keypair with a `bits`-sized modulus.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Asymmetric`] if generation fails.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self {
            public: ExchangeKey {
                material: KeyMaterial::Public(public),
            },
            private: ExchangeKey {
                material: KeyMaterial::Private(private),
            },
        })
    }
}

impl ExchangeKey {
    /// Parse a PEM-encoded key of the given role.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Pem`] when the document does not parse as the
    /// requested role.
    pub fn from_pem(pem: &str, role: KeyRole) -> Result<Self, CryptoError> {
        let material = match role {
            KeyRole::Public => KeyMaterial::Public(
                RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))?,
            ),
            KeyRole::Private => KeyMaterial::Private(
                RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))?,
            ),
        };
        Ok(Self { material })
    }

    /// Serialize to PKCS#1 PEM.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Pem`] if encoding fails.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        match &self.material {
            KeyMaterial::Public(key) => key
                .to_pkcs1_pem(LineEnding::LF)
                .map_err(|e| CryptoError::Pem(e.to_string())),
            KeyMaterial::Private(key) => key
                .to_pkcs1_pem(LineEnding::LF)
                .map(|pem| pem.to_string())
                .map_err(|e| CryptoError::Pem(e.to_string())),
        }
    }

    /// Role of this handle.
    #[must_use]
    pub fn role(&self) -> KeyRole {
        match self.material {
            KeyMaterial::Public(_) => KeyRole::Public,
            KeyMaterial::Private(_) => KeyRole::Private,
        }
    }

    /// Largest plaintext a single [`encrypt`](Self::encrypt) can wrap.
    #[must_use]
    pub fn max_plaintext_len(&self) -> usize {
        self.modulus_len().saturating_sub(OAEP_OVERHEAD)
    }

    /// Size of the ciphertext produced by [`encrypt`](Self::encrypt).
    #[must_use]
    pub fn max_ciphertext_len(&self) -> usize {
        self.modulus_len()
    }

    /// Encrypt a single envelope with the public half.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::WrongKeyRole`] on a private handle,
    /// [`CryptoError::PlaintextTooLarge`] past the OAEP bound, and
    /// [`CryptoError::Asymmetric`] if the operation itself fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let KeyMaterial::Public(key) = &self.material else {
            return Err(CryptoError::WrongKeyRole(KeyRole::Public));
        };
        if plaintext.len() > self.max_plaintext_len() {
            return Err(CryptoError::PlaintextTooLarge {
                max: self.max_plaintext_len(),
                actual: plaintext.len(),
            });
        }
        Ok(key.encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha1>(), plaintext)?)
    }

    /// Decrypt a single envelope with the private half.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::WrongKeyRole`] on a public handle and
    /// [`CryptoError::Asymmetric`] if decryption fails.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let KeyMaterial::Private(key) = &self.material else {
            return Err(CryptoError::WrongKeyRole(KeyRole::Private));
        };
        Ok(key.decrypt(Oaep::new::<Sha1>(), ciphertext)?)
    }

    fn modulus_len(&self) -> usize {
        match &self.material {
            KeyMaterial::Public(key) => key.size(),
            KeyMaterial::Private(key) => key.size(),
        }
    }
}

impl std::fmt::Debug for ExchangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeKey")
            .field("role", &self.role())
            .field("modulus_len", &self.modulus_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Small modulus keeps test keygen fast; production callers choose.
    const TEST_BITS: usize = 1024;

    fn pair() -> KeyPair {
        KeyPair::generate(TEST_BITS).unwrap()
    }

    #[test]
    fn wrap_and_unwrap_envelope() {
        let pair = pair();
        let envelope = [0x5Au8; 96];

        let wrapped = pair.public.encrypt(&envelope).unwrap();
        assert_eq!(wrapped.len(), pair.public.max_ciphertext_len());

        let unwrapped = pair.private.decrypt(&wrapped).unwrap();
        assert_eq!(unwrapped, envelope);
    }

    #[test]
    fn plaintext_bound_is_modulus_minus_overhead() {
        let pair = pair();
        assert_eq!(pair.public.max_plaintext_len(), 1024 / 8 - 42);

        let too_big = vec![0u8; pair.public.max_plaintext_len() + 1];
        assert!(matches!(
            pair.public.encrypt(&too_big),
            Err(CryptoError::PlaintextTooLarge { .. })
        ));
    }

    #[test]
    fn pem_round_trip_public() {
        let pair = pair();
        let pem = pair.public.to_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN RSA PUBLIC KEY-----"));

        let reloaded = ExchangeKey::from_pem(&pem, KeyRole::Public).unwrap();
        let wrapped = reloaded.encrypt(b"portable").unwrap();
        assert_eq!(pair.private.decrypt(&wrapped).unwrap(), b"portable");
    }

    #[test]
    fn roles_are_enforced() {
        let pair = pair();
        assert_eq!(pair.public.role(), KeyRole::Public);
        assert_eq!(pair.private.role(), KeyRole::Private);

        assert!(matches!(
            pair.private.encrypt(b"x"),
            Err(CryptoError::WrongKeyRole(KeyRole::Public))
        ));
        assert!(matches!(
            pair.public.decrypt(b"x"),
            Err(CryptoError::WrongKeyRole(KeyRole::Private))
        ));
    }
}
