//! Crypto provider contracts consumed by the vault core.
//!
//! Concrete providers (HSMs, KMS bridges) live outside this crate; the core
//! only sees the trait objects below. [`software`] ships a pure-Rust provider
//! suitable for development and the test suite.

pub mod software;

use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::error::TokenResult;

/// An encryption key handle.
pub trait EncKey: Send + Sync {
    /// Encrypts a byte sequence.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Cryptography`](crate::TokenError::Cryptography)
    /// when the key cannot be used.
    fn encrypt(&self, data: &[u8]) -> TokenResult<Vec<u8>>;

    /// Decrypts a byte sequence.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Cryptography`](crate::TokenError::Cryptography)
    /// on authentication failure or malformed ciphertext.
    fn decrypt(&self, data: &[u8]) -> TokenResult<Vec<u8>>;

    /// Whether ciphertext produced by this key self-describes its key
    /// version. Versioned keys need no per-row key name to decrypt.
    fn is_versioned(&self) -> bool {
        false
    }

    /// The key's logical name.
    fn name(&self) -> &str;
}

/// A MAC key handle.
pub trait MacKey: Send + Sync {
    /// Computes the keyed hash of a byte sequence.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Cryptography`](crate::TokenError::Cryptography)
    /// when the key cannot be used.
    fn hash(&self, data: &[u8]) -> TokenResult<Vec<u8>>;

    /// Verifies `expected` against the hash of `data` in constant time.
    fn verify(&self, data: &[u8], expected: &[u8]) -> bool {
        self.hash(data)
            .is_ok_and(|computed| computed.ct_eq(expected).into())
    }

    /// The key's logical name.
    fn name(&self) -> &str;
}

/// A source of keys and randomness.
pub trait Provider: Send + Sync {
    /// Resolves an encryption key by name. `None` when the name is unknown.
    fn enc_key(&self, name: &str) -> Option<Arc<dyn EncKey>>;

    /// Resolves a MAC key by name. `None` when the name is unknown.
    fn mac_key(&self, name: &str) -> Option<Arc<dyn MacKey>>;

    /// Fills `buf` with random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Cryptography`](crate::TokenError::Cryptography)
    /// when the entropy source is unavailable.
    fn random(&self, buf: &mut [u8]) -> TokenResult<()>;
}
