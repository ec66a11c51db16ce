//! Pure-Rust crypto provider.
//!
//! Key material is derived deterministically from the key name, so resolving
//! the same name twice yields interchangeable handles. Unversioned ciphertext
//! is `nonce || AEAD`. Versioned ciphertext prepends a self-describing header
//! (format tag, key version, key name) so any versioned handle from the same
//! provider can decrypt by re-deriving from the header.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{EncKey, MacKey, Provider};
use crate::error::{TokenError, TokenResult};

const NONCE_SIZE: usize = 24;
const VERSIONED_TAG: u8 = 0x01;
const KEY_VERSION: u8 = 1;

fn crypto_err(message: &str) -> TokenError {
    TokenError::Cryptography(message.to_string())
}

/// Derives 32 bytes of key material from a domain label and key name.
fn derive_material(domain: &str, name: &str, version: u8) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update([version]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// An XChaCha20-Poly1305 encryption key derived from its name.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SoftwareEncKey {
    material: [u8; 32],
    #[zeroize(skip)]
    name: String,
    #[zeroize(skip)]
    versioned: bool,
}

impl SoftwareEncKey {
    fn new(name: &str, versioned: bool) -> Self {
        Self {
            material: derive_material("tokenvault:enc:", name, KEY_VERSION),
            name: name.to_string(),
            versioned,
        }
    }

    fn seal(material: &[u8; 32], data: &[u8]) -> TokenResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new_from_slice(material)
            .map_err(|_| crypto_err("key material length mismatch"))?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), data)
            .map_err(|_| crypto_err("encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(material: &[u8; 32], data: &[u8]) -> TokenResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(crypto_err("ciphertext too short"));
        }
        let cipher = XChaCha20Poly1305::new_from_slice(material)
            .map_err(|_| crypto_err("key material length mismatch"))?;
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| crypto_err("decryption failed"))
    }
}

impl std::fmt::Debug for SoftwareEncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareEncKey")
            .field("name", &self.name)
            .field("versioned", &self.versioned)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

impl EncKey for SoftwareEncKey {
    fn encrypt(&self, data: &[u8]) -> TokenResult<Vec<u8>> {
        if !self.versioned {
            return Self::seal(&self.material, data);
        }

        let name = self.name.as_bytes();
        let name_len =
            u8::try_from(name.len()).map_err(|_| crypto_err("key name too long to embed"))?;
        let mut out = Vec::with_capacity(3 + name.len());
        out.push(VERSIONED_TAG);
        out.push(KEY_VERSION);
        out.push(name_len);
        out.extend_from_slice(name);
        out.extend_from_slice(&Self::seal(&self.material, data)?);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> TokenResult<Vec<u8>> {
        if !self.versioned {
            return Self::open(&self.material, data);
        }

        // Versioned ciphertext names its own key; re-derive from the header.
        if data.len() < 3 || data[0] != VERSIONED_TAG {
            return Err(crypto_err("missing versioned ciphertext header"));
        }
        let version = data[1];
        let name_len = data[2] as usize;
        if data.len() < 3 + name_len {
            return Err(crypto_err("truncated versioned ciphertext header"));
        }
        let name = std::str::from_utf8(&data[3..3 + name_len])
            .map_err(|_| crypto_err("malformed key name in ciphertext"))?;
        let mut material = derive_material("tokenvault:enc:", name, version);
        let result = Self::open(&material, &data[3 + name_len..]);
        material.zeroize();
        result
    }

    fn is_versioned(&self) -> bool {
        self.versioned
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An HMAC-SHA-256 key derived from its name.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SoftwareMacKey {
    material: [u8; 32],
    #[zeroize(skip)]
    name: String,
}

impl SoftwareMacKey {
    fn new(name: &str) -> Self {
        Self {
            material: derive_material("tokenvault:mac:", name, KEY_VERSION),
            name: name.to_string(),
        }
    }
}

impl MacKey for SoftwareMacKey {
    fn hash(&self, data: &[u8]) -> TokenResult<Vec<u8>> {
        use hmac::Mac;
        let mut mac = <hmac::Hmac<Sha256> as hmac::Mac>::new_from_slice(&self.material)
            .map_err(|_| crypto_err("key material length mismatch"))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Provider handing out name-derived software keys.
///
/// `predictable_for` arms a deterministic randomness mode used by collision
/// tests: the next `n` calls to [`Provider::random`] fill zeros, after which
/// real randomness resumes.
pub struct SoftwareProvider {
    versioned_names: HashSet<String>,
    predictable_calls: Mutex<usize>,
}

impl SoftwareProvider {
    /// Creates a provider whose encryption keys are all unversioned.
    #[must_use]
    pub fn new() -> Self {
        Self {
            versioned_names: HashSet::new(),
            predictable_calls: Mutex::new(0),
        }
    }

    /// Creates a provider treating the given key names as versioned.
    #[must_use]
    pub fn with_versioned<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            versioned_names: names.into_iter().map(Into::into).collect(),
            predictable_calls: Mutex::new(0),
        }
    }

    /// Makes the next `calls` invocations of `random` return zeros.
    pub fn predictable_for(&self, calls: usize) {
        *self.predictable_calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = calls;
    }
}

impl Default for SoftwareProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for SoftwareProvider {
    fn enc_key(&self, name: &str) -> Option<Arc<dyn EncKey>> {
        if name.is_empty() {
            return None;
        }
        let versioned = self.versioned_names.contains(name);
        Some(Arc::new(SoftwareEncKey::new(name, versioned)))
    }

    fn mac_key(&self, name: &str) -> Option<Arc<dyn MacKey>> {
        if name.is_empty() {
            return None;
        }
        Some(Arc::new(SoftwareMacKey::new(name)))
    }

    fn random(&self, buf: &mut [u8]) -> TokenResult<()> {
        let mut remaining =
            self.predictable_calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *remaining > 0 {
            *remaining -= 1;
            buf.fill(0);
        } else {
            OsRng.fill_bytes(buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let provider = SoftwareProvider::new();
        let key = provider.enc_key("ENCKEY!!!").expect("key");
        let ciphertext = key.encrypt(b"6044342464567232").expect("encrypt");
        assert_ne!(ciphertext, b"6044342464567232");
        let plaintext = key.decrypt(&ciphertext).expect("decrypt");
        assert_eq!(plaintext, b"6044342464567232");
    }

    #[test]
    fn test_same_name_yields_interchangeable_handles() {
        let provider = SoftwareProvider::new();
        let first = provider.enc_key("KEY").expect("key");
        let second = provider.enc_key("KEY").expect("key");
        let ciphertext = first.encrypt(b"payload").expect("encrypt");
        assert_eq!(second.decrypt(&ciphertext).expect("decrypt"), b"payload");
    }

    #[test]
    fn test_different_names_do_not_decrypt() {
        let provider = SoftwareProvider::new();
        let first = provider.enc_key("A").expect("key");
        let second = provider.enc_key("B").expect("key");
        let ciphertext = first.encrypt(b"payload").expect("encrypt");
        match second.decrypt(&ciphertext) {
            Err(TokenError::Cryptography(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_versioned_ciphertext_self_describes() {
        let provider = SoftwareProvider::with_versioned(["NEWKEY"]);
        let new_key = provider.enc_key("NEWKEY").expect("key");
        assert!(new_key.is_versioned());

        let ciphertext = new_key.encrypt(b"payload").expect("encrypt");
        assert_eq!(ciphertext[0], VERSIONED_TAG);

        // A second versioned handle decrypts from the embedded header alone.
        let other = provider.enc_key("NEWKEY").expect("key");
        assert_eq!(other.decrypt(&ciphertext).expect("decrypt"), b"payload");
    }

    #[test]
    fn test_unversioned_key_rejects_garbage() {
        let provider = SoftwareProvider::new();
        let key = provider.enc_key("KEY").expect("key");
        match key.decrypt(b"short") {
            Err(TokenError::Cryptography(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_mac_is_deterministic() {
        let provider = SoftwareProvider::new();
        let key = provider.mac_key("MACKEY!!!").expect("key");
        let first = key.hash(b"value").expect("hash");
        let second = key.hash(b"value").expect("hash");
        assert_eq!(first, second);
        assert_ne!(first, key.hash(b"other").expect("hash"));
    }

    #[test]
    fn test_mac_verify() {
        let provider = SoftwareProvider::new();
        let key = provider.mac_key("MACKEY!!!").expect("key");
        let hash = key.hash(b"value").expect("hash");
        assert!(key.verify(b"value", &hash));
        assert!(!key.verify(b"other", &hash));
        assert!(!key.verify(b"value", &hash[1..]));
    }

    #[test]
    fn test_predictable_randomness_window() {
        let provider = SoftwareProvider::new();
        provider.predictable_for(2);

        let mut buf = [0xFF_u8; 8];
        provider.random(&mut buf).expect("random");
        assert_eq!(buf, [0u8; 8]);

        let mut buf = [0xFF_u8; 8];
        provider.random(&mut buf).expect("random");
        assert_eq!(buf, [0u8; 8]);

        // Window exhausted; a zero draw of this width is then vanishingly
        // unlikely.
        let mut buf = [0u8; 16];
        provider.random(&mut buf).expect("random");
        assert_ne!(buf, [0u8; 16]);
    }

    #[test]
    fn test_empty_key_name_is_unknown() {
        let provider = SoftwareProvider::new();
        assert!(provider.enc_key("").is_none());
        assert!(provider.mac_key("").is_none());
    }

    #[test]
    fn test_debug_redacts_material() {
        let key = SoftwareEncKey::new("KEY", false);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
    }
}
