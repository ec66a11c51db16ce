//! Vault metadata descriptors.

use std::sync::{Arc, OnceLock};

use tokenvault_db::Row;

use crate::crypto::{EncKey, MacKey, Provider};
use crate::error::{TokenError, TokenResult};

/// A vault descriptor shared between callers.
pub type SharedVault = Arc<VaultDescriptor>;

/// Resolved key handles for a vault.
#[derive(Clone)]
pub struct VaultKeys {
    /// The vault-current encryption key.
    pub enc: Arc<dyn EncKey>,
    /// The vault's MAC key.
    pub mac: Arc<dyn MacKey>,
}

/// Metadata identifying a vault.
///
/// Descriptors are immutable once constructed; key handles are resolved
/// lazily on the first keyed operation and memoized. A descriptor handed out
/// by the metadata cache carries a cleanup hook that clears its cache slot
/// when the last holder drops it.
pub struct VaultDescriptor {
    /// Token format id.
    pub format: u32,
    /// Vault name, unique.
    pub alias: String,
    /// Physical table name, unique.
    pub table: String,
    /// Name of the vault-current encryption key.
    pub enc_key_name: String,
    /// Name of the vault's MAC key.
    pub mac_key_name: String,
    /// Durable vaults return the existing entry when a value is tokenized
    /// twice; transactional vaults always mint a new token.
    pub durable: bool,
    /// Maximum raw-value length. Used at creation only.
    pub value_len: usize,

    keys: OnceLock<VaultKeys>,
    cleanup: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl VaultDescriptor {
    /// Builds a descriptor for vault creation.
    #[must_use]
    pub fn new(
        alias: impl Into<String>,
        table: impl Into<String>,
        enc_key_name: impl Into<String>,
        mac_key_name: impl Into<String>,
        format: u32,
        value_len: usize,
        durable: bool,
    ) -> Self {
        Self {
            format,
            alias: alias.into(),
            table: table.into(),
            enc_key_name: enc_key_name.into(),
            mac_key_name: mac_key_name.into(),
            durable,
            value_len,
            keys: OnceLock::new(),
            cleanup: None,
        }
    }

    /// Loads a descriptor from a metadata row.
    ///
    /// # Errors
    ///
    /// Returns a storage error when a column is missing.
    pub fn from_row(row: &Row) -> TokenResult<Self> {
        Ok(Self::new(
            row.text("ALIAS")?,
            row.text("TABLENAME")?,
            row.text("ENCKEY")?,
            row.text("MACKEY")?,
            u32::try_from(row.i64("FORMAT")?)
                .map_err(|_| TokenError::Storage("vault format out of range".to_string()))?,
            0,
            row.bool("DURABLE")?,
        ))
    }

    /// Attaches the cache-slot cleanup hook, fired when the descriptor drops.
    pub(crate) fn attach_cleanup(&mut self, cleanup: Box<dyn FnOnce() + Send + Sync>) {
        self.cleanup = Some(cleanup);
    }

    /// Resolves and memoizes the vault's key handles.
    ///
    /// # Errors
    ///
    /// `Cryptography` when the provider does not know a named key.
    pub fn keys(&self, provider: &dyn Provider) -> TokenResult<&VaultKeys> {
        if let Some(keys) = self.keys.get() {
            return Ok(keys);
        }
        let enc = provider.enc_key(&self.enc_key_name).ok_or_else(|| {
            TokenError::Cryptography(format!("error acquiring key: {}", self.enc_key_name))
        })?;
        let mac = provider.mac_key(&self.mac_key_name).ok_or_else(|| {
            TokenError::Cryptography(format!("error acquiring key: {}", self.mac_key_name))
        })?;
        Ok(self.keys.get_or_init(|| VaultKeys { enc, mac }))
    }
}

impl std::fmt::Debug for VaultDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultDescriptor")
            .field("format", &self.format)
            .field("alias", &self.alias)
            .field("table", &self.table)
            .field("enc_key_name", &self.enc_key_name)
            .field("mac_key_name", &self.mac_key_name)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

impl Drop for VaultDescriptor {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::crypto::software::SoftwareProvider;

    #[test]
    fn test_keys_are_memoized() {
        let provider = SoftwareProvider::new();
        let vault = VaultDescriptor::new("v", "v20_0_su", "ENC", "MAC", 0, 20, false);
        let first = vault.keys(&provider).expect("keys");
        let first_enc = Arc::as_ptr(&first.enc);
        let second = vault.keys(&provider).expect("keys");
        assert!(std::ptr::eq(first_enc.cast::<u8>(), Arc::as_ptr(&second.enc).cast::<u8>()));
    }

    #[test]
    fn test_unknown_key_name_is_a_crypto_error() {
        let provider = SoftwareProvider::new();
        let vault = VaultDescriptor::new("v", "t", "", "MAC", 0, 20, false);
        match vault.keys(&provider) {
            Err(TokenError::Cryptography(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_cleanup_runs_on_drop() {
        static FIRED: AtomicBool = AtomicBool::new(false);
        let mut vault = VaultDescriptor::new("v", "t", "ENC", "MAC", 0, 20, false);
        vault.cleanup = Some(Box::new(|| FIRED.store(true, Ordering::SeqCst)));
        drop(vault);
        assert!(FIRED.load(Ordering::SeqCst));
    }
}
