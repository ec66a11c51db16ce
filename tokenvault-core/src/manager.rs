//! The token manager: tokenize/detokenize and the surrounding flows.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use crate::crypto::{EncKey, Provider};
use crate::entry::TokenEntry;
use crate::error::{TokenError, TokenResult};
use crate::generator::{self, Generator};
use crate::status::Status;
use crate::storage::TokenDb;
use crate::vault::{SharedVault, VaultDescriptor, VaultKeys};

const MAX_INSERT_ATTEMPTS: usize = 10;

/// Orchestrates vault operations over a crypto provider and the storage
/// engine. Cheap to share; all operations take `&self`.
pub struct TokenManager {
    provider: Arc<dyn Provider>,
    storage: Arc<TokenDb>,
}

impl TokenManager {
    /// Creates a manager over a crypto provider and storage engine.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, storage: Arc<TokenDb>) -> Self {
        Self { provider, storage }
    }

    /// Registers a token generator for a format id, process-wide.
    ///
    /// Returns `false` without replacing anything when the id is taken.
    pub fn register_generator(id: u32, generator: Generator) -> bool {
        generator::register(id, generator)
    }

    fn vault_info(&self, name: &str) -> TokenResult<(SharedVault, VaultKeys)> {
        trace!("getting vault info for {name}");
        let vault = self.storage.get_vault(name)?;
        let keys = vault.keys(self.provider.as_ref())?.clone();
        Ok((vault, keys))
    }

    fn entry_key(
        &self,
        vault_key: &Arc<dyn EncKey>,
        entry_key_name: &str,
    ) -> TokenResult<Arc<dyn EncKey>> {
        if entry_key_name.is_empty() {
            return Ok(Arc::clone(vault_key));
        }
        self.provider.enc_key(entry_key_name).ok_or_else(|| {
            TokenError::Cryptography(format!("error acquiring key: {entry_key_name}"))
        })
    }

    fn decrypt_value(key: &Arc<dyn EncKey>, crypt: &[u8]) -> TokenResult<String> {
        let plain = key.decrypt(crypt)?;
        String::from_utf8(plain)
            .map_err(|_| TokenError::Cryptography("decrypted value is not UTF-8".to_string()))
    }

    /// Replaces a value with a surrogate token, storing the entry in the
    /// vault.
    ///
    /// A durable vault returns the existing entry when the value was already
    /// tokenized. The optional `hint` contributes a caller-chosen token (used
    /// verbatim when non-empty), the expiration, and the properties. On a
    /// unique-token collision, the token is regenerated and the insert
    /// retried, bounded at ten total attempts.
    ///
    /// # Errors
    ///
    /// `NoVault`, generator errors, `Cryptography`, and `Storage` (including
    /// exhausted collision retries).
    pub fn tokenize(
        &self,
        vault: &str,
        value: &str,
        hint: Option<&TokenEntry>,
    ) -> TokenResult<TokenEntry> {
        let (vault_info, keys) = self.vault_info(vault)?;

        info!(
            "preparing to tokenize value for {vault} a {} vault",
            if vault_info.durable { "durable" } else { "transactional" }
        );

        if vault_info.durable {
            info!("retrieving existing token from vault {vault}");
            let mut entries = self.retrieve(vault, value)?;
            if !entries.is_empty() {
                let existing = entries.swap_remove(0);
                info!("successfully tokenized value for vault {vault}: {}", existing.token);
                return Ok(existing);
            }
        }

        let mut rc = TokenEntry::default();
        if let Some(hint) = hint {
            if !hint.token.is_empty() {
                debug!("using supplied token for vault {vault}");
                rc.token = hint.token.clone();
            }
            rc.expiration = hint.expiration;
            rc.properties = hint.properties.clone();
        }

        if rc.token.is_empty() {
            trace!("generating token for vault {vault}");
            let mut mask = String::new();
            rc.token = self.generate(&vault_info, value, Some(&mut mask))?;
            rc.mask = mask;
        }

        rc.value = value.to_string();

        trace!("hashing value for token {} from vault {vault}", rc.token);
        rc.hmac = keys.mac.hash(value.as_bytes())?;

        trace!("encrypting value for token {} from vault {vault}", rc.token);
        rc.crypt = keys.enc.encrypt(value.as_bytes())?;

        if !keys.enc.is_versioned() {
            trace!("saving unversioned key for {} from {vault}", rc.token);
            rc.enc_key = vault_info.enc_key_name.clone();
        }

        let mut attempt = 0;
        loop {
            let Err(err) = self.storage.insert(&vault_info.table, &rc) else {
                break;
            };
            warn!("failed to insert token {} into vault {vault}: {err}", rc.token);

            let message = err.to_string().to_uppercase();
            let mut is_token_dup = message.contains("UNIQUE") && message.contains("TOKEN");

            if !is_token_dup {
                debug!(
                    "error on {vault} for {} did not identify a duplicate entry, performing lookup",
                    rc.token
                );
                is_token_dup = !self.storage.get(&vault_info.table, &rc.token)?.is_empty();
            }

            if !is_token_dup {
                debug!("{} is not a duplicate for vault {vault}", rc.token);
                return Err(err);
            }

            attempt += 1;
            if attempt >= MAX_INSERT_ATTEMPTS {
                warn!("maximum retries for tokenize operation failed against vault {vault}");
                return Err(err);
            }

            info!("regenerating token for vault {vault}");
            rc.token = self.generate(&vault_info, value, None)?;
        }

        info!("successfully tokenized value for vault {vault}: {}", rc.token);
        Ok(rc)
    }

    /// Recovers the value behind a token.
    ///
    /// An unknown token yields an empty entry. The entry's own key name wins
    /// over the vault-current key when set.
    ///
    /// # Errors
    ///
    /// `NoVault`, `Cryptography`, and `Storage`.
    pub fn detokenize(&self, vault: &str, token: &str) -> TokenResult<TokenEntry> {
        info!("detokenizing value for vault {vault} token {token}");
        let (vault_info, keys) = self.vault_info(vault)?;

        let mut entry = self.storage.get(&vault_info.table, token)?;
        let key = self.entry_key(&keys.enc, &entry.enc_key)?;

        if !entry.crypt.is_empty() {
            trace!("decrypting value for vault {vault} token {token}");
            entry.value = Self::decrypt_value(&key, &entry.crypt)?;
        }

        info!("successfully retrieved value for vault {vault} token {token}");
        Ok(entry)
    }

    /// Finds every entry holding a value, by keyed hash.
    ///
    /// # Errors
    ///
    /// `NoVault`, `Cryptography`, and `Storage`.
    pub fn retrieve(&self, vault: &str, value: &str) -> TokenResult<Vec<TokenEntry>> {
        info!("performing token lookup by value for vault {vault}");
        let (vault_info, keys) = self.vault_info(vault)?;

        trace!("hashing value for lookup in vault {vault}");
        let hmac = keys.mac.hash(value.as_bytes())?;
        let mut entries = self.storage.get_by_hmac(&vault_info.table, &hmac)?;

        let mut resolved: HashMap<String, Arc<dyn EncKey>> = HashMap::new();
        for entry in &mut entries {
            if entry.crypt.is_empty() {
                continue;
            }
            let key = if entry.enc_key.is_empty() {
                Arc::clone(&keys.enc)
            } else if let Some(key) = resolved.get(&entry.enc_key) {
                Arc::clone(key)
            } else {
                trace!("getting encryption key for vault {vault} token {}", entry.token);
                let key = self.entry_key(&keys.enc, &entry.enc_key)?;
                resolved.insert(entry.enc_key.clone(), Arc::clone(&key));
                key
            };

            trace!("decrypting value for vault {vault} token {}", entry.token);
            entry.value = Self::decrypt_value(&key, &entry.crypt)?;
        }

        info!("successfully retrieved {} values from vault {vault}", entries.len());
        Ok(entries)
    }

    /// Destroys a token, returning the removed entry with its value
    /// decrypted so the caller can confirm what was destroyed.
    ///
    /// # Errors
    ///
    /// `NoVault`, `Cryptography`, and `Storage` (including a missing row).
    pub fn remove(&self, vault: &str, token: &str) -> TokenResult<TokenEntry> {
        info!("removing token {token} from vault {vault}");
        let (vault_info, keys) = self.vault_info(vault)?;

        let mut entry = self.storage.remove_token(&vault_info.table, token)?;
        let key = self.entry_key(&keys.enc, &entry.enc_key)?;

        if !entry.crypt.is_empty() {
            trace!("decrypting value for vault {vault} token {}", entry.token);
            entry.value = Self::decrypt_value(&key, &entry.crypt)?;
        }

        info!("successfully removed {token} from vault {vault}");
        Ok(entry)
    }

    /// Updates an entry, keyed by its token.
    ///
    /// A non-empty `value` re-hashes and re-encrypts under the vault-current
    /// key. Only supplied fields are written; empty fields are left alone.
    /// The updated row is re-read and returned.
    ///
    /// # Errors
    ///
    /// `NoVault`, `Cryptography`, and `Storage` (including a missing row).
    pub fn update(&self, vault: &str, entry: &TokenEntry) -> TokenResult<TokenEntry> {
        info!("updating token {} from vault {vault}", entry.token);
        let (vault_info, keys) = self.vault_info(vault)?;

        let mut rc = TokenEntry {
            token: entry.token.clone(),
            expiration: entry.expiration,
            properties: entry.properties.clone(),
            ..TokenEntry::default()
        };

        if !entry.value.is_empty() {
            trace!("setting new value for vault {vault} token {}", entry.token);

            if !keys.enc.is_versioned() {
                trace!("saving unversioned key for {} from {vault}", rc.token);
                rc.enc_key = vault_info.enc_key_name.clone();
            }

            trace!("hashing value for token {} from vault {vault}", rc.token);
            rc.hmac = keys.mac.hash(entry.value.as_bytes())?;

            trace!("encrypting value for token {} from vault {vault}", rc.token);
            rc.crypt = keys.enc.encrypt(entry.value.as_bytes())?;
            rc.value = entry.value.clone();
        }

        self.storage.update(&vault_info.table, &mut rc).inspect_err(|err| {
            debug!("{err}");
        })?;

        info!("successfully updated {} from vault {vault}", entry.token);
        Ok(rc)
    }

    /// Searches a vault. Values are hashed into HMAC filters; returned
    /// entries are decrypted.
    ///
    /// # Errors
    ///
    /// `NoVault`, `Cryptography`, and `Storage`.
    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &self,
        vault: &str,
        tokens: &[String],
        values: &[String],
        expirations: &[std::time::SystemTime],
        sort_field: &str,
        sort_asc: bool,
        offset: usize,
        limit: usize,
        record_count: Option<&mut usize>,
    ) -> TokenResult<Vec<TokenEntry>> {
        info!("performing query against vault {vault}");
        let (vault_info, keys) = self.vault_info(vault)?;

        let hmacs = values
            .iter()
            .map(|value| keys.mac.hash(value.as_bytes()))
            .collect::<TokenResult<Vec<_>>>()?;

        let mut entries = self.storage.query(
            &vault_info.table,
            tokens,
            &hmacs,
            expirations,
            sort_field,
            sort_asc,
            offset,
            limit,
            record_count,
        )?;

        for entry in &mut entries {
            if entry.crypt.is_empty() {
                continue;
            }
            let key = self.entry_key(&keys.enc, &entry.enc_key)?;
            trace!("decrypting entry for token {} from vault {vault}", entry.token);
            entry.value = Self::decrypt_value(&key, &entry.crypt)?;
        }

        info!("successfully found {} entries from querying vault {vault}", entries.len());
        Ok(entries)
    }

    /// Generic service status: a crypto randomness probe, then a storage
    /// probe.
    #[must_use]
    pub fn status(&self) -> Status {
        info!("performing generic status using provider random");
        let mut probe = [0u8; 1];
        if self.provider.random(&mut probe).is_err() {
            error!("generic status check failed: crypto");
            return Status::InoperativeCrypto;
        }

        info!("performing generic status using database test");
        if self.storage.test() {
            info!("generic status check passed");
            return Status::Operational;
        }

        error!("generic status check failed: database");
        Status::InoperativeDb
    }

    /// Per-vault status: probes the vault's own encryption key, then
    /// storage.
    ///
    /// # Errors
    ///
    /// `NoVault` and `Cryptography` when the vault or its keys cannot be
    /// resolved.
    pub fn vault_status(&self, vault: &str) -> TokenResult<Status> {
        info!("performing status using crypto keys for vault {vault}");
        let (_, keys) = self.vault_info(vault)?;

        if keys.enc.encrypt(vault.as_bytes()).is_err() {
            error!("status check for vault {vault} failed: crypto");
            return Ok(Status::InoperativeCrypto);
        }

        if self.storage.test() {
            info!("vault {vault} status check passed");
            return Ok(Status::Operational);
        }

        error!("status check for vault {vault} failed: database");
        Ok(Status::InoperativeDb)
    }

    /// Creates a vault. An empty `table` derives the physical name from the
    /// alias, value length, format, and durability.
    ///
    /// # Errors
    ///
    /// `InvalidAlias` for all-digit aliases (their derived table names are
    /// ambiguous); storage errors propagate.
    #[allow(clippy::too_many_arguments)]
    pub fn create_vault(
        &self,
        alias: &str,
        enc_key_name: &str,
        mac_key_name: &str,
        format: u32,
        value_len: usize,
        durable: bool,
        table: &str,
    ) -> TokenResult<bool> {
        if alias.is_empty() || alias.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TokenError::InvalidAlias(alias.to_string()));
        }

        let table = if table.is_empty() {
            format!("{alias}{value_len}_{format}_{}", if durable { "mu" } else { "su" })
        } else {
            table.to_string()
        };

        let vault = VaultDescriptor::new(
            alias,
            table,
            enc_key_name,
            mac_key_name,
            format,
            value_len,
            durable,
        );
        self.storage.create_vault(&vault)
    }

    /// Rotates a vault's encryption key.
    ///
    /// Shallow mode (or an unversioned new key) repoints the vault's current
    /// key. Deep mode re-encrypts every row under the new key in one
    /// transaction, preserving the versioned/unversioned distinction: rows
    /// that carried a key name get the new name for an unversioned key and
    /// are cleared for a versioned one.
    ///
    /// Returns `false` when the deep pass failed and was rolled back.
    ///
    /// # Errors
    ///
    /// `NoVault` when the vault is unknown; `Cryptography` when the new key
    /// cannot be resolved.
    pub fn rekey_vault(&self, vault: &str, enc_key_name: &str, deep: bool) -> TokenResult<bool> {
        let vault_info = self.storage.get_vault(vault)?;

        let new_key = self.provider.enc_key(enc_key_name).ok_or_else(|| {
            TokenError::Cryptography(format!("error acquiring key: {enc_key_name}"))
        })?;

        if !deep || !new_key.is_versioned() {
            let rc = self.storage.update_key(&vault_info, enc_key_name)?;
            if !deep {
                return Ok(rc);
            }
        }

        let row_enc_key = if new_key.is_versioned() { "" } else { enc_key_name };

        let mut resolved: HashMap<String, Arc<dyn EncKey>> = HashMap::new();
        resolved.insert(enc_key_name.to_string(), Arc::clone(&new_key));

        let provider = Arc::clone(&self.provider);
        let recrypt = move |src_key_name: &str, crypt: &[u8]| -> TokenResult<Vec<u8>> {
            let src_key = if let Some(key) = resolved.get(src_key_name) {
                Arc::clone(key)
            } else {
                let key = provider.enc_key(src_key_name).ok_or_else(|| {
                    TokenError::Cryptography(format!("unable to acquire encryption key {src_key_name}"))
                })?;
                resolved.insert(src_key_name.to_string(), Arc::clone(&key));
                key
            };

            let plain = src_key.decrypt(crypt)?;
            new_key.encrypt(&plain)
        };

        Ok(self.storage.rekey(&vault_info, row_enc_key, recrypt))
    }

    fn generate(
        &self,
        vault: &VaultDescriptor,
        value: &str,
        mask: Option<&mut String>,
    ) -> TokenResult<String> {
        info!("generating token against vault {} (format: {})", vault.alias, vault.format);

        let Some(generator) = generator::lookup(vault.format) else {
            error!("failed to find generator format {} for vault {}", vault.format, vault.alias);
            return Err(TokenError::InvalidTokenFormat {
                alias: vault.alias.clone(),
                format: vault.format,
            });
        };

        let provider = &self.provider;
        let mut rand = |buf: &mut [u8]| provider.random(buf);
        let token = generator(&mut rand, value, mask)?;

        info!("successfully generated token for vault {}", vault.alias);
        Ok(token)
    }
}
