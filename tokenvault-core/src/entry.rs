//! Token entries and the properties wire codec.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokenvault_db::Row;

use crate::error::{TokenError, TokenResult};

/// Sentinel expiration meaning "never expires".
pub const NO_EXPIRATION: SystemTime = UNIX_EPOCH;

/// A single vault row, plus the in-memory decrypted value.
///
/// `value` is populated only after a successful decrypt and is never
/// persisted in cleartext. An empty `enc_key` means the row was written under
/// a versioned key (the ciphertext carries its own key identity) or the
/// vault-current key applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEntry {
    /// Per-row encryption key name; empty for versioned keys.
    pub enc_key: String,
    /// The surrogate token, unique per vault.
    pub token: String,
    /// Keyed hash of the raw value.
    pub hmac: Vec<u8>,
    /// Encrypted raw value.
    pub crypt: Vec<u8>,
    /// Masked display form.
    pub mask: String,
    /// Raw value, in memory only.
    pub value: String,
    /// Expiration; [`NO_EXPIRATION`] when the entry never expires.
    pub expiration: SystemTime,
    /// Caller-supplied properties.
    pub properties: BTreeMap<String, String>,
}

impl Default for TokenEntry {
    fn default() -> Self {
        Self {
            enc_key: String::new(),
            token: String::new(),
            hmac: Vec::new(),
            crypt: Vec::new(),
            mask: String::new(),
            value: String::new(),
            expiration: NO_EXPIRATION,
            properties: BTreeMap::new(),
        }
    }
}

impl TokenEntry {
    /// Returns `true` when no row backs this entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.token.is_empty() && self.hmac.is_empty()
    }

    /// Loads the persisted columns from a result row.
    ///
    /// # Errors
    ///
    /// Returns a storage error when a column is missing or the properties
    /// blob does not decode.
    pub fn load(&mut self, row: &Row) -> TokenResult<()> {
        self.enc_key = row.text("ENCKEY")?;
        self.token = row.text("TOKEN")?;
        self.hmac = row.blob("HMAC")?;
        self.crypt = row.blob("CRYPT")?;
        self.mask = row.text("MASK")?;
        self.expiration = expiration_from_seconds(row.i64("EXPIRATION")?);
        self.properties = deserialize_properties(&row.blob("PROPERTIES")?)?;
        Ok(())
    }

    /// Builds an entry from a result row.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn from_row(row: &Row) -> TokenResult<Self> {
        let mut entry = Self::default();
        entry.load(row)?;
        Ok(entry)
    }
}

/// Converts an expiration to its stored form (seconds since the epoch;
/// zero for the no-expiration sentinel).
#[must_use]
pub fn expiration_to_seconds(expiration: SystemTime) -> i64 {
    expiration
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Converts stored seconds back into an expiration.
#[must_use]
pub fn expiration_from_seconds(seconds: i64) -> SystemTime {
    u64::try_from(seconds)
        .map_or(NO_EXPIRATION, |s| UNIX_EPOCH + std::time::Duration::from_secs(s))
}

/// Serializes a properties map to its wire form.
///
/// The wire format is CBOR of a single-element array containing the map,
/// `[{...}]`. The wrapping is a backward-compatibility contract.
///
/// # Errors
///
/// Returns a storage error when encoding fails.
pub fn serialize_properties(properties: &BTreeMap<String, String>) -> TokenResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&(properties,), &mut bytes)
        .map_err(|err| TokenError::Storage(format!("properties encode: {err}")))?;
    Ok(bytes)
}

/// Deserializes a properties map from its wire form.
///
/// An empty blob decodes as the empty map.
///
/// # Errors
///
/// Returns a storage error when the blob is not the expected `[{...}]` shape.
pub fn deserialize_properties(bytes: &[u8]) -> TokenResult<BTreeMap<String, String>> {
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    let (properties,): (BTreeMap<String, String>,) = ciborium::de::from_reader(bytes)
        .map_err(|err| TokenError::Storage(format!("properties decode: {err}")))?;
    Ok(properties)
}
