//! Error types for the tokenization core.

use thiserror::Error;

/// Result type for vault operations.
pub type TokenResult<T> = Result<T, TokenError>;

/// Errors raised by vault operations.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The named vault is not present in the metadata table.
    #[error("'{0}': vault not defined")]
    NoVault(String),

    /// No generator is registered for the vault's format id.
    #[error("vault {alias}: no generator registered for format {format}")]
    InvalidTokenFormat {
        /// Vault alias.
        alias: String,
        /// Offending format id.
        format: u32,
    },

    /// A generator exhausted its retry budget.
    #[error("token generation failed: {0}")]
    TokenGeneration(String),

    /// Preserved prefix/suffix lengths meet or exceed the value length.
    #[error("preserved lengths {front} {back} exceed the length of the value to tokenize")]
    TokenRange {
        /// Preserved prefix length.
        front: usize,
        /// Preserved suffix length.
        back: usize,
    },

    /// A vault alias that would produce an ambiguous derived table name.
    #[error("'{0}': numeric aliases are not permitted")]
    InvalidAlias(String),

    /// The crypto provider could not resolve or use a key.
    #[error("cryptography error: {0}")]
    Cryptography(String),

    /// A storage failure, including affected-row mismatches.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<tokenvault_db::DbError> for TokenError {
    fn from(err: tokenvault_db::DbError) -> Self {
        Self::Storage(err.to_string())
    }
}
