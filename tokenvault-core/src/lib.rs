//! Tokenization vault core.
//!
//! A tokenization vault replaces sensitive values (card numbers, account
//! identifiers) with surrogate tokens that preserve chosen structural
//! properties of the original and can only be reversed through this service.
//!
//! The crate is built from three parts:
//!
//! * [`TokenManager`]: the tokenize / detokenize / retrieve / update /
//!   remove / query / rekey flows;
//! * [`generator`]: the process-wide registry of format-preserving token
//!   generators;
//! * [`TokenDb`]: the pooled, transactional storage engine over per-vault
//!   tables, with a weak-reference vault-metadata cache.
//!
//! Crypto providers and SQL backends plug in through the [`crypto`] traits
//! and the `tokenvault-db` connection seam.

#![warn(clippy::all, clippy::pedantic)]

pub mod crypto;
pub mod entry;
pub mod error;
pub mod generator;
pub mod luhn;
mod manager;
mod status;
mod storage;
mod vault;

pub use entry::{TokenEntry, NO_EXPIRATION};
pub use error::{TokenError, TokenResult};
pub use generator::TokenFormat;
pub use manager::TokenManager;
pub use status::Status;
pub use storage::TokenDb;
pub use vault::{SharedVault, VaultDescriptor, VaultKeys};
