//! Storage backend seam for the tokenvault core.
//!
//! This crate defines the small, backend-agnostic surface the vault engine
//! talks to: bindable [`Value`]s, by-column-name [`Row`]s, the [`Connection`]
//! trait (positionally parameterized SQL, explicit commit, string error
//! messages), and a bounded FIFO [`Pool`] of connections.
//!
//! Connections run with autocommit disabled: the first statement on a
//! checked-out connection opens a transaction, `commit` closes it, and a
//! connection released without commit is rolled back by the pool guard.
//!
//! The [`sqlite`] module provides the reference backend on top of `rusqlite`.

#![warn(clippy::all, clippy::pedantic)]

mod connection;
pub mod error;
mod pool;
mod row;
pub mod sqlite;
pub mod value;

pub use connection::Connection;
pub use error::{DbError, DbResult};
pub use pool::{Pool, PooledConnection};
pub use row::Row;
pub use value::Value;
