//! Error types for the storage backend seam.

use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Error returned by backend connections and the pool.
///
/// The `Backend` message is reported verbatim from the underlying driver;
/// callers classify unique-constraint violations by inspecting it.
#[derive(Debug, Error)]
pub enum DbError {
    /// Error reported by the underlying database driver.
    #[error("{0}")]
    Backend(String),

    /// A named column was not present in the result row.
    #[error("no such column: {0}")]
    NoSuchColumn(String),

    /// A column value could not be read as the requested type.
    #[error("column {0} has incompatible type")]
    InvalidColumnType(String),

    /// The pool could not hand out a connection before the deadline.
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,
}

impl DbError {
    /// Wraps a backend driver error message.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}
