//! Result rows addressed by column name.

use std::sync::Arc;

use super::error::{DbError, DbResult};
use super::value::Value;

/// One row of a result set.
///
/// Column names are shared across all rows of a result set and resolved
/// case-insensitively, matching how SQL identifiers behave across backends.
/// SQL NULL reads as the requested type's empty value.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Builds a row from shared column names and per-row values.
    #[must_use]
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    fn value(&self, name: &str) -> DbResult<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(|idx| &self.values[idx])
            .ok_or_else(|| DbError::NoSuchColumn(name.to_string()))
    }

    /// Reads a column as text. NULL reads as the empty string.
    pub fn text(&self, name: &str) -> DbResult<String> {
        match self.value(name)? {
            Value::Text(v) => Ok(v.clone()),
            Value::Null => Ok(String::new()),
            _ => Err(DbError::InvalidColumnType(name.to_string())),
        }
    }

    /// Reads a column as a blob. NULL reads as an empty vector.
    pub fn blob(&self, name: &str) -> DbResult<Vec<u8>> {
        match self.value(name)? {
            Value::Blob(v) => Ok(v.clone()),
            // Some backends hand back empty blobs as empty text.
            Value::Text(v) => Ok(v.clone().into_bytes()),
            Value::Null => Ok(Vec::new()),
            _ => Err(DbError::InvalidColumnType(name.to_string())),
        }
    }

    /// Reads a column as an integer. NULL reads as zero.
    pub fn i64(&self, name: &str) -> DbResult<i64> {
        match self.value(name)? {
            Value::Integer(v) => Ok(*v),
            Value::Null => Ok(0),
            _ => Err(DbError::InvalidColumnType(name.to_string())),
        }
    }

    /// Reads a column as a boolean (non-zero integer).
    pub fn bool(&self, name: &str) -> DbResult<bool> {
        Ok(self.i64(name)? != 0)
    }
}
