//! SQLite backend for the storage seam, built on `rusqlite`.
//!
//! Autocommit-off semantics are modeled with a lazy `BEGIN`: the first
//! statement on a connection opens a deferred transaction that stays open
//! until `commit` or `rollback`.
//!
//! Two portability rewrites are applied before execution, because the engine
//! composes SQL in the row-locking dialect shared by the server backends:
//!
//! * a trailing `FOR UPDATE` is dropped (SQLite's database write lock
//!   subsumes row locks);
//! * `OFFSET n [LIMIT m]` becomes `LIMIT m OFFSET n` (SQLite only accepts
//!   `OFFSET` after a `LIMIT`, so a bare offset gains `LIMIT -1`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::ValueRef;

use super::connection::Connection;
use super::error::{DbError, DbResult};
use super::row::Row;
use super::value::Value;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A pooled SQLite connection.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    in_txn: bool,
}

impl SqliteConnection {
    /// Opens (or creates) a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = rusqlite::Connection::open(path).map_err(map_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_err)?;
        Ok(Self { conn, in_txn: false })
    }

    fn ensure_txn(&mut self) -> DbResult<()> {
        if !self.in_txn {
            self.conn.execute_batch("BEGIN").map_err(map_err)?;
            self.in_txn = true;
        }
        Ok(())
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<usize> {
        self.ensure_txn()?;
        let sql = rewrite(sql);
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        bind(&mut stmt, params)?;
        stmt.raw_execute().map_err(map_err)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        self.ensure_txn()?;
        let sql = rewrite(sql);
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        let columns: Arc<[String]> =
            stmt.column_names().iter().map(ToString::to_string).collect::<Vec<_>>().into();
        bind(&mut stmt, params)?;

        let mut rows = Vec::new();
        let mut raw = stmt.raw_query();
        while let Some(row) = raw.next().map_err(map_err)? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(read_value(row.get_ref(idx).map_err(map_err)?));
            }
            rows.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(rows)
    }

    fn commit(&mut self) -> DbResult<()> {
        if self.in_txn {
            self.conn.execute_batch("COMMIT").map_err(map_err)?;
            self.in_txn = false;
        }
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        if self.in_txn {
            self.conn.execute_batch("ROLLBACK").map_err(map_err)?;
            self.in_txn = false;
        }
        Ok(())
    }

    fn test(&mut self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok_and(|v| v == 1)
    }
}

fn map_err(err: rusqlite::Error) -> DbError {
    DbError::backend(err.to_string())
}

fn bind(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> DbResult<()> {
    for (idx, value) in params.iter().enumerate() {
        stmt.raw_bind_parameter(idx + 1, value).map_err(map_err)?;
    }
    Ok(())
}

fn read_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Text(v.to_string()),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}

fn rewrite(sql: &str) -> String {
    let trimmed = sql.trim_end();
    let without_lock = trimmed
        .strip_suffix("FOR UPDATE")
        .map_or_else(|| trimmed.to_string(), |rest| rest.trim_end().to_string());

    let Some(pos) = without_lock.rfind(" OFFSET ") else {
        return without_lock;
    };

    // The engine emits "OFFSET n" optionally followed by "LIMIT m"; SQLite
    // only accepts LIMIT first, and OFFSET never stands alone.
    let (head, tail) = without_lock.split_at(pos);
    let words: Vec<&str> = tail.split_whitespace().collect();
    match words.as_slice() {
        ["OFFSET", n] => format!("{head} LIMIT -1 OFFSET {n}"),
        ["OFFSET", n, "LIMIT", m] => format!("{head} LIMIT {m} OFFSET {n}"),
        _ => without_lock,
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::ToSqlOutput;
        Ok(match self {
            Self::Integer(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*v)),
            Self::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            Self::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Self::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
        })
    }
}
