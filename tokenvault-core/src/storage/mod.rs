//! Vault storage engine over the pooled backend.
//!
//! One [`TokenDb`] serves every vault of a deployment: per-vault tables for
//! token entries plus the `vaults` metadata table. Statements are composed
//! with `?` placeholders; table names come from trusted vault metadata.
//!
//! Vault descriptors are cached by name under weak references, so metadata
//! lives exactly as long as some caller holds it (see [`TokenDb::get_vault`]).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use log::{debug, error, warn};
use tokenvault_db::{params, Connection, Pool, Value};

use crate::entry::{expiration_to_seconds, serialize_properties, TokenEntry, NO_EXPIRATION};
use crate::error::{TokenError, TokenResult};
use crate::vault::{SharedVault, VaultDescriptor};

type VaultCache = Arc<Mutex<HashMap<String, Weak<VaultDescriptor>>>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The vault storage engine.
pub struct TokenDb {
    pool: Pool,
    vaults: VaultCache,
}

impl TokenDb {
    /// Creates a storage engine over a connection pool.
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            vaults: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates the `vaults` metadata table when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the DDL fails.
    pub fn ensure_metadata(&self) -> TokenResult<()> {
        let mut conn = self.pool.acquire()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vaults ( \
               format    INTEGER, \
               alias     VARCHAR(255), \
               tablename VARCHAR(255), \
               enckey    VARCHAR(255), \
               mackey    VARCHAR(255), \
               durable   INTEGER, \
               CONSTRAINT vaults_alias_key PRIMARY KEY ( alias ), \
               CONSTRAINT vaults_name_key UNIQUE ( tablename ) \
             )",
            &[],
        )?;
        conn.commit()?;
        Ok(())
    }

    /// Resolves a vault descriptor by alias or table name.
    ///
    /// Descriptors are shared: while any caller holds one, lookups return the
    /// same allocation. When the last holder drops it, the descriptor's
    /// cleanup hook clears the cache slot, provided the slot still refers to
    /// that allocation (a concurrent refill wins).
    ///
    /// # Errors
    ///
    /// [`TokenError::NoVault`] when the name is unknown; storage errors
    /// propagate.
    pub fn get_vault(&self, name: &str) -> TokenResult<SharedVault> {
        let mut vaults = lock(&self.vaults);

        if let Some(existing) = vaults.get(name).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let mut conn = self.pool.acquire()?;
        let rows = conn.query(
            "SELECT * FROM vaults WHERE ? IN ( alias, tablename )",
            params![name],
        )?;
        let Some(row) = rows.first() else {
            return Err(TokenError::NoVault(name.to_string()));
        };

        let descriptor = VaultDescriptor::from_row(row)?;
        let vault = Arc::new_cyclic(|weak: &Weak<VaultDescriptor>| {
            let mut descriptor = descriptor;
            let cache = Arc::clone(&self.vaults);
            let slot_name = name.to_string();
            let me = weak.clone();
            descriptor.attach_cleanup(Box::new(move || {
                let mut map = lock(&cache);
                if map.get(&slot_name).is_some_and(|slot| Weak::ptr_eq(slot, &me)) {
                    map.remove(&slot_name);
                }
            }));
            descriptor
        });
        vaults.insert(name.to_string(), Arc::downgrade(&vault));

        Ok(vault)
    }

    /// Creates a vault: the per-vault table plus its metadata row.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the DDL or metadata insert fails.
    pub fn create_vault(&self, vault: &VaultDescriptor) -> TokenResult<bool> {
        let constraints = if vault.durable {
            format!(
                "CONSTRAINT {table}_pkey PRIMARY KEY ( token ), \
                 CONSTRAINT {table}_hmac_key UNIQUE ( hmac )",
                table = vault.table
            )
        } else {
            format!("CONSTRAINT {table}_tran_tok_key UNIQUE ( token )", table = vault.table)
        };

        debug!("creating vault table {} for {}", vault.table, vault.alias);

        let mut conn = self.pool.acquire()?;
        conn.execute(
            &format!(
                "CREATE TABLE {table} ( \
                   token         VARCHAR( {len} ) NOT NULL, \
                   hmac          BLOB, \
                   crypt         BLOB, \
                   mask          VARCHAR( {len} ), \
                   expiration    BIGINT DEFAULT 0, \
                   properties    BLOB, \
                   enckey        VARCHAR( 255 ), \
                   creation_date TIMESTAMP DEFAULT CURRENT_TIMESTAMP, \
                   {constraints} \
                 )",
                table = vault.table,
                len = vault.value_len,
            ),
            &[],
        )?;

        let affected = conn.execute(
            "INSERT INTO vaults ( format, alias, tablename, enckey, mackey, durable ) \
             VALUES ( ?, ?, ?, ?, ?, ? )",
            params![
                i64::from(vault.format),
                vault.alias.as_str(),
                vault.table.as_str(),
                vault.enc_key_name.as_str(),
                vault.mac_key_name.as_str(),
                vault.durable,
            ],
        )?;
        conn.commit()?;

        Ok(affected > 0)
    }

    /// Fetches a single entry by token. Returns an empty entry when the
    /// token is unknown.
    ///
    /// # Errors
    ///
    /// Storage errors propagate.
    pub fn get(&self, table: &str, token: &str) -> TokenResult<TokenEntry> {
        debug!("getting entry for token {token} from table {table}");
        let mut conn = self.pool.acquire()?;
        let rows =
            conn.query(&format!("SELECT * FROM {table} WHERE token = ?"), params![token])?;

        let mut entry = TokenEntry::default();
        if let Some(row) = rows.first() {
            entry.load(row)?;
        } else {
            debug!("no record found for {token} in {table}");
        }
        Ok(entry)
    }

    /// Fetches every entry carrying the given value hash.
    ///
    /// # Errors
    ///
    /// Storage errors propagate.
    pub fn get_by_hmac(&self, table: &str, hmac: &[u8]) -> TokenResult<Vec<TokenEntry>> {
        debug!("performing hash lookup in table {table}");
        let mut conn = self.pool.acquire()?;
        let rows = conn.query(&format!("SELECT * FROM {table} WHERE hmac = ?"), params![hmac])?;
        rows.iter().map(TokenEntry::from_row).collect()
    }

    /// Inserts a new entry. The `ENCKEY` column is included only when the
    /// entry names a per-row key.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the insert affects anything other than
    /// one row; constraint violations carry the backend message for
    /// collision classification by the caller.
    pub fn insert(&self, table: &str, entry: &TokenEntry) -> TokenResult<()> {
        debug!("inserting record for token {} into table {table}", entry.token);

        let mut columns = String::new();
        let mut placeholders = String::new();
        let mut params: Vec<Value> = Vec::with_capacity(7);

        if !entry.enc_key.is_empty() {
            columns.push_str("ENCKEY, ");
            placeholders.push_str("?, ");
            params.push(Value::from(entry.enc_key.as_str()));
        }
        columns.push_str("TOKEN, HMAC, CRYPT, MASK, EXPIRATION, PROPERTIES");
        placeholders.push_str("?, ?, ?, ?, ?, ?");
        params.push(Value::from(entry.token.as_str()));
        params.push(Value::from(entry.hmac.as_slice()));
        params.push(Value::from(entry.crypt.as_slice()));
        params.push(Value::from(entry.mask.as_str()));
        params.push(Value::from(expiration_to_seconds(entry.expiration)));
        params.push(Value::from(serialize_properties(&entry.properties)?));

        let mut conn = self.pool.acquire()?;
        let affected = conn.execute(
            &format!("INSERT INTO {table} ( {columns} ) VALUES ( {placeholders} )"),
            &params,
        )?;
        if affected != 1 {
            debug!("failed to insert {} record into {table}", entry.token);
            return Err(TokenError::Storage(format!(
                "unable to insert token into {table}"
            )));
        }
        conn.commit()?;

        debug!("successfully inserted {} record into {table}", entry.token);
        Ok(())
    }

    /// Removes an entry by its token (or, lacking one, its hash), first
    /// re-reading the row so the caller gets the complete removed data.
    ///
    /// # Errors
    ///
    /// Returns a storage error when neither token nor hmac is supplied, or
    /// when no row was deleted.
    pub fn remove(&self, table: &str, entry: &mut TokenEntry) -> TokenResult<()> {
        if entry.token.is_empty() && entry.hmac.is_empty() {
            warn!("no token or hmac supplied for removal from {table}");
            return Err(TokenError::Storage(
                "unable to remove token, no unique/identifier values (token, or hmac)".to_string(),
            ));
        }

        let mut conn = self.pool.acquire()?;

        let (filter, key): (&str, Value) = if entry.token.is_empty() {
            ("hmac", Value::from(entry.hmac.as_slice()))
        } else {
            ("token", Value::from(entry.token.as_str()))
        };

        let rows = conn.query(
            &format!("SELECT * FROM {table} WHERE {filter} = ?"),
            &[key.clone()],
        )?;
        if let Some(row) = rows.first() {
            entry.load(row)?;
        }

        debug!("removing record from {table} by {filter}");
        let affected = conn.execute(&format!("DELETE FROM {table} WHERE {filter} = ?"), &[key])?;
        if affected != 1 {
            debug!("unable to remove non-existent record from {table}");
            return Err(TokenError::Storage(
                "unable to remove token, entry does not exist".to_string(),
            ));
        }
        conn.commit()?;

        debug!("successfully removed record from {table}");
        Ok(())
    }

    /// Removes an entry by token, returning the removed data.
    ///
    /// # Errors
    ///
    /// See [`remove`](Self::remove).
    pub fn remove_token(&self, table: &str, token: &str) -> TokenResult<TokenEntry> {
        let mut entry = TokenEntry {
            token: token.to_string(),
            ..TokenEntry::default()
        };
        self.remove(table, &mut entry)?;
        Ok(entry)
    }

    /// Removes an entry by value hash, returning the removed data.
    ///
    /// # Errors
    ///
    /// See [`remove`](Self::remove).
    pub fn remove_hmac(&self, table: &str, hmac: &[u8]) -> TokenResult<TokenEntry> {
        let mut entry = TokenEntry {
            hmac: hmac.to_vec(),
            ..TokenEntry::default()
        };
        self.remove(table, &mut entry)?;
        Ok(entry)
    }

    /// Applies a partial update keyed by the entry's token, then re-reads the
    /// row into `entry`.
    ///
    /// Only non-empty fields among enckey/hmac/crypt/mask/properties are
    /// written; the expiration is written when it is not the no-expiration
    /// sentinel. Empty fields cannot be cleared this way. An entry with no
    /// token, or with nothing to set, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the row does not exist.
    pub fn update(&self, table: &str, entry: &mut TokenEntry) -> TokenResult<()> {
        if entry.token.is_empty() {
            return Ok(());
        }

        let mut assignments: Vec<&str> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if !entry.enc_key.is_empty() {
            assignments.push("ENCKEY = ?");
            params.push(Value::from(entry.enc_key.as_str()));
        }
        if !entry.hmac.is_empty() {
            assignments.push("HMAC = ?");
            params.push(Value::from(entry.hmac.as_slice()));
        }
        if !entry.crypt.is_empty() {
            assignments.push("CRYPT = ?");
            params.push(Value::from(entry.crypt.as_slice()));
        }
        if !entry.mask.is_empty() {
            assignments.push("MASK = ?");
            params.push(Value::from(entry.mask.as_str()));
        }
        if entry.expiration != NO_EXPIRATION {
            assignments.push("EXPIRATION = ?");
            params.push(Value::from(expiration_to_seconds(entry.expiration)));
        }
        if !entry.properties.is_empty() {
            assignments.push("PROPERTIES = ?");
            params.push(Value::from(serialize_properties(&entry.properties)?));
        }

        if assignments.is_empty() {
            return Ok(());
        }
        params.push(Value::from(entry.token.as_str()));

        debug!("performing record update for {} in table {table}", entry.token);

        let mut conn = self.pool.acquire()?;
        let affected = conn.execute(
            &format!("UPDATE {table} SET {} WHERE token = ?", assignments.join(", ")),
            &params,
        )?;
        if affected == 0 {
            debug!("error updating record for {}: not found", entry.token);
            return Err(TokenError::Storage(format!(
                "error updating record for token: {}",
                entry.token
            )));
        }
        conn.commit()?;

        let rows = conn.query(
            &format!("SELECT * FROM {table} WHERE token = ?"),
            params![entry.token.as_str()],
        )?;
        if let Some(row) = rows.first() {
            entry.load(row)?;
        }
        Ok(())
    }

    /// Searches a vault table.
    ///
    /// Values within a field group are OR'ed (`IN ( ... )`); groups are
    /// AND'ed. An empty `sort_field` sorts on `creation_date`. `offset` and
    /// `limit` apply when non-zero. When `record_count` is supplied, the same
    /// filter runs again with a `COUNT(0)` projection (no order/offset/limit).
    ///
    /// # Errors
    ///
    /// Storage errors propagate; a count query returning no row is a storage
    /// error.
    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &self,
        table: &str,
        tokens: &[String],
        hmacs: &[Vec<u8>],
        expirations: &[SystemTime],
        sort_field: &str,
        sort_asc: bool,
        offset: usize,
        limit: usize,
        record_count: Option<&mut usize>,
    ) -> TokenResult<Vec<TokenEntry>> {
        let sort_field = if sort_field.is_empty() { "creation_date" } else { sort_field };

        let mut filter = String::new();
        query_add_set(&mut filter, "token", tokens.len());
        query_add_set(&mut filter, "hmac", hmacs.len());
        query_add_set(&mut filter, "expiration", expirations.len());

        let where_clause =
            if filter.is_empty() { String::new() } else { format!(" WHERE {filter}") };

        let mut sql = format!(
            "SELECT * FROM {table}{where_clause} ORDER BY {sort_field} {}",
            if sort_asc { "ASC" } else { "DESC" }
        );
        if offset != 0 {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        if limit != 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut params: Vec<Value> = Vec::with_capacity(tokens.len() + hmacs.len() + expirations.len());
        params.extend(tokens.iter().map(|t| Value::from(t.as_str())));
        params.extend(hmacs.iter().map(|h| Value::from(h.as_slice())));
        params.extend(expirations.iter().map(|e| Value::from(expiration_to_seconds(*e))));

        debug!("querying {table}: {sql}");

        let mut conn = self.pool.acquire()?;
        let rows = conn.query(&sql, &params)?;
        let entries = rows.iter().map(TokenEntry::from_row).collect::<TokenResult<Vec<_>>>()?;

        if let Some(record_count) = record_count {
            let count_sql = format!("SELECT COUNT(0) FROM {table}{where_clause}");
            let count_rows = conn.query(&count_sql, &params)?;
            let Some(row) = count_rows.first() else {
                return Err(TokenError::Storage(format!(
                    "failure executing count query: {count_sql}"
                )));
            };
            *record_count = usize::try_from(row.i64("COUNT(0)").or_else(|_| row.i64("count"))?)
                .unwrap_or(0);
        }

        Ok(entries)
    }

    /// Repoints a vault's current encryption key. Existing rows are not
    /// re-encrypted.
    ///
    /// # Errors
    ///
    /// Storage errors propagate.
    pub fn update_key(&self, vault: &VaultDescriptor, enc_key: &str) -> TokenResult<bool> {
        let mut conn = self.pool.acquire()?;
        let affected = conn.execute(
            "UPDATE vaults SET enckey = ? WHERE tablename = ?",
            params![enc_key, vault.table.as_str()],
        )?;
        conn.commit()?;
        Ok(affected > 0)
    }

    /// Repoints a vault's current encryption key by alias or table name.
    ///
    /// # Errors
    ///
    /// Storage errors propagate.
    pub fn update_key_by_name(&self, vault: &str, enc_key: &str) -> TokenResult<bool> {
        let mut conn = self.pool.acquire()?;
        let affected = conn.execute(
            "UPDATE vaults SET enckey = ? WHERE ? IN ( alias, tablename )",
            params![enc_key, vault],
        )?;
        conn.commit()?;
        Ok(affected > 0)
    }

    /// Re-encrypts every row of a vault under a row-level lock.
    ///
    /// `recrypt` maps `(source key name, ciphertext)` to new ciphertext; the
    /// source key is the row's own key name when present, else the vault's
    /// current one. Rows without ciphertext are skipped. `row_enc_key` is
    /// written into `enckey` for rows that previously carried one (the empty
    /// string clears the column for versioned keys).
    ///
    /// All work commits once at the end; any failure logs, rolls back by
    /// dropping the connection uncommitted, and yields `false`.
    pub fn rekey<F>(&self, vault: &VaultDescriptor, row_enc_key: &str, recrypt: F) -> bool
    where
        F: FnMut(&str, &[u8]) -> TokenResult<Vec<u8>>,
    {
        match self.rekey_all(vault, row_enc_key, recrypt) {
            Ok(()) => true,
            Err(err) => {
                error!("failure encountered while processing rekey on {}: {err}", vault.alias);
                false
            }
        }
    }

    fn rekey_all<F>(&self, vault: &VaultDescriptor, row_enc_key: &str, mut recrypt: F) -> TokenResult<()>
    where
        F: FnMut(&str, &[u8]) -> TokenResult<Vec<u8>>,
    {
        let mut conn = self.pool.acquire()?;
        let rows = conn.query(&format!("SELECT * FROM {} FOR UPDATE", vault.table), &[])?;

        for row in &rows {
            let entry = TokenEntry::from_row(row)?;
            if entry.crypt.is_empty() {
                continue;
            }

            let src_key = if entry.enc_key.is_empty() {
                vault.enc_key_name.as_str()
            } else {
                entry.enc_key.as_str()
            };
            let crypt = recrypt(src_key, &entry.crypt)?;

            let affected = if entry.enc_key.is_empty() {
                conn.execute(
                    &format!("UPDATE {} SET crypt = ? WHERE hmac = ?", vault.table),
                    params![crypt.as_slice(), entry.hmac.as_slice()],
                )?
            } else {
                conn.execute(
                    &format!("UPDATE {} SET enckey = ?, crypt = ? WHERE hmac = ?", vault.table),
                    params![row_enc_key, crypt.as_slice(), entry.hmac.as_slice()],
                )?
            };

            if affected == 0 {
                return Err(TokenError::Storage(format!(
                    "failed to update previously selected record for {}",
                    entry.mask
                )));
            }
        }

        conn.commit()?;
        Ok(())
    }

    /// Probes a pooled connection. Any error yields `false`.
    #[must_use]
    pub fn test(&self) -> bool {
        self.pool.acquire().map_or(false, |mut conn| conn.test())
    }
}

fn query_add_set(filter: &mut String, field: &str, count: usize) {
    if count == 0 {
        return;
    }
    if !filter.is_empty() {
        filter.push_str(" AND ");
    }
    filter.push_str(field);
    filter.push_str(" IN ( ");
    for num in 0..count {
        if num > 0 {
            filter.push_str(", ");
        }
        filter.push('?');
    }
    filter.push_str(" )");
}

#[cfg(test)]
mod tests;
