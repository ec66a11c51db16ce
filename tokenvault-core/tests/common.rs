//! Shared setup for integration tests: a SQLite-backed storage engine and
//! the software crypto provider.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokenvault_core::crypto::software::SoftwareProvider;
use tokenvault_core::crypto::Provider;
use tokenvault_core::{TokenDb, TokenManager};
use tokenvault_db::sqlite::SqliteConnection;
use tokenvault_db::{Connection, Pool};

pub const CARD_VALUE: &str = "6044342464567232";
pub const ENC_KEY: &str = "ENCKEY!!!";
pub const MAC_KEY: &str = "MACKEY!!!";

/// The F6L4 card format id.
pub const CARD_FORMAT: u32 = 7;

pub struct Harness {
    pub manager: TokenManager,
    pub provider: Arc<SoftwareProvider>,
    pub storage: Arc<TokenDb>,
    path: PathBuf,
}

impl Harness {
    /// Builds a manager over a fresh temp database. `NEWKEY` is the one
    /// versioned key name the provider knows.
    pub fn new() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("tokenvault-it-{}.sqlite", uuid::Uuid::new_v4()));

        let db_path = path.clone();
        let pool = Pool::new(2, move || {
            SqliteConnection::open(&db_path).map(|conn| Box::new(conn) as Box<dyn Connection>)
        })
        .expect("pool");

        let storage = Arc::new(TokenDb::new(pool));
        storage.ensure_metadata().expect("metadata");

        let provider = Arc::new(SoftwareProvider::with_versioned(["NEWKEY"]));
        let manager =
            TokenManager::new(Arc::clone(&provider) as Arc<dyn Provider>, Arc::clone(&storage));

        Self {
            manager,
            provider,
            storage,
            path,
        }
    }

    /// Creates a vault with the shared test keys.
    pub fn create_vault(&self, alias: &str, durable: bool) {
        assert!(self
            .manager
            .create_vault(alias, ENC_KEY, MAC_KEY, CARD_FORMAT, 20, durable, "")
            .expect("create vault"));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
