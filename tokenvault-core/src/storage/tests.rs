use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tokenvault_db::sqlite::SqliteConnection;
use tokenvault_db::{Connection, Pool};

use super::*;
use crate::entry::NO_EXPIRATION;

fn temp_db_path() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("tokenvault-storage-{}.sqlite", uuid::Uuid::new_v4()));
    path
}

fn open_db(path: &Path) -> TokenDb {
    let path = path.to_path_buf();
    let pool = Pool::new(2, move || {
        SqliteConnection::open(&path).map(|conn| Box::new(conn) as Box<dyn Connection>)
    })
    .expect("pool");
    let db = TokenDb::new(pool);
    db.ensure_metadata().expect("metadata");
    db
}

fn transactional_vault(db: &TokenDb, alias: &str) -> SharedVault {
    let vault = VaultDescriptor::new(
        alias,
        format!("{alias}20_7_su"),
        "ENCKEY!!!",
        "MACKEY!!!",
        7,
        20,
        false,
    );
    assert!(db.create_vault(&vault).expect("create vault"));
    db.get_vault(alias).expect("get vault")
}

fn durable_vault(db: &TokenDb, alias: &str) -> SharedVault {
    let vault = VaultDescriptor::new(
        alias,
        format!("{alias}20_7_mu"),
        "ENCKEY!!!",
        "MACKEY!!!",
        7,
        20,
        true,
    );
    assert!(db.create_vault(&vault).expect("create vault"));
    db.get_vault(alias).expect("get vault")
}

fn sample_entry(token: &str, tag: u8) -> TokenEntry {
    let mut entry = TokenEntry {
        token: token.to_string(),
        hmac: vec![tag; 8],
        crypt: vec![tag ^ 0xFF; 12],
        mask: "************".to_string(),
        ..TokenEntry::default()
    };
    entry.properties.insert("property".to_string(), "value".to_string());
    entry
}

#[test]
fn test_vault_metadata_round_trip() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "meta");

    assert_eq!(vault.alias, "meta");
    assert_eq!(vault.table, "meta20_7_su");
    assert_eq!(vault.format, 7);
    assert_eq!(vault.enc_key_name, "ENCKEY!!!");
    assert_eq!(vault.mac_key_name, "MACKEY!!!");
    assert!(!vault.durable);

    // Reachable by table name as well as alias.
    let by_table = db.get_vault("meta20_7_su").expect("get by table");
    assert_eq!(by_table.alias, "meta");
    let _ = fs::remove_file(&path);
}

#[test]
fn test_unknown_vault() {
    let path = temp_db_path();
    let db = open_db(&path);
    match db.get_vault("missing") {
        Err(TokenError::NoVault(name)) => assert_eq!(name, "missing"),
        other => panic!("unexpected result: {other:?}"),
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn test_vault_cache_shares_and_expunges() {
    let path = temp_db_path();
    let db = open_db(&path);
    let first = transactional_vault(&db, "cached");
    let second = db.get_vault("cached").expect("get vault");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(lock(&db.vaults).len(), 1);

    drop(first);
    assert_eq!(lock(&db.vaults).len(), 1);
    drop(second);
    // Last holder gone: the cleanup hook cleared the slot.
    assert!(lock(&db.vaults).is_empty());
    let _ = fs::remove_file(&path);
}

#[test]
fn test_insert_and_get() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "ins");

    let mut entry = sample_entry("tok-1", 0x11);
    entry.expiration = UNIX_EPOCH + Duration::from_secs(2_000_000_000);
    db.insert(&vault.table, &entry).expect("insert");

    let fetched = db.get(&vault.table, "tok-1").expect("get");
    assert_eq!(fetched.token, "tok-1");
    assert_eq!(fetched.hmac, entry.hmac);
    assert_eq!(fetched.crypt, entry.crypt);
    assert_eq!(fetched.mask, entry.mask);
    assert_eq!(fetched.expiration, entry.expiration);
    assert_eq!(fetched.properties, entry.properties);
    assert!(fetched.enc_key.is_empty());
    assert!(fetched.value.is_empty());

    let missing = db.get(&vault.table, "nope").expect("get");
    assert!(missing.is_empty());
    let _ = fs::remove_file(&path);
}

#[test]
fn test_insert_includes_enckey_only_when_set() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "keyed");

    let mut entry = sample_entry("tok-k", 0x21);
    entry.enc_key = "ENCKEY!!!".to_string();
    db.insert(&vault.table, &entry).expect("insert");

    let fetched = db.get(&vault.table, "tok-k").expect("get");
    assert_eq!(fetched.enc_key, "ENCKEY!!!");
    let _ = fs::remove_file(&path);
}

#[test]
fn test_duplicate_token_error_names_unique_and_token() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "dup");

    db.insert(&vault.table, &sample_entry("tok-d", 0x31)).expect("insert");
    let err = db.insert(&vault.table, &sample_entry("tok-d", 0x32)).expect_err("duplicate");
    let message = err.to_string().to_uppercase();
    assert!(message.contains("UNIQUE"), "{message}");
    assert!(message.contains("TOKEN"), "{message}");
    let _ = fs::remove_file(&path);
}

#[test]
fn test_durable_vault_enforces_unique_hmac() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = durable_vault(&db, "durhash");

    db.insert(&vault.table, &sample_entry("tok-a", 0x41)).expect("insert");
    // Distinct token, identical hash.
    let err = db.insert(&vault.table, &sample_entry("tok-b", 0x41)).expect_err("hmac dup");
    assert!(err.to_string().to_uppercase().contains("UNIQUE"));
    let _ = fs::remove_file(&path);
}

#[test]
fn test_get_by_hmac_returns_all_matches() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "hashed");

    db.insert(&vault.table, &sample_entry("tok-1", 0x51)).expect("insert");
    db.insert(&vault.table, &sample_entry("tok-2", 0x51)).expect("insert");
    db.insert(&vault.table, &sample_entry("tok-3", 0x52)).expect("insert");

    let entries = db.get_by_hmac(&vault.table, &[0x51; 8]).expect("get by hmac");
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.hmac == vec![0x51; 8]));
    let _ = fs::remove_file(&path);
}

#[test]
fn test_remove_returns_removed_data() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "rm");

    db.insert(&vault.table, &sample_entry("tok-r", 0x61)).expect("insert");
    let removed = db.remove_token(&vault.table, "tok-r").expect("remove");
    assert_eq!(removed.hmac, vec![0x61; 8]);
    assert_eq!(removed.properties.get("property").map(String::as_str), Some("value"));

    assert!(db.get(&vault.table, "tok-r").expect("get").is_empty());
    let _ = fs::remove_file(&path);
}

#[test]
fn test_remove_by_hmac() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "rmh");

    db.insert(&vault.table, &sample_entry("tok-h", 0x71)).expect("insert");
    let removed = db.remove_hmac(&vault.table, &[0x71; 8]).expect("remove");
    assert_eq!(removed.token, "tok-h");
    let _ = fs::remove_file(&path);
}

#[test]
fn test_remove_requires_an_identifier() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "rmnone");

    let mut entry = TokenEntry::default();
    match db.remove(&vault.table, &mut entry) {
        Err(TokenError::Storage(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn test_remove_missing_row_is_an_error() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "rmmiss");

    match db.remove_token(&vault.table, "ghost") {
        Err(TokenError::Storage(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn test_update_writes_only_supplied_fields() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "upd");

    db.insert(&vault.table, &sample_entry("tok-u", 0x81)).expect("insert");

    let mut patch = TokenEntry {
        token: "tok-u".to_string(),
        mask: "new-mask".to_string(),
        ..TokenEntry::default()
    };
    db.update(&vault.table, &mut patch).expect("update");

    // Re-read filled the untouched columns back in.
    assert_eq!(patch.mask, "new-mask");
    assert_eq!(patch.hmac, vec![0x81; 8]);
    assert_eq!(patch.crypt, vec![0x81 ^ 0xFF; 12]);
    assert_eq!(patch.expiration, NO_EXPIRATION);
    let _ = fs::remove_file(&path);
}

#[test]
fn test_update_without_fields_or_token_is_a_noop() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "updnoop");

    let mut no_token = TokenEntry {
        mask: "ignored".to_string(),
        ..TokenEntry::default()
    };
    db.update(&vault.table, &mut no_token).expect("no-op");

    let mut no_fields = TokenEntry {
        token: "ghost".to_string(),
        ..TokenEntry::default()
    };
    db.update(&vault.table, &mut no_fields).expect("no-op");
    let _ = fs::remove_file(&path);
}

#[test]
fn test_update_missing_row_is_an_error() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "updmiss");

    let mut patch = TokenEntry {
        token: "ghost".to_string(),
        mask: "m".to_string(),
        ..TokenEntry::default()
    };
    match db.update(&vault.table, &mut patch) {
        Err(TokenError::Storage(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn test_query_filters_and_counts() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "qry");

    db.insert(&vault.table, &sample_entry("tok-1", 0x91)).expect("insert");
    db.insert(&vault.table, &sample_entry("tok-2", 0x91)).expect("insert");
    db.insert(&vault.table, &sample_entry("tok-3", 0x92)).expect("insert");

    // Token group alone.
    let entries = db
        .query(
            &vault.table,
            &["tok-1".to_string(), "tok-3".to_string()],
            &[],
            &[],
            "token",
            true,
            0,
            0,
            None,
        )
        .expect("query");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].token, "tok-1");
    assert_eq!(entries[1].token, "tok-3");

    // Groups are AND'ed: these two filters intersect to one row.
    let mut count = 0usize;
    let entries = db
        .query(
            &vault.table,
            &["tok-1".to_string(), "tok-2".to_string()],
            &[vec![0x91; 8]],
            &[],
            "token",
            false,
            0,
            1,
            Some(&mut count),
        )
        .expect("query");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].token, "tok-2");
    assert_eq!(count, 2, "count ignores the limit");
    let _ = fs::remove_file(&path);
}

#[test]
fn test_query_defaults_to_creation_date_sort() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "qrysort");

    db.insert(&vault.table, &sample_entry("tok-1", 0xA1)).expect("insert");
    let entries =
        db.query(&vault.table, &[], &[], &[], "", true, 0, 0, None).expect("query");
    assert_eq!(entries.len(), 1);
    let _ = fs::remove_file(&path);
}

#[test]
fn test_update_key_repoints_the_vault() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "rek");

    assert!(db.update_key(&vault, "NEWKEY").expect("update key"));
    drop(vault);

    let reloaded = db.get_vault("rek").expect("get vault");
    assert_eq!(reloaded.enc_key_name, "NEWKEY");

    assert!(db.update_key_by_name("rek", "NEWERKEY").expect("update key"));
    assert!(!db.update_key_by_name("missing", "X").expect("update key"));
    let _ = fs::remove_file(&path);
}

#[test]
fn test_rekey_rewrites_ciphertext() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "deep");

    let mut with_key = sample_entry("tok-1", 0xB1);
    with_key.enc_key = "OLDKEY".to_string();
    db.insert(&vault.table, &with_key).expect("insert");
    db.insert(&vault.table, &sample_entry("tok-2", 0xB2)).expect("insert");

    let ok = db.rekey(&vault, "NEWKEY", |src_key, crypt| {
        let mut out = src_key.as_bytes().to_vec();
        out.extend_from_slice(crypt);
        Ok(out)
    });
    assert!(ok);

    let rekeyed = db.get(&vault.table, "tok-1").expect("get");
    assert!(rekeyed.crypt.starts_with(b"OLDKEY"));
    assert_eq!(rekeyed.enc_key, "NEWKEY");

    // The row without a per-row key keeps its empty enckey.
    let rekeyed = db.get(&vault.table, "tok-2").expect("get");
    assert!(rekeyed.crypt.starts_with(b"ENCKEY!!!"));
    assert!(rekeyed.enc_key.is_empty());
    let _ = fs::remove_file(&path);
}

#[test]
fn test_rekey_failure_rolls_everything_back() {
    let path = temp_db_path();
    let db = open_db(&path);
    let vault = transactional_vault(&db, "deepfail");

    db.insert(&vault.table, &sample_entry("tok-1", 0xC1)).expect("insert");
    db.insert(&vault.table, &sample_entry("tok-2", 0xC2)).expect("insert");

    let mut calls = 0;
    let ok = db.rekey(&vault, "NEWKEY", |_, crypt| {
        calls += 1;
        if calls > 1 {
            return Err(TokenError::Cryptography("key refused".to_string()));
        }
        Ok(crypt.to_vec())
    });
    assert!(!ok);

    // Nothing committed.
    let entry = db.get(&vault.table, "tok-1").expect("get");
    assert_eq!(entry.crypt, vec![0xC1 ^ 0xFF; 12]);
    let _ = fs::remove_file(&path);
}

#[test]
fn test_probe() {
    let path = temp_db_path();
    let db = open_db(&path);
    assert!(db.test());
    let _ = fs::remove_file(&path);
}
