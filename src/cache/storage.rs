//! Named-cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// A response body as held by a named cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  #[allow(dead_code)]
  pub fn ok(content_type: Option<String>, body: Vec<u8>) -> Self {
    Self {
      status: 200,
      content_type,
      body,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A cache entry together with when it was stored.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: StoredResponse,
  pub stored_at: DateTime<Utc>,
}

/// Storage backend for named caches: a mapping from cache name to a mapping
/// from entry key to stored response.
pub trait CacheStorage: Send + Sync {
  /// Names of all caches currently present.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Exact-key lookup within one cache.
  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store a response under a key, replacing any existing entry.
  fn put(&self, cache: &str, key: &str, response: &StoredResponse) -> Result<()>;

  /// All entry keys of one cache.
  fn keys(&self, cache: &str) -> Result<Vec<String>>;

  /// Delete a single entry. Returns whether it existed.
  fn delete_entry(&self, cache: &str, key: &str) -> Result<bool>;

  /// Delete a whole cache with all its entries. Returns whether it existed.
  fn delete_cache(&self, cache: &str) -> Result<bool>;
}

/// SQLite-based named-cache storage.
pub struct SqliteCacheStore {
  conn: Mutex<Connection>,
}

/// Schema for cache storage.
const CACHES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_name ON cache_entries(cache_name);
"#;

impl SqliteCacheStore {
  /// Open or create cache storage at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open in-memory cache storage. Used by tests.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    conn.execute_batch(CACHES_SCHEMA)?;
    Ok(())
  }
}

impl CacheStorage for SqliteCacheStore {
  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let mut stmt =
      conn.prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")?;
    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))?
      .filter_map(|r| r.ok())
      .collect();
    Ok(names)
  }

  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let mut stmt = conn.prepare(
      "SELECT status, content_type, body, stored_at FROM cache_entries
       WHERE cache_name = ? AND entry_key = ?",
    )?;

    let row: Option<(u16, Option<String>, Vec<u8>, String)> = stmt
      .query_row(params![cache, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, content_type, body, stored_at)) => Ok(Some(CachedEntry {
        response: StoredResponse {
          status,
          content_type,
          body,
        },
        stored_at: parse_datetime(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, cache: &str, key: &str, response: &StoredResponse) -> Result<()> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, entry_key, status, content_type, body, stored_at)
       VALUES (?, ?, ?, ?, ?, datetime('now'))",
      params![cache, key, response.status, response.content_type, response.body],
    )?;
    Ok(())
  }

  fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let mut stmt =
      conn.prepare("SELECT entry_key FROM cache_entries WHERE cache_name = ? ORDER BY entry_key")?;
    let keys: Vec<String> = stmt
      .query_map(params![cache], |row| row.get(0))?
      .filter_map(|r| r.ok())
      .collect();
    Ok(keys)
  }

  fn delete_entry(&self, cache: &str, key: &str) -> Result<bool> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let deleted = conn.execute(
      "DELETE FROM cache_entries WHERE cache_name = ? AND entry_key = ?",
      params![cache, key],
    )?;
    Ok(deleted > 0)
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let deleted = conn.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )?;
    Ok(deleted > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| Error::CorruptEntry(format!("bad stored_at '{s}': {e}")))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_put_get_round_trip() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    let response = StoredResponse::ok(Some("image/jpeg".into()), b"jpeg bytes".to_vec());

    store.put("feedcache-photos", "/photos/a", &response).unwrap();

    let entry = store.get("feedcache-photos", "/photos/a").unwrap().unwrap();
    assert_eq!(entry.response, response);
    assert!(store.get("feedcache-photos", "/photos/b").unwrap().is_none());
    assert!(store.get("other", "/photos/a").unwrap().is_none());
  }

  #[test]
  fn test_cache_names_and_keys() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    let body = StoredResponse::ok(None, Vec::new());

    store.put("feedcache-static-v1", "/a", &body).unwrap();
    store.put("feedcache-static-v1", "/b", &body).unwrap();
    store.put("feedcache-photos", "/photos/x", &body).unwrap();

    assert_eq!(
      store.cache_names().unwrap(),
      vec!["feedcache-photos", "feedcache-static-v1"]
    );
    assert_eq!(store.keys("feedcache-static-v1").unwrap(), vec!["/a", "/b"]);
  }

  #[test]
  fn test_delete_entry_and_cache() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    let body = StoredResponse::ok(None, Vec::new());

    store.put("feedcache-static-v1", "/a", &body).unwrap();
    store.put("feedcache-static-v1", "/b", &body).unwrap();

    assert!(store.delete_entry("feedcache-static-v1", "/a").unwrap());
    assert!(!store.delete_entry("feedcache-static-v1", "/a").unwrap());
    assert_eq!(store.keys("feedcache-static-v1").unwrap(), vec!["/b"]);

    assert!(store.delete_cache("feedcache-static-v1").unwrap());
    assert!(store.cache_names().unwrap().is_empty());
    assert!(!store.delete_cache("feedcache-static-v1").unwrap());
  }
}
