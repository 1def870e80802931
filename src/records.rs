//! Bounded, time-indexed store for live-feed records.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default number of records kept by the retention trim.
pub const DEFAULT_RETENTION_LIMIT: usize = 30;

/// A single feed record.
///
/// `id` is the identity, `time` (epoch millis) the ordering key. Any other
/// fields the feed sends ride along in `extra` and survive a store
/// round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  pub time: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub photo: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, Value>,
}

/// What happened to one appended batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
  /// Records upserted into the store
  pub appended: usize,
  /// Records rejected as malformed
  pub rejected: usize,
  /// Old records removed by the retention trim
  pub trimmed: usize,
}

/// Durable record store with a retention cap.
///
/// Backed by SQLite: primary map keyed by `id`, secondary index on
/// `(time, seq)` where `seq` is an insertion counter giving the stable
/// tie-break for equal timestamps.
pub struct RecordStore {
  conn: Mutex<Connection>,
  retention_limit: usize,
}

/// Schema for the record store.
const RECORDS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    time INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    photo TEXT,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_by_time ON records(time, seq);
"#;

impl RecordStore {
  /// Open or create the store at the given path.
  pub fn open(path: &Path, retention_limit: usize) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
      retention_limit,
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open an in-memory store. Used by tests and by callers that don't want
  /// persistence.
  #[allow(dead_code)]
  pub fn open_in_memory(retention_limit: usize) -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    let store = Self {
      conn: Mutex::new(conn),
      retention_limit,
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    conn.execute_batch(RECORDS_SCHEMA)?;
    Ok(())
  }

  /// Upsert a batch of raw feed records, then trim to the retention cap.
  ///
  /// Malformed records (missing `id` or `time`) are rejected individually
  /// and counted; the rest of the batch still lands. Within a batch, a
  /// duplicated `id` resolves last-write-wins in batch order. The upserts
  /// and the trim run in one transaction, so readers never observe the
  /// store above the cap.
  pub fn append_batch(&self, batch: &[Value]) -> Result<BatchOutcome> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let mut outcome = BatchOutcome::default();

    conn.execute("BEGIN TRANSACTION", [])?;

    let mut seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM records", [], |row| {
      row.get(0)
    })?;

    for raw in batch {
      let record: Record = match serde_json::from_value(raw.clone()) {
        Ok(record) => record,
        Err(e) => {
          let err = Error::InvalidRecord(e.to_string());
          warn!("rejecting feed record: {err}");
          outcome.rejected += 1;
          continue;
        }
      };

      // A rewrite of an existing id counts as a fresh insertion for the
      // time tie-break.
      seq += 1;
      let data = serde_json::to_vec(&record)?;
      conn.execute(
        "INSERT OR REPLACE INTO records (id, time, seq, photo, data)
         VALUES (?, ?, ?, ?, ?)",
        params![record.id, record.time, seq, record.photo, data],
      )?;
      outcome.appended += 1;
    }

    let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
    let excess = count - self.retention_limit as i64;
    if excess > 0 {
      outcome.trimmed = conn.execute(
        "DELETE FROM records WHERE rowid IN (
           SELECT rowid FROM records ORDER BY time ASC, seq ASC LIMIT ?
         )",
        params![excess],
      )?;
    }

    conn.execute("COMMIT", [])?;

    debug!(
      appended = outcome.appended,
      rejected = outcome.rejected,
      trimmed = outcome.trimmed,
      "appended record batch"
    );
    Ok(outcome)
  }

  /// All records, oldest first.
  pub fn get_all(&self) -> Result<Vec<Record>> {
    self.read_ordered("SELECT data FROM records ORDER BY time ASC, seq ASC")
  }

  /// All records, newest first. Pure read; display-order counterpart of
  /// [`get_all`](Self::get_all).
  pub fn get_all_descending(&self) -> Result<Vec<Record>> {
    self.read_ordered("SELECT data FROM records ORDER BY time DESC, seq DESC")
  }

  fn read_ordered(&self, sql: &str) -> Result<Vec<Record>> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let mut stmt = conn.prepare(sql)?;

    let records: Vec<Record> = stmt
      .query_map([], |row| {
        let data: Vec<u8> = row.get(0)?;
        Ok(data)
      })?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(records)
  }

  /// Timestamp of the newest record, used to resume the live feed.
  /// `None` on an empty store.
  pub fn latest_time(&self) -> Result<Option<i64>> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let latest: Option<i64> = conn.query_row("SELECT MAX(time) FROM records", [], |row| row.get(0))?;
    Ok(latest)
  }

  /// Number of records currently stored.
  pub fn len(&self) -> Result<usize> {
    let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
    Ok(count as usize)
  }
}
