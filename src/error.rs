//! Error types shared across the cache layer.
//!
//! Request-path failures never escape `FetchPolicy::handle`; these variants
//! exist so the layers below it can report what went wrong precisely.

use thiserror::Error;

/// Result type alias for cache-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  /// A feed record missing its identity or ordering key. Rejected
  /// individually; never aborts the surrounding batch.
  #[error("invalid record: {0}")]
  InvalidRecord(String),

  /// A manifest entry could not be fetched during cache install. The whole
  /// generation is abandoned and the previously active one keeps serving.
  #[error("cache install incomplete for {generation}: {reason}")]
  InstallIncomplete { generation: String, reason: String },

  /// Network transport failure or unacceptable upstream status during a
  /// proxied request.
  #[error("fetch failed for {url}: {reason}")]
  FetchFailed { url: String, reason: String },

  /// The record snapshot a reconcile pass ran against no longer matches the
  /// store. Harmless: the next scheduled pass catches stragglers.
  #[error("reconcile snapshot out of date: {0}")]
  ReconcileSnapshotStale(String),

  #[error("failed to build http client: {0}")]
  HttpClient(String),

  #[error("corrupt cache entry: {0}")]
  CorruptEntry(String),

  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("storage lock poisoned")]
  LockPoisoned,
}
