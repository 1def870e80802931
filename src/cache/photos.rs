//! Derived photo cache: canonicalizing store-or-fetch plus mark-and-sweep
//! reconciliation against the record store.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::storage::{CacheStorage, StoredResponse};
use super::{KeyLocks, PHOTO_CACHE};
use crate::error::{Error, Result};
use crate::records::Record;
use crate::upstream::Upstream;

/// Canonical storage key for a photo reference or request path.
///
/// Strips, in order: query/fragment, a trailing extension, and a trailing
/// `-<digits>px` size-variant suffix. Every size variant of one photo lands
/// on the same key. A missing leading slash is added so record references
/// ("photos/a.jpg") and request paths ("/photos/a-640px.jpg") agree.
pub fn canonical_photo_key(reference: &str) -> String {
  let path = reference
    .split(['?', '#'])
    .next()
    .unwrap_or(reference);

  let mut key = path;

  // Trailing ".ext" on the last path segment.
  if let Some(dot) = key.rfind('.') {
    let segment_start = key.rfind('/').map_or(0, |slash| slash + 1);
    let ext = &key[dot + 1..];
    if dot > segment_start && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
      key = &key[..dot];
    }
  }

  // Trailing "-<digits>px" size variant.
  if let Some(stem) = key.strip_suffix("px") {
    if let Some(dash) = stem.rfind('-') {
      let digits = &stem[dash + 1..];
      if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        key = &key[..dash];
      }
    }
  }

  if key.starts_with('/') {
    key.to_string()
  } else {
    format!("/{key}")
  }
}

/// Result of one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
  /// Distinct canonical keys referenced by the record snapshot
  pub live: usize,
  /// Entries deleted because no record references them
  pub removed: usize,
}

/// Store-or-fetch cache for feed photos.
///
/// Entries are keyed canonically, so requests for any size variant of a
/// photo resolve to one stored body. Writes are serialized per key; fetches
/// of unrelated photos run concurrently.
pub struct PhotoCache<S: CacheStorage> {
  storage: Arc<S>,
  upstream: Arc<Upstream>,
  locks: KeyLocks,
}

impl<S: CacheStorage> PhotoCache<S> {
  pub fn new(storage: Arc<S>, upstream: Arc<Upstream>) -> Self {
    Self {
      storage,
      upstream,
      locks: KeyLocks::new(),
    }
  }

  /// Return the cached photo for this request, fetching and storing it on a
  /// miss. The network fetch uses the requested variant URL; the stored
  /// entry uses the canonical key.
  pub async fn store_or_fetch(&self, url: &Url) -> Result<(StoredResponse, bool)> {
    let key = canonical_photo_key(url.path());
    let lock = self.locks.get(&key);
    let _guard = lock.lock().await;

    if let Some(entry) = self.storage.get(PHOTO_CACHE, &key)? {
      debug!(%key, stored_at = %entry.stored_at, "photo cache hit");
      return Ok((entry.response, true));
    }

    let response = self.upstream.get_ok(url).await?;
    self.storage.put(PHOTO_CACHE, &key, &response)?;
    debug!(%key, bytes = response.body.len(), "photo fetched and stored");
    Ok((response, false))
  }

  /// Delete every photo entry not referenced by the given record snapshot.
  ///
  /// Idempotent: with an unchanged snapshot a second pass deletes nothing.
  /// Runs against enumerated keys, never a live iterator, so it is safe
  /// concurrently with appends and fetches.
  pub fn reconcile(&self, snapshot: &[Record]) -> Result<ReconcileReport> {
    let live_keys: HashSet<String> = snapshot
      .iter()
      .filter_map(|record| record.photo.as_deref())
      .map(canonical_photo_key)
      .collect();

    let mut removed = 0;
    for key in self.storage.keys(PHOTO_CACHE)? {
      if !live_keys.contains(&key) {
        if self.storage.delete_entry(PHOTO_CACHE, &key)? {
          removed += 1;
        } else {
          // Someone already deleted it; the next pass would agree anyway.
          debug!("{}", Error::ReconcileSnapshotStale(key));
        }
      }
    }

    if removed > 0 {
      info!(removed, live = live_keys.len(), "pruned photo cache");
    }
    Ok(ReconcileReport {
      live: live_keys.len(),
      removed,
    })
  }
}
