//! Layered caching for application assets and feed photos.
//!
//! Two kinds of named cache live in one storage backend:
//! - versioned static generations (`feedcache-static-<version>`), swapped
//!   atomically by the install/activate lifecycle
//! - the permanent photo cache (`feedcache-photos`), kept in sync with the
//!   record store by mark-and-sweep reconciliation

mod assets;
mod photos;
mod storage;

pub use assets::{AssetCacheManager, RequestClass, ResolutionRules};
pub use photos::{canonical_photo_key, PhotoCache, ReconcileReport};
pub use storage::{CacheStorage, CachedEntry, SqliteCacheStore, StoredResponse};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Prefix shared by every cache this application manages. The activation
/// sweep only ever touches names carrying it.
pub const CACHE_PREFIX: &str = "feedcache-";

/// Name prefix of versioned static-asset generations.
pub const STATIC_PREFIX: &str = "feedcache-static-";

/// The permanent photo cache; whitelisted through every activation.
pub const PHOTO_CACHE: &str = "feedcache-photos";

/// Cache name for a static generation of the given version.
pub fn static_cache_name(version: &str) -> String {
  format!("{STATIC_PREFIX}{version}")
}

/// Registry of per-key async mutexes.
///
/// Serializes cache-mutating work per key (photo storage key, generation
/// name) so that two tasks never double-fetch the same entry, while
/// unrelated keys proceed concurrently.
pub(crate) struct KeyLocks {
  locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
  pub(crate) fn new() -> Self {
    Self {
      locks: Mutex::new(HashMap::new()),
    }
  }

  pub(crate) fn get(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    // Drop locks nobody holds anymore so the registry stays bounded by the
    // number of in-flight keys.
    map.retain(|_, lock| Arc::strong_count(lock) > 1);
    map
      .entry(key.to_string())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_static_cache_name_carries_prefix() {
    let name = static_cache_name("v2");
    assert_eq!(name, "feedcache-static-v2");
    assert!(name.starts_with(CACHE_PREFIX));
  }

  #[tokio::test]
  async fn test_key_locks_same_key_same_mutex() {
    let locks = KeyLocks::new();
    let a = locks.get("/photos/a");
    let b = locks.get("/photos/a");
    let other = locks.get("/photos/b");

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &other));

    // Unrelated keys don't block each other.
    let _guard = a.lock().await;
    assert!(other.try_lock().is_ok());
  }
}
