//! Versioned asset-cache generations: install, activate, lookup, and the
//! request-classification table used by the fetch policy.

use reqwest::Method;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use url::Url;

use super::storage::{CacheStorage, StoredResponse};
use super::{KeyLocks, CACHE_PREFIX, STATIC_PREFIX};
use crate::error::{Error, Result};
use crate::fetch::FetchRequest;
use crate::upstream::Upstream;

/// How the fetch policy should resolve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Navigation to the app root: serve the cached shell document.
  Shell,
  /// Under the photo namespace: canonicalizing store-or-fetch.
  Photo,
  /// Everything else GET: cache-first with network and fallback.
  Static,
  /// Non-GET: straight to network, caches untouched.
  Bypass,
}

/// Route configuration for request classification.
#[derive(Debug, Clone)]
pub struct ResolutionRules {
  /// Asset served for navigations to the app root, e.g. "/skeleton"
  pub shell_asset: String,
  /// Path prefix of the photo namespace, e.g. "/photos/"
  pub photo_prefix: String,
  /// Always-available local asset substituted on 404 or network failure
  pub fallback_asset: String,
}

/// Manages versioned named caches of application assets.
///
/// Lifecycle: `install` a new generation (all-or-nothing), then `activate`
/// with a whitelist; every prefixed cache not whitelisted is swept. At most
/// one static generation is active at a time.
pub struct AssetCacheManager<S: CacheStorage> {
  storage: Arc<S>,
  upstream: Arc<Upstream>,
  rules: ResolutionRules,
  active_static: RwLock<Option<String>>,
  install_locks: KeyLocks,
}

impl<S: CacheStorage> AssetCacheManager<S> {
  pub fn new(storage: Arc<S>, upstream: Arc<Upstream>, rules: ResolutionRules) -> Self {
    Self {
      storage,
      upstream,
      rules,
      active_static: RwLock::new(None),
      install_locks: KeyLocks::new(),
    }
  }

  pub fn rules(&self) -> &ResolutionRules {
    &self.rules
  }

  /// The static generation currently serving lookups, if any.
  pub fn active_static(&self) -> Option<String> {
    self
      .active_static
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Classify a request per the resolution table.
  pub fn classify(&self, request: &FetchRequest) -> RequestClass {
    if request.method != Method::GET {
      return RequestClass::Bypass;
    }
    let path = request.url.path();
    if path == "/" {
      return RequestClass::Shell;
    }
    if path.starts_with(&self.rules.photo_prefix) {
      return RequestClass::Photo;
    }
    RequestClass::Static
  }

  /// Fetch and store every manifest entry under `generation`.
  ///
  /// All-or-nothing: the first entry that cannot be fetched aborts the
  /// install and deletes whatever was already stored, so a partial
  /// generation is never left behind to activate. Serialized per generation
  /// name; installs of different generations do not block each other.
  pub async fn install(&self, generation: &str, manifest: &[String]) -> Result<()> {
    let lock = self.install_locks.get(generation);
    let _guard = lock.lock().await;

    for entry in manifest {
      let url = match self.upstream.resolve(entry) {
        Ok(url) => url,
        Err(e) => return self.abandon_install(generation, e.to_string()),
      };
      match self.upstream.get(&url).await {
        Ok(response) if response.is_success() => {
          self.storage.put(generation, url.as_str(), &response)?;
        }
        Ok(response) => {
          return self.abandon_install(
            generation,
            format!("{url} returned status {}", response.status),
          );
        }
        Err(e) => return self.abandon_install(generation, e.to_string()),
      }
    }

    info!(generation, entries = manifest.len(), "installed cache generation");
    Ok(())
  }

  fn abandon_install(&self, generation: &str, reason: String) -> Result<()> {
    self.storage.delete_cache(generation)?;
    Err(Error::InstallIncomplete {
      generation: generation.to_string(),
      reason,
    })
  }

  /// Delete every managed cache not in the whitelist and mark the
  /// whitelisted static generation active. Returns the deleted names.
  ///
  /// Only names carrying the managed prefix are considered; each enumerated
  /// name is checked against the whitelist individually.
  pub fn activate(&self, whitelist: &HashSet<String>) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.cache_names()? {
      if name.starts_with(CACHE_PREFIX) && !whitelist.contains(&name) {
        if self.storage.delete_cache(&name)? {
          deleted.push(name);
        }
      }
    }

    let active = whitelist
      .iter()
      .find(|name| name.starts_with(STATIC_PREFIX))
      .cloned();
    *self
      .active_static
      .write()
      .unwrap_or_else(|e| e.into_inner()) = active.clone();

    info!(?active, ?deleted, "activated cache generations");
    Ok(deleted)
  }

  /// Exact-URL match within the active static generation.
  pub fn lookup(&self, url: &Url) -> Result<Option<StoredResponse>> {
    let Some(generation) = self.active_static() else {
      return Ok(None);
    };
    let entry = self.storage.get(&generation, url.as_str())?;
    debug!(%url, hit = entry.is_some(), "static cache lookup");
    Ok(entry.map(|e| e.response))
  }

  /// Look up an upstream-relative asset path in the active generation.
  pub fn lookup_asset(&self, path: &str) -> Result<Option<StoredResponse>> {
    let url = self.upstream.resolve(path)?;
    self.lookup(&url)
  }

  /// Newest installed static generation by version order, used when a fresh
  /// install fails and the previous generation must keep serving.
  pub fn newest_installed(&self) -> Result<Option<String>> {
    let newest = self
      .storage
      .cache_names()?
      .into_iter()
      .filter(|name| name.starts_with(STATIC_PREFIX))
      .max();
    Ok(newest)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{static_cache_name, SqliteCacheStore, PHOTO_CACHE};
  use crate::testsrv::{route, StubServer};

  fn rules() -> ResolutionRules {
    ResolutionRules {
      shell_asset: "/skeleton".to_string(),
      photo_prefix: "/photos/".to_string(),
      fallback_asset: "/imgs/placeholder.png".to_string(),
    }
  }

  fn manager_at(base: Url) -> AssetCacheManager<SqliteCacheStore> {
    let storage = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    let upstream = Arc::new(Upstream::new(base).unwrap());
    AssetCacheManager::new(storage, upstream, rules())
  }

  fn offline_manager() -> AssetCacheManager<SqliteCacheStore> {
    manager_at(Url::parse("http://feed.invalid/").unwrap())
  }

  #[test]
  fn test_classify_decision_table() {
    let manager = offline_manager();
    let url = |path: &str| Url::parse(&format!("http://feed.invalid{path}")).unwrap();

    let shell = FetchRequest::get(url("/"));
    let photo = FetchRequest::get(url("/photos/9-8024-650px.jpg"));
    let asset = FetchRequest::get(url("/js/main.js"));
    let post = FetchRequest {
      method: Method::POST,
      url: url("/photos/upload"),
    };

    assert_eq!(manager.classify(&shell), RequestClass::Shell);
    assert_eq!(manager.classify(&photo), RequestClass::Photo);
    assert_eq!(manager.classify(&asset), RequestClass::Static);
    assert_eq!(manager.classify(&post), RequestClass::Bypass);
  }

  #[test]
  fn test_activation_sweep_keeps_exactly_whitelisted() {
    let manager = offline_manager();
    let body = StoredResponse::ok(None, Vec::new());
    for name in ["feedcache-static-v1", "feedcache-static-v2", PHOTO_CACHE] {
      manager.storage.put(name, "/x", &body).unwrap();
    }
    // A cache outside the managed prefix must survive untouched.
    manager.storage.put("unrelated-cache", "/y", &body).unwrap();

    let whitelist: HashSet<String> = ["feedcache-static-v2".to_string(), PHOTO_CACHE.to_string()]
      .into_iter()
      .collect();
    let deleted = manager.activate(&whitelist).unwrap();

    assert_eq!(deleted, vec!["feedcache-static-v1"]);
    assert_eq!(
      manager.storage.cache_names().unwrap(),
      vec![PHOTO_CACHE, "feedcache-static-v2", "unrelated-cache"]
    );
    assert_eq!(
      manager.active_static().as_deref(),
      Some("feedcache-static-v2")
    );
  }

  #[tokio::test]
  async fn test_install_stores_manifest_and_serves_lookup() {
    let server = StubServer::start(vec![
      ("/skeleton", route(200, "text/html", b"<html>shell</html>")),
      ("/js/main.js", route(200, "text/javascript", b"app()")),
    ])
    .await;
    let manager = manager_at(server.base().clone());

    let generation = static_cache_name("v1");
    manager
      .install(&generation, &["/skeleton".into(), "/js/main.js".into()])
      .await
      .unwrap();
    let whitelist: HashSet<String> = [generation.clone()].into_iter().collect();
    manager.activate(&whitelist).unwrap();

    let shell = manager.lookup_asset("/skeleton").unwrap().unwrap();
    assert_eq!(shell.body, b"<html>shell</html>");
    assert!(manager.lookup_asset("/css/missing.css").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_failed_install_leaves_no_partial_generation() {
    let server = StubServer::start(vec![(
      "/skeleton",
      route(200, "text/html", b"<html>shell</html>"),
    )])
    .await;
    let manager = manager_at(server.base().clone());

    let generation = static_cache_name("v3");
    let err = manager
      .install(&generation, &["/skeleton".into(), "/js/gone.js".into()])
      .await
      .unwrap_err();

    assert!(matches!(err, Error::InstallIncomplete { .. }));
    assert!(manager.storage.cache_names().unwrap().is_empty());
    assert_eq!(manager.newest_installed().unwrap(), None);
  }
}
