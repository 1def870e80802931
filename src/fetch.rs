//! Fetch policy: the single `handle(request) -> response` entry point.
//!
//! Every GET resolves to exactly one of: cached shell, photo resolution,
//! or cache-then-network with fallback. Failures terminate in the fallback
//! asset or a synthetic failure body, never in an error.

use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{
  AssetCacheManager, CacheStorage, PhotoCache, RequestClass, StoredResponse,
};
use crate::upstream::Upstream;

/// An inbound request as seen by the policy.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: Method,
  pub url: Url,
}

impl FetchRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
    }
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Served from a named cache
  Cache,
  /// Fetched from the network
  Network,
  /// The fixed fallback asset substituted for a failure
  Fallback,
  /// Synthesized locally because nothing else could be produced
  Synthetic,
}

/// The policy's answer to a request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl FetchResponse {
  fn from_stored(response: StoredResponse, source: ResponseSource) -> Self {
    Self {
      status: response.status,
      content_type: response.content_type,
      body: response.body,
      source,
    }
  }

  fn synthetic_failure() -> Self {
    Self {
      status: 503,
      content_type: Some("text/plain".to_string()),
      body: b"resource request failed".to_vec(),
      source: ResponseSource::Synthetic,
    }
  }
}

/// Stateless dispatcher over the asset caches and the photo cache.
pub struct FetchPolicy<S: CacheStorage> {
  assets: Arc<AssetCacheManager<S>>,
  photos: Arc<PhotoCache<S>>,
  upstream: Arc<Upstream>,
}

impl<S: CacheStorage> FetchPolicy<S> {
  pub fn new(
    assets: Arc<AssetCacheManager<S>>,
    photos: Arc<PhotoCache<S>>,
    upstream: Arc<Upstream>,
  ) -> Self {
    Self {
      assets,
      photos,
      upstream,
    }
  }

  /// Resolve one request. Infallible: every branch ends in a response.
  pub async fn handle(&self, request: &FetchRequest) -> FetchResponse {
    let class = self.assets.classify(request);
    debug!(method = %request.method, url = %request.url, ?class, "handling request");
    match class {
      RequestClass::Bypass => self.passthrough(request).await,
      RequestClass::Shell => self.serve_shell().await,
      RequestClass::Photo => self.serve_photo(&request.url).await,
      RequestClass::Static => self.serve_static(&request.url).await,
    }
  }

  /// Non-GET: straight through to the network, caches untouched.
  async fn passthrough(&self, request: &FetchRequest) -> FetchResponse {
    match self
      .upstream
      .request(request.method.clone(), &request.url)
      .await
    {
      Ok(response) => FetchResponse::from_stored(response, ResponseSource::Network),
      Err(e) => {
        warn!("passthrough failed: {e}");
        FetchResponse::synthetic_failure()
      }
    }
  }

  /// App-root navigation: the cached shell document. The network is only
  /// consulted if no generation has ever installed the shell.
  async fn serve_shell(&self) -> FetchResponse {
    let shell = self.assets.rules().shell_asset.clone();
    match self.assets.lookup_asset(&shell) {
      Ok(Some(response)) => return FetchResponse::from_stored(response, ResponseSource::Cache),
      Ok(None) => warn!("shell not cached, falling back to network"),
      Err(e) => warn!("shell lookup failed: {e}"),
    }

    match self.fetch_asset(&shell).await {
      Some(response) => FetchResponse::from_stored(response, ResponseSource::Network),
      None => FetchResponse::synthetic_failure(),
    }
  }

  async fn serve_photo(&self, url: &Url) -> FetchResponse {
    match self.photos.store_or_fetch(url).await {
      Ok((response, from_cache)) => {
        let source = if from_cache {
          ResponseSource::Cache
        } else {
          ResponseSource::Network
        };
        FetchResponse::from_stored(response, source)
      }
      Err(e) => {
        warn!("photo resolution failed: {e}");
        self.fallback().await
      }
    }
  }

  /// Generic assets: cache-first, then network; upstream 404 and transport
  /// failures substitute the fallback asset, other statuses pass through.
  async fn serve_static(&self, url: &Url) -> FetchResponse {
    match self.assets.lookup(url) {
      Ok(Some(response)) => return FetchResponse::from_stored(response, ResponseSource::Cache),
      Ok(None) => {}
      Err(e) => warn!("cache lookup failed: {e}"),
    }

    match self.upstream.get(url).await {
      Ok(response) if response.status == 404 => {
        debug!(%url, "upstream 404, substituting fallback");
        self.fallback().await
      }
      Ok(response) => FetchResponse::from_stored(response, ResponseSource::Network),
      Err(e) => {
        warn!("network fetch failed: {e}");
        self.fallback().await
      }
    }
  }

  /// The fixed fallback asset: from the active generation if installed,
  /// from the network as a last resort, synthetic if even that fails.
  async fn fallback(&self) -> FetchResponse {
    let fallback = self.assets.rules().fallback_asset.clone();
    match self.assets.lookup_asset(&fallback) {
      Ok(Some(response)) => return FetchResponse::from_stored(response, ResponseSource::Fallback),
      Ok(None) => {}
      Err(e) => warn!("fallback lookup failed: {e}"),
    }

    match self.fetch_asset(&fallback).await {
      Some(response) => FetchResponse::from_stored(response, ResponseSource::Fallback),
      None => FetchResponse::synthetic_failure(),
    }
  }

  async fn fetch_asset(&self, path: &str) -> Option<StoredResponse> {
    let url = self.upstream.resolve(path).ok()?;
    match self.upstream.get_ok(&url).await {
      Ok(response) => Some(response),
      Err(e) => {
        warn!("asset fetch failed: {e}");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{static_cache_name, SqliteCacheStore, PHOTO_CACHE};
  use crate::testsrv::{route, StubServer};
  use std::collections::HashSet;

  const PLACEHOLDER: &[u8] = b"placeholder image";

  fn policy_at(server: &StubServer) -> FetchPolicy<SqliteCacheStore> {
    policy_with_base(server.base().clone())
  }

  fn policy_with_base(base: Url) -> FetchPolicy<SqliteCacheStore> {
    let storage = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    let upstream = Arc::new(Upstream::new(base).unwrap());
    let rules = crate::cache::ResolutionRules {
      shell_asset: "/skeleton".to_string(),
      photo_prefix: "/photos/".to_string(),
      fallback_asset: "/imgs/placeholder.png".to_string(),
    };
    let assets = Arc::new(AssetCacheManager::new(
      storage.clone(),
      upstream.clone(),
      rules,
    ));
    let photos = Arc::new(PhotoCache::new(storage, upstream.clone()));
    FetchPolicy::new(assets, photos, upstream)
  }

  async fn install_defaults(policy: &FetchPolicy<SqliteCacheStore>) -> String {
    let generation = static_cache_name("v1");
    policy
      .assets
      .install(
        &generation,
        &["/skeleton".into(), "/imgs/placeholder.png".into()],
      )
      .await
      .unwrap();
    let whitelist: HashSet<String> = [generation.clone(), PHOTO_CACHE.to_string()]
      .into_iter()
      .collect();
    policy.assets.activate(&whitelist).unwrap();
    generation
  }

  fn stub_routes() -> Vec<(&'static str, crate::testsrv::Route)> {
    vec![
      ("/skeleton", route(200, "text/html", b"<html>shell</html>")),
      ("/imgs/placeholder.png", route(200, "image/png", PLACEHOLDER)),
      ("/posts.json", route(200, "application/json", b"[]")),
      ("/photos/a-640px.jpg", route(200, "image/jpeg", b"photo a")),
    ]
  }

  #[tokio::test]
  async fn test_upstream_404_resolves_to_fallback_asset() {
    let server = StubServer::start(stub_routes()).await;
    let policy = policy_at(&server);
    install_defaults(&policy).await;

    let response = policy
      .handle(&FetchRequest::get(server.url("/js/nope.js")))
      .await;

    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.body, PLACEHOLDER);
    // Served from the installed generation, not refetched.
    assert_eq!(server.hits("/imgs/placeholder.png"), 1);
  }

  #[tokio::test]
  async fn test_shell_served_from_cache_without_network() {
    let server = StubServer::start(stub_routes()).await;
    let policy = policy_at(&server);
    install_defaults(&policy).await;

    let response = policy.handle(&FetchRequest::get(server.url("/"))).await;

    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.body, b"<html>shell</html>");
    assert_eq!(server.hits("/skeleton"), 1); // install only
  }

  #[tokio::test]
  async fn test_static_cache_first_then_network() {
    let server = StubServer::start(stub_routes()).await;
    let policy = policy_at(&server);
    install_defaults(&policy).await;

    // Cached asset: no extra upstream hit.
    let cached = policy
      .handle(&FetchRequest::get(server.url("/imgs/placeholder.png")))
      .await;
    assert_eq!(cached.source, ResponseSource::Cache);

    // Uncached asset: fetched from the network, not stored back.
    let fetched = policy
      .handle(&FetchRequest::get(server.url("/posts.json")))
      .await;
    assert_eq!(fetched.source, ResponseSource::Network);
    assert_eq!(fetched.body, b"[]");
    let key = server.url("/posts.json");
    assert!(policy.assets.lookup(&key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_photo_request_resolved_by_photo_cache() {
    let server = StubServer::start(stub_routes()).await;
    let policy = policy_at(&server);
    install_defaults(&policy).await;

    let first = policy
      .handle(&FetchRequest::get(server.url("/photos/a-640px.jpg")))
      .await;
    assert_eq!(first.source, ResponseSource::Network);

    let second = policy
      .handle(&FetchRequest::get(server.url("/photos/a-640px.jpg")))
      .await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(server.hits("/photos/a-640px.jpg"), 1);
  }

  #[tokio::test]
  async fn test_missing_photo_resolves_to_fallback() {
    let server = StubServer::start(stub_routes()).await;
    let policy = policy_at(&server);
    install_defaults(&policy).await;

    let response = policy
      .handle(&FetchRequest::get(server.url("/photos/missing.jpg")))
      .await;

    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.body, PLACEHOLDER);
  }

  #[tokio::test]
  async fn test_non_get_bypasses_caches() {
    let server = StubServer::start(stub_routes()).await;
    let policy = policy_at(&server);
    install_defaults(&policy).await;

    let request = FetchRequest {
      method: Method::POST,
      url: server.url("/posts.json"),
    };
    let response = policy.handle(&request).await;

    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(server.hits("/posts.json"), 1);
  }

  #[tokio::test]
  async fn test_unreachable_upstream_without_fallback_is_synthetic() {
    // Nothing installed, nothing listening: even the fallback asset is
    // unreachable, so the policy synthesizes a failure body.
    let policy = policy_with_base(Url::parse("http://127.0.0.1:9/").unwrap());

    let response = policy
      .handle(&FetchRequest::get(
        Url::parse("http://127.0.0.1:9/gone.js").unwrap(),
      ))
      .await;

    assert_eq!(response.source, ResponseSource::Synthetic);
    assert_eq!(response.status, 503);
  }
}
