//! Composition root: owns the stores, caches, and policy, and drives the
//! background tasks.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{
  static_cache_name, AssetCacheManager, PhotoCache, ResolutionRules, SqliteCacheStore,
  PHOTO_CACHE,
};
use crate::config::Config;
use crate::feed::FeedClient;
use crate::fetch::{FetchPolicy, FetchRequest, FetchResponse};
use crate::records::{Record, RecordStore};
use crate::upstream::Upstream;

/// Application state, constructed once at startup and passed by reference
/// to every task that needs it.
pub struct App {
  config: Config,
  store: Arc<RecordStore>,
  assets: Arc<AssetCacheManager<SqliteCacheStore>>,
  photos: Arc<PhotoCache<SqliteCacheStore>>,
  policy: FetchPolicy<SqliteCacheStore>,
  feed: FeedClient,
  upstream: Arc<Upstream>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let store = Arc::new(RecordStore::open(
      &data_dir.join("records.db"),
      config.store.retention_limit,
    )?);
    let storage = Arc::new(SqliteCacheStore::open(&data_dir.join("caches.db"))?);

    let upstream = Arc::new(Upstream::new(config.upstream_url()?)?);
    let rules = ResolutionRules {
      shell_asset: config.cache.shell.clone(),
      photo_prefix: config.cache.photo_prefix.clone(),
      fallback_asset: config.cache.fallback_asset.clone(),
    };
    let assets = Arc::new(AssetCacheManager::new(
      storage.clone(),
      upstream.clone(),
      rules,
    ));
    let photos = Arc::new(PhotoCache::new(storage, upstream.clone()));
    let policy = FetchPolicy::new(assets.clone(), photos.clone(), upstream.clone());
    let feed = FeedClient::new(upstream.base(), config.feed.reconnect_delay())?;

    Ok(Self {
      config,
      store,
      assets,
      photos,
      policy,
      feed,
      upstream,
    })
  }

  /// Run the daemon: refresh the static generation, start the live feed,
  /// and reconcile the photo cache on an interval. Returns only on fatal
  /// startup errors; steady-state failures are logged and retried.
  pub async fn run(&self) -> Result<()> {
    info!(records = self.store.len()?, "record store opened");
    self.upgrade_caches().await?;

    let feed = self.feed.clone();
    let store = self.store.clone();
    tokio::spawn(async move { feed.run(store).await });

    self.reconcile_loop().await;
    Ok(())
  }

  /// Install the configured static generation and sweep superseded ones.
  /// If the install fails, the newest previously installed generation keeps
  /// serving and nothing is swept away from under it.
  async fn upgrade_caches(&self) -> Result<()> {
    let generation = static_cache_name(&self.config.cache.static_version);

    let active = match self
      .assets
      .install(&generation, &self.config.cache.manifest)
      .await
    {
      Ok(()) => Some(generation),
      Err(e) => {
        warn!("cache install failed, keeping previous generation: {e}");
        self.assets.newest_installed()?
      }
    };

    match active {
      Some(active) => {
        let whitelist: HashSet<String> =
          [active, PHOTO_CACHE.to_string()].into_iter().collect();
        self.assets.activate(&whitelist)?;
      }
      None => info!("no static generation available yet, skipping activation"),
    }

    Ok(())
  }

  /// Reconcile the photo cache against a record snapshot, once at startup
  /// and then on the configured interval. Never blocks the append path.
  async fn reconcile_loop(&self) {
    let mut interval = tokio::time::interval(self.config.feed.reconcile_interval());
    loop {
      interval.tick().await;
      match self.store.get_all() {
        Ok(snapshot) => {
          if let Err(e) = self.photos.reconcile(&snapshot) {
            warn!("photo reconcile failed: {e}");
          }
        }
        Err(e) => warn!("failed to snapshot records: {e}"),
      }
    }
  }

  /// Resolve one request (absolute URL or upstream-relative path) through
  /// the fetch policy.
  pub async fn resolve(&self, raw: &str) -> Result<FetchResponse> {
    let url = match url::Url::parse(raw) {
      Ok(url) => url,
      Err(_) => self.upstream.resolve(raw)?,
    };
    Ok(self.policy.handle(&FetchRequest::get(url)).await)
  }

  /// Stored feed records, newest first.
  pub fn posts(&self) -> Result<Vec<Record>> {
    Ok(self.store.get_all_descending()?)
  }
}
