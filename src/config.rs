use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::records::DEFAULT_RETENTION_LIMIT;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub upstream: UpstreamConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub feed: FeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
  /// Base URL of the feed origin, e.g. https://feed.example.com
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version tag of the static generation; bump when the manifest changes
  #[serde(default = "default_static_version")]
  pub static_version: String,
  /// Upstream-relative assets fetched into each static generation
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Document served for navigations to the app root
  #[serde(default = "default_shell")]
  pub shell: String,
  /// Path prefix of the photo namespace
  #[serde(default = "default_photo_prefix")]
  pub photo_prefix: String,
  /// Asset substituted on upstream 404 or network failure
  #[serde(default = "default_fallback_asset")]
  pub fallback_asset: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  /// Maximum number of feed records kept locally
  #[serde(default = "default_retention_limit")]
  pub retention_limit: usize,
  /// Override for the data directory (databases live here)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
  /// Delay before reconnecting a dropped feed stream
  #[serde(default = "default_reconnect_delay_secs")]
  pub reconnect_delay_secs: u64,
  /// Interval between photo-cache reconcile passes
  #[serde(default = "default_reconcile_interval_secs")]
  pub reconcile_interval_secs: u64,
}

fn default_static_version() -> String {
  "v1".to_string()
}

fn default_manifest() -> Vec<String> {
  [
    "/skeleton",
    "/js/main.js",
    "/css/main.css",
    "/imgs/icon.png",
    "/imgs/placeholder.png",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_shell() -> String {
  "/skeleton".to_string()
}

fn default_photo_prefix() -> String {
  "/photos/".to_string()
}

fn default_fallback_asset() -> String {
  "/imgs/placeholder.png".to_string()
}

fn default_retention_limit() -> usize {
  DEFAULT_RETENTION_LIMIT
}

fn default_reconnect_delay_secs() -> u64 {
  5
}

fn default_reconcile_interval_secs() -> u64 {
  300
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_version: default_static_version(),
      manifest: default_manifest(),
      shell: default_shell(),
      photo_prefix: default_photo_prefix(),
      fallback_asset: default_fallback_asset(),
    }
  }
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      retention_limit: default_retention_limit(),
      data_dir: None,
    }
  }
}

impl Default for FeedConfig {
  fn default() -> Self {
    Self {
      reconnect_delay_secs: default_reconnect_delay_secs(),
      reconcile_interval_secs: default_reconcile_interval_secs(),
    }
  }
}

impl FeedConfig {
  pub fn reconnect_delay(&self) -> Duration {
    Duration::from_secs(self.reconnect_delay_secs)
  }

  pub fn reconcile_interval(&self) -> Duration {
    Duration::from_secs(self.reconcile_interval_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feedcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/feedcache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feedcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feedcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parsed upstream base URL.
  pub fn upstream_url(&self) -> Result<Url> {
    Url::parse(&self.upstream.url)
      .map_err(|e| eyre!("Invalid upstream url '{}': {}", self.upstream.url, e))
  }

  /// Directory holding the record and cache databases.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.store.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("feedcache"))
  }
}
