//! Upstream HTTP client shared by cache install, photo fetch, and the
//! generic network path.

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use url::Url;

use crate::cache::StoredResponse;
use crate::error::{Error, Result};

/// Thin wrapper around a reqwest client pinned to the feed origin.
#[derive(Clone)]
pub struct Upstream {
  http: reqwest::Client,
  base: Url,
}

impl Upstream {
  pub fn new(base: Url) -> Result<Self> {
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| Error::HttpClient(e.to_string()))?;

    Ok(Self { http, base })
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// Resolve an upstream-relative path (or an absolute URL) against the
  /// configured base.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self.base.join(path).map_err(|e| Error::FetchFailed {
      url: path.to_string(),
      reason: format!("unresolvable against {}: {e}", self.base),
    })
  }

  /// GET a URL; any response, regardless of status, becomes a
  /// [`StoredResponse`]. Only transport failures are errors.
  pub async fn get(&self, url: &Url) -> Result<StoredResponse> {
    self.request(Method::GET, url).await
  }

  /// GET a URL and require a success status.
  pub async fn get_ok(&self, url: &Url) -> Result<StoredResponse> {
    let response = self.get(url).await?;
    if !response.is_success() {
      return Err(Error::FetchFailed {
        url: url.to_string(),
        reason: format!("upstream returned status {}", response.status),
      });
    }
    Ok(response)
  }

  /// Forward a request with an arbitrary method. Used by the non-GET bypass.
  pub async fn request(&self, method: Method, url: &Url) -> Result<StoredResponse> {
    let response = self
      .http
      .request(method, url.clone())
      .send()
      .await
      .map_err(|e| Error::FetchFailed {
        url: url.to_string(),
        reason: e.to_string(),
      })?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| Error::FetchFailed {
        url: url.to_string(),
        reason: format!("failed to read body: {e}"),
      })?
      .to_vec();

    Ok(StoredResponse {
      status,
      content_type,
      body,
    })
  }
}
