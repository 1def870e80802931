//! Live-feed client: streams record batches into the store and reconnects
//! forever on a fixed delay.

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::records::RecordStore;

/// Streaming client for the upstream updates endpoint.
///
/// The wire format is newline-delimited JSON: each line is an array of
/// record objects. Resumption uses `since=<latest stored time>`.
#[derive(Clone)]
pub struct FeedClient {
  http: reqwest::Client,
  updates_url: Url,
  reconnect_delay: Duration,
}

impl FeedClient {
  pub fn new(base: &Url, reconnect_delay: Duration) -> Result<Self> {
    let updates_url = base.join("updates").map_err(|e| Error::FetchFailed {
      url: base.to_string(),
      reason: format!("bad updates endpoint: {e}"),
    })?;
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| Error::HttpClient(e.to_string()))?;

    Ok(Self {
      http,
      updates_url,
      reconnect_delay,
    })
  }

  /// Consume the feed until the process exits. Disconnects and transport
  /// errors are logged and answered with a fixed-delay reconnect, uncapped.
  pub async fn run(&self, store: Arc<RecordStore>) {
    loop {
      match self.stream_once(&store).await {
        Ok(()) => info!("feed stream ended, reconnecting"),
        Err(e) => warn!("feed connection failed: {e}"),
      }
      sleep(self.reconnect_delay).await;
    }
  }

  /// One connection: request updates since the newest stored record and
  /// apply batches as lines arrive.
  async fn stream_once(&self, store: &RecordStore) -> Result<()> {
    let mut url = self.updates_url.clone();
    if let Some(since) = store.latest_time()? {
      url.query_pairs_mut().append_pair("since", &since.to_string());
    }

    debug!(%url, "connecting to feed");
    let response = self
      .http
      .get(url.clone())
      .send()
      .await
      .map_err(|e| Error::FetchFailed {
        url: url.to_string(),
        reason: e.to_string(),
      })?;
    if !response.status().is_success() {
      return Err(Error::FetchFailed {
        url: url.to_string(),
        reason: format!("status {}", response.status()),
      });
    }
    info!("feed connected");

    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
      let chunk = chunk.map_err(|e| Error::FetchFailed {
        url: url.to_string(),
        reason: format!("stream error: {e}"),
      })?;
      buf.extend_from_slice(&chunk);

      while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        apply_line(store, &line[..line.len() - 1])?;
      }
    }
    if !buf.is_empty() {
      apply_line(store, &buf)?;
    }

    Ok(())
  }
}

/// Apply one feed line: a JSON array of records. Malformed lines are
/// skipped with a warning; per-record validation happens in the store.
fn apply_line(store: &RecordStore, line: &[u8]) -> Result<()> {
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  if line.iter().all(u8::is_ascii_whitespace) {
    return Ok(());
  }

  match serde_json::from_slice::<Vec<Value>>(line) {
    Ok(batch) => {
      let outcome = store.append_batch(&batch)?;
      debug!(
        appended = outcome.appended,
        rejected = outcome.rejected,
        trimmed = outcome.trimmed,
        "applied feed batch"
      );
    }
    Err(e) => warn!("skipping malformed feed batch: {e}"),
  }
  Ok(())
}
