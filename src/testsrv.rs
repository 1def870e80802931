//! Minimal HTTP stub server for exercising network paths in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

pub struct Route {
  pub status: u16,
  pub content_type: &'static str,
  pub body: Vec<u8>,
}

pub fn route(status: u16, content_type: &'static str, body: &[u8]) -> Route {
  Route {
    status,
    content_type,
    body: body.to_vec(),
  }
}

/// One-shot HTTP/1.1 responder with static routes and per-path hit counts.
/// Unknown paths answer 404.
pub struct StubServer {
  base: Url,
  hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl StubServer {
  pub async fn start(routes: Vec<(&'static str, Route)>) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    let routes: Arc<HashMap<String, Route>> = Arc::new(
      routes
        .into_iter()
        .map(|(path, r)| (path.to_string(), r))
        .collect(),
    );
    let hits = Arc::new(Mutex::new(HashMap::new()));

    let accept_hits = hits.clone();
    tokio::spawn(async move {
      loop {
        let Ok((socket, _)) = listener.accept().await else {
          break;
        };
        tokio::spawn(serve_connection(socket, routes.clone(), accept_hits.clone()));
      }
    });

    Self { base, hits }
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  pub fn url(&self, path: &str) -> Url {
    self.base.join(path).unwrap()
  }

  /// How many requests hit the given path (query excluded).
  pub fn hits(&self, path: &str) -> usize {
    *self.hits.lock().unwrap().get(path).unwrap_or(&0)
  }
}

async fn serve_connection(
  mut socket: tokio::net::TcpStream,
  routes: Arc<HashMap<String, Route>>,
  hits: Arc<Mutex<HashMap<String, usize>>>,
) {
  let mut buf = vec![0u8; 8192];
  let mut read = 0;
  loop {
    let Ok(n) = socket.read(&mut buf[read..]).await else {
      return;
    };
    if n == 0 {
      break;
    }
    read += n;
    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
      break;
    }
  }

  let head = String::from_utf8_lossy(&buf[..read]);
  let mut parts = head.split_whitespace();
  let _method = parts.next().unwrap_or("");
  let target = parts.next().unwrap_or("");
  let path = target.split('?').next().unwrap_or("").to_string();

  *hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

  let (status, content_type, body) = match routes.get(&path) {
    Some(r) => (r.status, r.content_type, r.body.clone()),
    None => (404, "text/plain", b"not found".to_vec()),
  };

  let reason = if status == 200 { "OK" } else { "NO" };
  let header = format!(
    "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    body.len()
  );
  let _ = socket.write_all(header.as_bytes()).await;
  let _ = socket.write_all(&body).await;
  let _ = socket.shutdown().await;
}
