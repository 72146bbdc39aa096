//! Interception engine: cache-first with network fallback.
//!
//! For each GET:
//! 1. Look up the current generation - on a hit, return it, no network
//! 2. On a miss, fetch once from the network
//! 3. Cacheable responses are duplicated and written back in the background
//! 4. On network failure, documents fall back to the cached root document
//!    and everything else gets a synthesized 408

use reqwest::Method;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{CacheHandle, CacheStore, Served};
use crate::error::NetworkError;
use crate::generation::GenerationId;
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;

/// What the host should do with an intercepted request.
#[derive(Debug)]
pub enum Disposition {
  /// Not intercepted; the host performs the request itself
  PassThrough(Request),
  /// Answer the request with this response
  Respond(Served),
  /// Offline navigation with no cached fallback document
  Unavailable(NetworkError),
}

impl Disposition {
  pub fn served(&self) -> Option<&Served> {
    match self {
      Disposition::Respond(served) => Some(served),
      _ => None,
    }
  }

  pub fn into_served(self) -> Option<Served> {
    match self {
      Disposition::Respond(served) => Some(served),
      _ => None,
    }
  }
}

/// Per-request decision function plus the write-back policy.
pub struct InterceptionEngine<S: CacheStore> {
  cache: CacheHandle<S>,
  network: Arc<dyn Network>,
  fallback: RequestKey,
  offline_message: String,
  pending: Mutex<JoinSet<()>>,
}

impl<S: CacheStore> InterceptionEngine<S> {
  /// `fallback` is the key served for offline navigations.
  pub fn new(
    cache: CacheHandle<S>,
    network: Arc<dyn Network>,
    fallback: RequestKey,
    offline_message: impl Into<String>,
  ) -> Self {
    Self {
      cache,
      network,
      fallback,
      offline_message: offline_message.into(),
      pending: Mutex::new(JoinSet::new()),
    }
  }

  pub fn generation(&self) -> &GenerationId {
    self.cache.generation()
  }

  fn pending(&self) -> MutexGuard<'_, JoinSet<()>> {
    self.pending.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Decide how to answer one request.
  ///
  /// Never fails: errors become a cached fallback, a synthesized response,
  /// or `Unavailable` for navigations with nothing to fall back on.
  pub async fn handle(&self, request: Request) -> Disposition {
    if request.method != Method::GET {
      debug!(method = %request.method, url = %request.url, "not intercepted");
      return Disposition::PassThrough(request);
    }

    let key = request.key();
    match self.cache.lookup(&key) {
      Ok(Some(cached)) => {
        debug!(url = %request.url, "serving from cache");
        return Disposition::Respond(Served::from_cache(cached));
      }
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "cache lookup failed, treating as miss"),
    }

    debug!(url = %request.url, "fetching from network");
    match self.network.fetch(&request).await {
      Ok(response) => {
        if response.is_cacheable() {
          self.write_back(key, response.duplicate());
        } else {
          debug!(url = %request.url, status = response.status, kind = ?response.kind, "not caching");
        }
        Disposition::Respond(Served::from_network(response))
      }
      Err(error) => self.offline(&request, error),
    }
  }

  /// Persist a response in the background. Failures are only logged.
  fn write_back(&self, key: RequestKey, response: Response) {
    let cache = self.cache.clone();
    let mut pending = self.pending();
    // Reap finished write-backs so the set does not grow without bound
    while pending.try_join_next().is_some() {}

    // A deleted generation stays deleted
    pending.spawn_blocking(move || match cache.put_if_present(&key, &response) {
      Ok(true) => debug!(%key, generation = %cache.generation(), "cached"),
      Ok(false) => debug!(%key, generation = %cache.generation(), "generation gone, not caching"),
      Err(e) => warn!(%key, generation = %cache.generation(), error = %e, "write-back failed"),
    });
  }

  fn offline(&self, request: &Request, error: NetworkError) -> Disposition {
    warn!(url = %request.url, error = %error, "network fetch failed");

    if request.destination.is_document() {
      return match self.cache.lookup(&self.fallback) {
        Ok(Some(cached)) => {
          debug!(url = %request.url, fallback = %self.fallback, "serving fallback document");
          Disposition::Respond(Served::fallback(cached))
        }
        Ok(None) => Disposition::Unavailable(error),
        Err(e) => {
          warn!(fallback = %self.fallback, error = %e, "fallback lookup failed");
          Disposition::Unavailable(error)
        }
      };
    }

    Disposition::Respond(Served::offline(Response::offline(&self.offline_message)))
  }

  /// Wait for every write-back started so far.
  pub async fn flush(&self) {
    let mut pending = std::mem::take(&mut *self.pending());
    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "write-back task failed");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStore, SqliteStore};
  use crate::http::ResponseKind;
  use crate::testing::{url, FailingStore, FakeNetwork};

  const OFFLINE: &str = "You are offline.";

  fn engine<S: CacheStore>(store: &Arc<S>, network: &Arc<FakeNetwork>) -> InterceptionEngine<S> {
    InterceptionEngine::new(
      CacheHandle::detached(Arc::clone(store), GenerationId::from("v1")),
      network.clone(),
      Request::get(url("./index.html")).key(),
      OFFLINE,
    )
  }

  fn seed<S: CacheStore>(store: &S, path: &str, body: &str) {
    store
      .put(
        &GenerationId::from("v1"),
        &Request::get(url(path)).key(),
        &Response::new(200, ResponseKind::Basic, body),
      )
      .unwrap();
  }

  #[tokio::test]
  async fn test_hit_skips_network() {
    let store = Arc::new(MemoryStore::new());
    seed(&*store, "/app.js", "cached");
    let network = Arc::new(FakeNetwork::new());
    network.serve("/app.js", "fresh");
    let engine = engine(&store, &network);

    let served = engine
      .handle(Request::get(url("/app.js")))
      .await
      .into_served()
      .unwrap();

    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.text(), "cached");
    assert!(served.cached_at.is_some());
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_miss_fetches_once_then_hits() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.serve("/app.js", "fresh");
    store.open(&GenerationId::from("v1")).unwrap();
    let engine = engine(&store, &network);

    let first = engine
      .handle(Request::get(url("/app.js")))
      .await
      .into_served()
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.response.text(), "fresh");
    assert_eq!(network.calls(), 1);

    engine.flush().await;

    let second = engine
      .handle(Request::get(url("/app.js")))
      .await
      .into_served()
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response, first.response);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_non_get_passes_through() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    let engine = engine(&store, &network);

    for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
      let request = Request::new(method.clone(), url("/api/items")).with_body("{}");
      match engine.handle(request).await {
        Disposition::PassThrough(request) => {
          assert_eq!(request.method, method);
          assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
        }
        other => panic!("expected pass-through, got {:?}", other),
      }
    }

    engine.flush().await;
    assert_eq!(network.calls(), 0);
    assert!(store.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_non_cacheable_responses_are_returned_not_stored() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.serve_response("/cdn.js", Response::new(200, ResponseKind::Opaque, ""));
    let engine = engine(&store, &network);

    let opaque = engine.handle(Request::get(url("/cdn.js"))).await;
    let missing = engine.handle(Request::get(url("/missing.js"))).await;
    engine.flush().await;

    assert_eq!(opaque.served().unwrap().response.kind, ResponseKind::Opaque);
    assert_eq!(missing.served().unwrap().response.status, 404);
    assert!(store
      .entry_keys(&GenerationId::from("v1"))
      .unwrap()
      .is_empty());
  }

  #[tokio::test]
  async fn test_write_back_failure_does_not_affect_response() {
    let store = Arc::new(FailingStore::new());
    store.fail_writes(true);
    let network = Arc::new(FakeNetwork::new());
    network.serve("/style.css", "body {}");
    let engine = engine(&store, &network);

    let served = engine
      .handle(Request::get(url("/style.css")))
      .await
      .into_served()
      .unwrap();
    engine.flush().await;

    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.status, 200);
    assert_eq!(served.response.text(), "body {}");
    assert_eq!(store.writes(), 1);
    assert!(store.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_write_back_does_not_recreate_deleted_generation() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.serve("/app.js", "fresh");
    let engine = engine(&store, &network);

    let served = engine
      .handle(Request::get(url("/app.js")))
      .await
      .into_served()
      .unwrap();
    engine.flush().await;

    assert_eq!(served.source, CacheSource::Network);
    assert!(store.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_subresource_gets_408() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);
    let engine = engine(&store, &network);

    let served = engine
      .handle(Request::get(url("/app.js")))
      .await
      .into_served()
      .unwrap();

    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.status, 408);
    assert_eq!(served.response.status_text, "Offline");
    assert_eq!(served.response.text(), OFFLINE);
  }

  #[tokio::test]
  async fn test_offline_navigation_serves_cached_document() {
    let store = Arc::new(MemoryStore::new());
    seed(&*store, "./index.html", "<html>app</html>");
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);
    let engine = engine(&store, &network);

    let served = engine
      .handle(Request::navigate(url("/todo/42")))
      .await
      .into_served()
      .unwrap();

    let snapshot = store
      .lookup(
        &GenerationId::from("v1"),
        &Request::get(url("./index.html")).key(),
      )
      .unwrap()
      .unwrap();
    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.response, snapshot.response);
  }

  #[tokio::test]
  async fn test_offline_navigation_without_fallback_is_unavailable() {
    let store = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);
    let engine = engine(&store, &network);

    let result = engine.handle(Request::navigate(url("/"))).await;

    assert!(matches!(
      result,
      Disposition::Unavailable(NetworkError::Unreachable { .. })
    ));
  }

  #[tokio::test]
  async fn test_concurrent_misses_are_all_written_back() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let paths: Vec<String> = (0..8).map(|i| format!("/chunk-{}.js", i)).collect();
    for path in &paths {
      network.serve(path, path);
    }
    store.open(&GenerationId::from("v1")).unwrap();
    let engine = engine(&store, &network);

    let handled = futures::future::join_all(
      paths
        .iter()
        .map(|path| engine.handle(Request::get(url(path)))),
    )
    .await;
    engine.flush().await;

    assert!(handled
      .iter()
      .all(|d| d.served().map(|s| s.source) == Some(CacheSource::Network)));
    assert_eq!(
      store.entry_keys(&GenerationId::from("v1")).unwrap().len(),
      paths.len()
    );
  }
}
