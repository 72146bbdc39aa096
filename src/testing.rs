//! Test doubles for the network, the store and the notifier.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::cache::{CacheStore, CachedResponse, MemoryStore};
use crate::error::{NetworkError, StoreError, StoreResult};
use crate::generation::GenerationId;
use crate::http::{Request, RequestKey, Response, ResponseKind};
use crate::network::Network;
use crate::notify::{Notification, Notifier};

pub const ORIGIN: &str = "http://localhost:8080/";

/// Resolve a path against the test origin.
pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Scripted network. Unknown URLs answer 404.
#[derive(Default)]
pub struct FakeNetwork {
  responses: Mutex<HashMap<String, Response>>,
  failing: Mutex<HashSet<String>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer `path` with a same-origin 200.
  pub fn serve(&self, path: &str, body: &str) {
    self.serve_response(path, Response::new(200, ResponseKind::Basic, body));
  }

  /// Also clears an earlier `fail` for the same path.
  pub fn serve_response(&self, path: &str, response: Response) {
    let key = url(path).to_string();
    self.failing.lock().unwrap().remove(&key);
    self.responses.lock().unwrap().insert(key, response);
  }

  /// Make requests for `path` fail as unreachable.
  pub fn fail(&self, path: &str) {
    self.failing.lock().unwrap().insert(url(path).to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let key = request.url.to_string();

    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&key) {
      return Err(NetworkError::Unreachable {
        url: key,
        message: "connection refused".to_string(),
      });
    }

    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(&key)
        .map(Response::duplicate)
        .unwrap_or_else(|| Response::new(404, ResponseKind::Basic, "not found")),
    )
  }
}

/// Memory store with injectable write and delete failures.
#[derive(Default)]
pub struct FailingStore {
  inner: MemoryStore,
  fail_writes: AtomicBool,
  fail_deletes: Mutex<HashSet<GenerationId>>,
  writes: AtomicUsize,
}

impl FailingStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn fail_delete_of(&self, generation: GenerationId) {
    self.fail_deletes.lock().unwrap().insert(generation);
  }

  /// Number of attempted writes, failed or not.
  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  fn check_write(&self) -> StoreResult<()> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable {
        message: "disk full".to_string(),
      });
    }
    Ok(())
  }
}

impl CacheStore for FailingStore {
  fn open(&self, generation: &GenerationId) -> StoreResult<bool> {
    self.inner.open(generation)
  }

  fn lookup(
    &self,
    generation: &GenerationId,
    key: &RequestKey,
  ) -> StoreResult<Option<CachedResponse>> {
    self.inner.lookup(generation, key)
  }

  fn put(&self, generation: &GenerationId, key: &RequestKey, response: &Response) -> StoreResult<()> {
    self.check_write()?;
    self.inner.put(generation, key, response)
  }

  fn put_if_present(
    &self,
    generation: &GenerationId,
    key: &RequestKey,
    response: &Response,
  ) -> StoreResult<bool> {
    self.check_write()?;
    self.inner.put_if_present(generation, key, response)
  }

  fn put_all(
    &self,
    generation: &GenerationId,
    entries: &[(RequestKey, Response)],
  ) -> StoreResult<()> {
    self.check_write()?;
    self.inner.put_all(generation, entries)
  }

  fn delete(&self, generation: &GenerationId) -> StoreResult<bool> {
    if self.fail_deletes.lock().unwrap().contains(generation) {
      return Err(StoreError::Unavailable {
        message: format!("{} is locked", generation),
      });
    }
    self.inner.delete(generation)
  }

  fn keys(&self) -> StoreResult<Vec<GenerationId>> {
    self.inner.keys()
  }

  fn entry_keys(&self, generation: &GenerationId) -> StoreResult<Vec<RequestKey>> {
    self.inner.entry_keys(generation)
  }
}

/// Notifier that remembers what it was asked to show.
#[derive(Default)]
pub struct RecordingNotifier {
  shown: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }
}

impl Notifier for RecordingNotifier {
  fn show(&self, notification: &Notification) {
    self.shown.lock().unwrap().push(notification.clone());
  }
}
