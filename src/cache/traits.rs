//! Core traits and types for the cache store.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::StoreResult;
use crate::generation::GenerationId;
use crate::http::{RequestKey, Response};

/// A stored response together with the time it was written.
#[derive(Debug)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Durable, keyed store of request/response pairs grouped into generations.
///
/// Implementations must allow concurrent reads and concurrent writes to
/// distinct keys. Concurrent writes to the same key are last-write-wins.
pub trait CacheStore: Send + Sync + 'static {
  /// Create the generation if it does not exist yet.
  ///
  /// Returns `true` when this call created it.
  fn open(&self, generation: &GenerationId) -> StoreResult<bool>;

  /// Look up a single entry.
  fn lookup(&self, generation: &GenerationId, key: &RequestKey)
    -> StoreResult<Option<CachedResponse>>;

  /// Store one entry, creating the generation if needed.
  fn put(&self, generation: &GenerationId, key: &RequestKey, response: &Response)
    -> StoreResult<()>;

  /// Store one entry only if the generation still exists.
  ///
  /// Returns `false`, without writing, when the generation is missing.
  fn put_if_present(&self, generation: &GenerationId, key: &RequestKey, response: &Response)
    -> StoreResult<bool>;

  /// Store a batch of entries atomically: either all land or none do.
  fn put_all(&self, generation: &GenerationId, entries: &[(RequestKey, Response)])
    -> StoreResult<()>;

  /// Remove a generation and all of its entries.
  ///
  /// Returns `false` if it did not exist.
  fn delete(&self, generation: &GenerationId) -> StoreResult<bool>;

  /// All generations in creation order.
  fn keys(&self) -> StoreResult<Vec<GenerationId>>;

  /// Request keys stored in one generation.
  fn entry_keys(&self, generation: &GenerationId) -> StoreResult<Vec<RequestKey>>;
}

/// An opened generation.
pub struct CacheHandle<S: CacheStore> {
  store: Arc<S>,
  generation: GenerationId,
}

impl<S: CacheStore> CacheHandle<S> {
  /// Open (creating if absent) a generation in the store.
  pub fn open(store: Arc<S>, generation: GenerationId) -> StoreResult<Self> {
    store.open(&generation)?;
    Ok(Self { store, generation })
  }

  /// Wrap a generation without touching the store. Writes create it lazily.
  pub fn detached(store: Arc<S>, generation: GenerationId) -> Self {
    Self { store, generation }
  }

  pub fn generation(&self) -> &GenerationId {
    &self.generation
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  pub fn lookup(&self, key: &RequestKey) -> StoreResult<Option<CachedResponse>> {
    self.store.lookup(&self.generation, key)
  }

  pub fn put(&self, key: &RequestKey, response: &Response) -> StoreResult<()> {
    self.store.put(&self.generation, key, response)
  }

  /// Write into the generation without recreating it if it was deleted.
  pub fn put_if_present(&self, key: &RequestKey, response: &Response) -> StoreResult<bool> {
    self.store.put_if_present(&self.generation, key, response)
  }
}

impl<S: CacheStore> Clone for CacheHandle<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      generation: self.generation.clone(),
    }
  }
}

/// A response handed back to the caller, with metadata about its source.
#[derive(Debug)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  /// When the entry was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  /// The fallback document served for an offline navigation.
  pub fn fallback(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Fallback,
      cached_at: Some(cached.cached_at),
    }
  }

  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the network on a miss
  Network,
  /// Hit in the current generation
  Cache,
  /// Network failed, served the cached document fallback
  Fallback,
  /// Network failed, synthesized offline response
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Fallback => "fallback",
      CacheSource::Offline => "offline",
    };
    f.write_str(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::http::{Request, ResponseKind};
  use crate::testing::url;

  #[test]
  fn test_open_creates_generation_and_scopes_reads() {
    let store = Arc::new(MemoryStore::new());
    let v1 = CacheHandle::open(Arc::clone(&store), GenerationId::from("v1")).unwrap();
    let v2 = CacheHandle::detached(Arc::clone(&store), GenerationId::from("v2"));
    assert_eq!(store.keys().unwrap(), vec![GenerationId::from("v1")]);

    let key = Request::get(url("/app.js")).key();
    v1.put(&key, &Response::new(200, ResponseKind::Basic, "v1")).unwrap();

    assert_eq!(v1.lookup(&key).unwrap().unwrap().response.text(), "v1");
    assert!(v2.lookup(&key).unwrap().is_none());
    assert_eq!(v2.generation().as_str(), "v2");
  }

  #[test]
  fn test_put_if_present_never_creates_generation() {
    let store = Arc::new(MemoryStore::new());
    let gone = CacheHandle::detached(Arc::clone(&store), GenerationId::from("v0"));
    let key = Request::get(url("/app.js")).key();

    assert!(!gone.put_if_present(&key, &Response::new(200, ResponseKind::Basic, "v0")).unwrap());
    assert!(store.keys().unwrap().is_empty());

    store.open(&GenerationId::from("v0")).unwrap();
    assert!(gone.put_if_present(&key, &Response::new(200, ResponseKind::Basic, "v0")).unwrap());
    assert_eq!(gone.lookup(&key).unwrap().unwrap().response.text(), "v0");
  }
}
