//! Generation manager: creates the current cache generation and retires the rest.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheHandle, CacheStore};
use crate::clients::Clients;
use crate::error::{ActivationError, InstallError};
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;

/// Name of one cache generation (for example `checklist-app-v1.0.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(String);

impl GenerationId {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for GenerationId {
  fn from(name: &str) -> Self {
    Self(name.to_string())
  }
}

impl From<String> for GenerationId {
  fn from(name: String) -> Self {
    Self(name)
  }
}

impl fmt::Display for GenerationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
  pub generation: GenerationId,
  pub entries: usize,
}

/// What activation cleaned up.
#[derive(Debug, Default)]
pub struct ActivationReport {
  /// Stale generations that were removed
  pub deleted: Vec<GenerationId>,
  /// Deletions that failed; those generations are still in the store
  pub failures: Vec<ActivationError>,
  /// Number of client contexts now served by the current generation
  pub claimed: usize,
}

/// Owns the current generation identifier and its lifecycle in the store.
pub struct GenerationManager<S: CacheStore> {
  store: Arc<S>,
  network: Arc<dyn Network>,
  clients: Arc<dyn Clients>,
  current: GenerationId,
}

impl<S: CacheStore> GenerationManager<S> {
  pub fn new(
    store: Arc<S>,
    network: Arc<dyn Network>,
    clients: Arc<dyn Clients>,
    current: GenerationId,
  ) -> Self {
    Self {
      store,
      network,
      clients,
      current,
    }
  }

  pub fn current(&self) -> &GenerationId {
    &self.current
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  /// Handle on the current generation for reads and write-backs.
  pub fn handle(&self) -> CacheHandle<S> {
    CacheHandle::detached(Arc::clone(&self.store), self.current.clone())
  }

  /// Whether the current generation already exists in the store.
  pub fn is_installed(&self) -> bool {
    match self.store.keys() {
      Ok(keys) => keys.contains(&self.current),
      Err(e) => {
        warn!(error = %e, "failed to enumerate generations");
        false
      }
    }
  }

  /// Fetch every preload entry and commit them into the current generation.
  ///
  /// All entries are fetched before the store is touched, then written in a
  /// single batch. Any failure aborts the install and leaves no generation
  /// behind that this call created.
  pub async fn install(&self, preload: &[Url]) -> Result<Installed, InstallError> {
    info!(generation = %self.current, entries = preload.len(), "installing generation");

    let fetches = preload.iter().map(|url| {
      let request = Request::get(url.clone());
      async move {
        let result = self.network.fetch(&request).await;
        (request, result)
      }
    });

    let mut entries: Vec<(RequestKey, Response)> = Vec::with_capacity(preload.len());
    for (request, result) in join_all(fetches).await {
      let reason = match result {
        Ok(response) if (200..300).contains(&response.status) => {
          debug!(url = %request.url, "preloaded");
          entries.push((request.key(), response));
          continue;
        }
        Ok(response) => format!("unexpected status {}", response.status),
        Err(e) => e.to_string(),
      };

      error!(generation = %self.current, url = %request.url, %reason, "preload failed");
      return Err(InstallError::PreloadFailed {
        generation: self.current.clone(),
        url: request.url.to_string(),
        reason,
      });
    }

    let existed = self
      .store
      .keys()
      .map(|keys| keys.contains(&self.current))
      .unwrap_or(false);

    if let Err(source) = self.store.put_all(&self.current, &entries) {
      error!(generation = %self.current, error = %source, "failed to store preload set");
      if !existed {
        if let Err(e) = self.store.delete(&self.current) {
          warn!(generation = %self.current, error = %e, "failed to remove partial generation");
        }
      }
      return Err(InstallError::Store {
        generation: self.current.clone(),
        source,
      });
    }

    info!(generation = %self.current, entries = entries.len(), "installation complete");
    Ok(Installed {
      generation: self.current.clone(),
      entries: entries.len(),
    })
  }

  /// Delete every generation except the current one, then claim clients.
  ///
  /// Failed deletions are collected in the report and do not stop the
  /// remaining ones.
  pub async fn activate(&self) -> Result<ActivationReport, ActivationError> {
    info!(generation = %self.current, "activating generation");

    let generations = self.store.keys().map_err(ActivationError::ListFailed)?;
    let mut report = ActivationReport::default();

    for generation in generations {
      if generation == self.current {
        continue;
      }

      match self.store.delete(&generation) {
        Ok(true) => {
          info!(%generation, "deleted stale generation");
          report.deleted.push(generation);
        }
        Ok(false) => debug!(%generation, "stale generation already gone"),
        Err(source) => {
          warn!(%generation, error = %source, "failed to delete stale generation");
          report
            .failures
            .push(ActivationError::DeleteFailed { generation, source });
        }
      }
    }

    report.claimed = self.clients.claim(&self.current);
    info!(
      generation = %self.current,
      deleted = report.deleted.len(),
      failed = report.failures.len(),
      "activation complete"
    );
    Ok(report)
  }
}
