//! Client contexts (pages/tabs) the worker may control.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use url::Url;

use crate::generation::GenerationId;

/// Identifier of one client context.
pub type ClientId = u64;

/// Host-side view of the open client contexts.
pub trait Clients: Send + Sync + 'static {
  /// Take control of every open client. Returns how many were claimed.
  fn claim(&self, generation: &GenerationId) -> usize;

  /// Open a new client context at `url`.
  fn open_window(&self, url: &Url) -> ClientId;
}

/// An open client context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
  pub url: Url,
  /// Generation currently serving this client, if any
  pub controller: Option<GenerationId>,
}

#[derive(Debug, Default)]
struct ClientTable {
  next_id: ClientId,
  active: Option<GenerationId>,
  clients: BTreeMap<ClientId, ClientContext>,
}

/// In-process client registry.
#[derive(Debug, Default)]
pub struct LocalClients {
  table: Mutex<ClientTable>,
}

impl LocalClients {
  pub fn new() -> Self {
    Self::default()
  }

  fn table(&self) -> MutexGuard<'_, ClientTable> {
    // The table holds no invariants a panic could break halfway
    self.table.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register an already-open client that no generation controls yet.
  pub fn connect(&self, url: Url) -> ClientId {
    let mut table = self.table();
    table.next_id += 1;
    let id = table.next_id;
    table.clients.insert(
      id,
      ClientContext {
        url,
        controller: None,
      },
    );
    id
  }

  pub fn disconnect(&self, id: ClientId) -> bool {
    self.table().clients.remove(&id).is_some()
  }

  pub fn get(&self, id: ClientId) -> Option<ClientContext> {
    self.table().clients.get(&id).cloned()
  }

  pub fn len(&self) -> usize {
    self.table().clients.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Clients for LocalClients {
  fn claim(&self, generation: &GenerationId) -> usize {
    let mut table = self.table();
    table.active = Some(generation.clone());
    for client in table.clients.values_mut() {
      client.controller = Some(generation.clone());
    }
    let claimed = table.clients.len();
    info!(%generation, claimed, "claimed clients");
    claimed
  }

  fn open_window(&self, url: &Url) -> ClientId {
    let mut table = self.table();
    table.next_id += 1;
    let id = table.next_id;
    let controller = table.active.clone();
    table.clients.insert(
      id,
      ClientContext {
        url: url.clone(),
        controller,
      },
    );
    debug!(client = id, %url, "opened window");
    id
  }
}
