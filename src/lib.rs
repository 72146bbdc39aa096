//! Offline-first caching proxy.
//!
//! Outbound GET requests are answered from the current cache generation when
//! possible and from the network otherwise, with successful same-origin
//! responses written back for offline use. Generations are installed from a
//! preload manifest and stale ones are purged when a new one activates.

pub mod cache;
pub mod clients;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod notify;

#[cfg(test)]
mod testing;

pub use cache::{CacheSource, CacheStore, MemoryStore, Served, SqliteStore};
pub use config::Config;
pub use engine::{Disposition, InterceptionEngine};
pub use error::{ActivationError, InstallError, MessageError, NetworkError, StoreError};
pub use generation::{GenerationId, GenerationManager};
pub use http::{Destination, Request, RequestKey, Response, ResponseKind};
pub use lifecycle::{
  EventOutcome, LifecycleController, RegistrationState, VersionReply, WorkerEvent, WorkerSettings,
};
pub use network::{HttpNetwork, Network};
