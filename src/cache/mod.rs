//! Versioned response cache with offline support.
//!
//! A store holds any number of named generations, each a map from request
//! key to response snapshot. The generation manager makes sure only the
//! current one survives activation.

mod storage;
mod traits;

pub use storage::{MemoryStore, SqliteStore};
pub use traits::{CacheHandle, CacheSource, CacheStore, CachedResponse, Served};
