//! Error types for the caching proxy.
//!
//! Only install failures propagate. Everything raised while handling a
//! request is translated into a response or logged.

use crate::generation::GenerationId;

/// Failure of a single network attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
  /// No connectivity, DNS failure, refused connection or host timeout.
  #[error("network unreachable for {url}: {message}")]
  Unreachable { url: String, message: String },

  /// The request could not be turned into an absolute URL.
  #[error("invalid url {url}: {message}")]
  InvalidUrl { url: String, message: String },

  /// The response arrived but its body could not be read.
  #[error("failed to read response body for {url}: {message}")]
  Body { url: String, message: String },
}

/// Cache store failures. A failed `put` is the write-back error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to serialize cache entry: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("store lock poisoned")]
  LockPoisoned,

  #[error("store unavailable: {message}")]
  Unavailable { message: String },
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
  fn from(_: std::sync::PoisonError<T>) -> Self {
    Self::LockPoisoned
  }
}

/// Install aborted. The generation is not retained.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
  /// A preload entry could not be fetched or was not a usable response.
  #[error("preload of {url} into {generation} failed: {reason}")]
  PreloadFailed {
    generation: GenerationId,
    url: String,
    reason: String,
  },

  /// The fetched preload set could not be committed.
  #[error("failed to store preload set for {generation}: {source}")]
  Store {
    generation: GenerationId,
    #[source]
    source: StoreError,
  },
}

/// Activation problems.
///
/// `DeleteFailed` is collected per stale generation and never aborts the
/// activation. `ListFailed` means no cleanup happened at all.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
  #[error("failed to enumerate generations: {0}")]
  ListFailed(#[source] StoreError),

  #[error("failed to delete stale generation {generation}: {source}")]
  DeleteFailed {
    generation: GenerationId,
    #[source]
    source: StoreError,
  },
}

/// Rejected control-channel message. Logged, never sent back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
  #[error("message has no type")]
  MissingType,

  #[error("unknown message type: {0}")]
  UnknownKind(String),

  #[error("{0} requires a reply port")]
  NoReplyPort(&'static str),

  #[error("malformed message: {0}")]
  Malformed(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
