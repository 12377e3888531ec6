//! Error types for the cache, store and sync layers.

use thiserror::Error;

/// Errors raised by the local record store.
#[derive(Error, Debug)]
pub enum StoreError {
  /// No durable local storage could be opened. Offline features are degraded.
  #[error("Durable storage unavailable: {0}")]
  StorageUnavailable(String),

  /// The store was used before `open()` completed or after `dispose()`.
  #[error("Offline store is not open")]
  NotOpen,

  #[error("Database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Lock poisoned: {0}")]
  Poisoned(String),
}

/// Errors raised by cache partition storage.
#[derive(Error, Debug)]
pub enum CacheError {
  /// No cache backend is available on this platform.
  #[error("Cache storage unavailable: {0}")]
  Unavailable(String),

  #[error("Cache database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("Cache serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Lock poisoned: {0}")]
  Poisoned(String),
}

/// Errors from a live fetch or a strategy that could not produce a response.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
  /// The network could not be reached or the request failed in transit.
  #[error("Network error: {0}")]
  Network(String),

  #[error("Fetch timed out after {0:?}")]
  Timeout(std::time::Duration),

  #[error("Cache error: {0}")]
  Cache(String),

  /// A background fetch ended without reporting a result.
  #[error("Background fetch aborted")]
  Aborted,
}

impl From<CacheError> for FetchError {
  fn from(e: CacheError) -> Self {
    FetchError::Cache(e.to_string())
  }
}

/// Errors that abort a worker install or activation.
#[derive(Error, Debug)]
pub enum InstallError {
  #[error("Failed to fetch manifest asset {path}: {source}")]
  Fetch {
    path: String,
    #[source]
    source: FetchError,
  },

  #[error("Manifest asset {path} returned status {status}")]
  BadStatus { path: String, status: u16 },

  #[error("Invalid manifest path {path}: {reason}")]
  InvalidPath { path: String, reason: String },

  #[error("Cache error: {0}")]
  Cache(#[from] CacheError),

  #[error("Worker is {actual}, expected {expected}")]
  InvalidState {
    expected: &'static str,
    actual: crate::mediator::WorkerState,
  },
}

/// Errors returned by a remote sync handler.
#[derive(Error, Debug)]
pub enum RemoteError {
  #[error("Remote request failed: {0}")]
  Request(String),

  #[error("Remote rejected record with status {0}")]
  Rejected(u16),

  #[error("No remote handler for record type '{0}'")]
  Unsupported(String),
}
