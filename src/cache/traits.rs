//! Core types for the cache partitions.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::mediator::Response;

/// The two cache partitions owned by a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// Fixed manifest assets stored at install time
  Precache,
  /// Responses stored while serving requests
  Runtime,
}

impl Partition {
  pub fn as_str(&self) -> &'static str {
    match self {
      Partition::Precache => "precache",
      Partition::Runtime => "runtime",
    }
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A stored response together with the metadata it was stored under.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// Request identity (see `mediator::cache_key`)
  pub key: String,
  pub url: String,
  /// Name of the partition holding the entry
  pub partition: String,
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Result of serving a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct ServedResponse {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl ServedResponse {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  /// A response produced by the offline fallback chain.
  pub fn offline(response: Response, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      response,
      source: ResponseSource::Offline,
      cached_at,
    }
  }

  /// A request the mediator did not intercept.
  pub fn passthrough(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Passthrough,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Cached response served by a strategy
  Cache,
  /// Fallback after every strategy failed (app shell or synthesized)
  Offline,
  /// Not intercepted, fetched untouched
  Passthrough,
}
