//! Request classification: which requests are intercepted, and by which strategy.

use reqwest::Method;
use std::fmt;
use url::Url;

use super::request::Request;

/// Named policy for resolving a read between cache and network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Strategy::NetworkFirst => write!(f, "network-first"),
      Strategy::CacheFirst => write!(f, "cache-first"),
      Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
    }
  }
}

/// Ordered pattern tables used to classify requests.
#[derive(Debug, Clone)]
pub struct RouteTable {
  /// Path substrings served network-first (API, auth, backend functions)
  pub network_first: Vec<String>,
  /// Path substrings or suffixes served cache-first (static assets)
  pub cache_first: Vec<String>,
  /// Hostname substrings of trusted third parties
  pub trusted_hosts: Vec<String>,
}

impl Default for RouteTable {
  fn default() -> Self {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    Self {
      network_first: strings(&["/api/", "/auth/", "/functions/", "/rest/"]),
      cache_first: strings(&[
        "/icons/", "/images/", "/fonts/", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico",
        ".webp", ".woff", ".woff2", ".ttf", ".css", ".js",
      ]),
      trusted_hosts: strings(&[
        "googleapis.com",
        "gstatic.com",
        "firebaseapp.com",
        "supabase.co",
      ]),
    }
  }
}

impl RouteTable {
  /// Classify a URL path. Network-first patterns win over cache-first ones;
  /// everything else is stale-while-revalidate.
  pub fn classify(&self, path: &str) -> Strategy {
    if self.network_first.iter().any(|p| path.contains(p.as_str())) {
      return Strategy::NetworkFirst;
    }

    if self.cache_first.iter().any(|p| matches_asset(path, p)) {
      return Strategy::CacheFirst;
    }

    Strategy::StaleWhileRevalidate
  }

  /// Whether the mediator handles this request at all.
  ///
  /// Only GET requests are intercepted, and only when same-origin or
  /// addressed to a trusted host.
  pub fn intercepts(&self, origin: &Url, request: &Request) -> bool {
    if request.method != Method::GET {
      return false;
    }

    if request.url.origin() == origin.origin() {
      return true;
    }

    match request.url.host_str() {
      Some(host) => self.trusted_hosts.iter().any(|t| host.contains(t.as_str())),
      None => false,
    }
  }

  /// Whether a path belongs to the API surface (used for the offline fallback).
  pub fn is_api_path(&self, path: &str) -> bool {
    self.classify(path) == Strategy::NetworkFirst
  }
}

/// Extension patterns (".png") match as suffixes, directory patterns as substrings.
fn matches_asset(path: &str, pattern: &str) -> bool {
  if pattern.starts_with('.') {
    path.ends_with(pattern)
  } else {
    path.contains(pattern)
  }
}
