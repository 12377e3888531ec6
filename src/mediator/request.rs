//! Request and response values passed between the mediator, fetchers and caches.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// Status used for every synthesized offline response.
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// How the request was initiated by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Any subresource or script-initiated fetch
  #[default]
  Subresource,
}

/// An outbound request seen by the mediator.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: BTreeMap<String, String>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Subresource,
      headers: BTreeMap::new(),
    }
  }

  /// A GET issued as a page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Stable cache key for this request (method + URL, fragment stripped).
  pub fn cache_key(&self) -> String {
    cache_key(&self.method, &self.url)
  }
}

/// SHA256 over method and URL so keys are fixed-length.
pub fn cache_key(method: &Method, url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

/// A response body with its status and headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  /// Lowercased names; a repeated header keeps all values joined with `, `
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Machine-readable offline error for API paths.
  pub fn offline_api() -> Self {
    let body = serde_json::json!({
      "error": "Offline",
      "message": "You are offline. This request will be available when your connection returns.",
    });
    Self::new(SERVICE_UNAVAILABLE, body.to_string()).with_header("content-type", "application/json")
  }

  /// Minimal offline response for everything that is neither a page nor an API call.
  pub fn offline() -> Self {
    Self::new(SERVICE_UNAVAILABLE, "Offline").with_header("content-type", "text/plain")
  }
}
