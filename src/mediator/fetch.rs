//! Live network access used by the mediator.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::request::{Request, Response};
use crate::error::FetchError;

/// Capability to perform a live fetch.
///
/// Implementations return `Ok` for any response that arrived, whatever its
/// status; `Err` means the network could not deliver one.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Fetcher backed by a reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("invoice-sync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::Network(format!("{}: {}", request.url, e)))?;

    let status = response.status().as_u16();
    let headers = collect_headers(response.headers());

    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(format!("Failed to read body of {}: {}", request.url, e)))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

/// Flatten a header map, joining repeated names with `, `. Values that are
/// not visible ASCII are dropped.
fn collect_headers(map: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
  let mut headers: BTreeMap<String, String> = BTreeMap::new();
  for (name, value) in map {
    let Ok(value) = value.to_str() else {
      continue;
    };
    headers
      .entry(name.as_str().to_string())
      .and_modify(|joined| {
        joined.push_str(", ");
        joined.push_str(value);
      })
      .or_insert_with(|| value.to_string());
  }
  headers
}
