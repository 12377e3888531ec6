//! Remote delivery of locally committed records.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::error::RemoteError;
use crate::store::OfflineRecord;

/// Capability to push one record of each domain type to the backend.
///
/// Each method is independent: a failing handler never blocks the others.
#[async_trait]
pub trait RemoteSync: Send + Sync + 'static {
  async fn push_invoice(&self, record: &OfflineRecord) -> Result<(), RemoteError>;

  async fn push_business_info(&self, record: &OfflineRecord) -> Result<(), RemoteError>;

  async fn push_settings(&self, record: &OfflineRecord) -> Result<(), RemoteError>;

  /// Records of types without a dedicated handler.
  async fn push_other(&self, record: &OfflineRecord) -> Result<(), RemoteError> {
    Err(RemoteError::Unsupported(record.record_type.to_string()))
  }
}

/// Endpoint path per record type, relative to the backend base URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
  pub invoice: String,
  pub business_info: String,
  pub settings: String,
}

impl Default for Endpoints {
  fn default() -> Self {
    Self {
      invoice: "invoices".to_string(),
      business_info: "business-info".to_string(),
      settings: "settings".to_string(),
    }
  }
}

/// Pushes records as JSON with `PUT {base}/{endpoint}/{entity_id}`.
#[derive(Clone)]
pub struct HttpRemoteSync {
  client: reqwest::Client,
  base: Url,
  endpoints: Endpoints,
}

impl HttpRemoteSync {
  /// `base` must end with a slash so endpoint paths join beneath it.
  pub fn new(base: Url, endpoints: Endpoints, timeout: Duration) -> Result<Self, RemoteError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("invoice-sync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| RemoteError::Request(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      endpoints,
    })
  }

  /// The entity id is always a single percent-encoded path segment.
  fn record_url(&self, endpoint: &str, record: &OfflineRecord) -> Result<Url, RemoteError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::Request(format!("Backend URL {} cannot take a path", self.base)))?
      .pop_if_empty()
      .extend(endpoint.split('/').filter(|s| !s.is_empty()))
      .push(&record.entity_id);
    Ok(url)
  }

  async fn push(&self, endpoint: &str, record: &OfflineRecord) -> Result<(), RemoteError> {
    let url = self.record_url(endpoint, record)?;
    let body = serde_json::to_vec(&record.payload)
      .map_err(|e| RemoteError::Request(format!("Failed to encode {}: {}", record.id, e)))?;

    let response = self
      .client
      .put(url.clone())
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .body(body)
      .send()
      .await
      .map_err(|e| RemoteError::Request(format!("{}: {}", url, e)))?;

    let status = response.status();
    if status.is_success() {
      Ok(())
    } else {
      Err(RemoteError::Rejected(status.as_u16()))
    }
  }
}

#[async_trait]
impl RemoteSync for HttpRemoteSync {
  async fn push_invoice(&self, record: &OfflineRecord) -> Result<(), RemoteError> {
    self.push(&self.endpoints.invoice, record).await
  }

  async fn push_business_info(&self, record: &OfflineRecord) -> Result<(), RemoteError> {
    self.push(&self.endpoints.business_info, record).await
  }

  async fn push_settings(&self, record: &OfflineRecord) -> Result<(), RemoteError> {
    self.push(&self.endpoints.settings, record).await
  }
}
