use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Domain category of a locally stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
  Invoice,
  BusinessInfo,
  Settings,
  /// Any category without a built-in remote handler
  Other(String),
}

impl RecordType {
  pub fn as_str(&self) -> &str {
    match self {
      RecordType::Invoice => "invoice",
      RecordType::BusinessInfo => "business-info",
      RecordType::Settings => "settings",
      RecordType::Other(name) => name,
    }
  }

  /// Composite store key for an entity of this type.
  pub fn record_id(&self, entity_id: &str) -> String {
    format!("{}_{}", self.as_str(), entity_id)
  }
}

impl From<&str> for RecordType {
  fn from(s: &str) -> Self {
    match s.trim().to_lowercase().as_str() {
      "invoice" | "invoices" => RecordType::Invoice,
      "business-info" | "business_info" | "businessinfo" => RecordType::BusinessInfo,
      "settings" => RecordType::Settings,
      other => RecordType::Other(other.to_string()),
    }
  }
}

impl fmt::Display for RecordType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Serialize for RecordType {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

/// A locally committed record and its sync status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineRecord {
  /// `{type}_{entity_id}`
  pub id: String,
  #[serde(rename = "type")]
  pub record_type: RecordType,
  pub entity_id: String,
  /// Caller-owned data, never interpreted by the store
  pub payload: Value,
  /// Milliseconds since the epoch of the last local write
  pub timestamp: i64,
  /// False while local changes await remote acknowledgment
  pub synced: bool,
  /// Bumped on every local write
  pub revision: i64,
}
