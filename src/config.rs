use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::mediator::{MediatorConfig, RouteTable, DEFAULT_FETCH_TIMEOUT, DEFAULT_MANIFEST};
use crate::store::RecordType;
use crate::sync::Endpoints;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the app is served from, e.g. https://app.example.com
  pub origin: String,
  /// Base URL of the remote API records are pushed to
  pub backend_url: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Prefix shared by all partition names
  pub prefix: String,
  /// Version tag; partitions tagged with any other version are purged at activation
  pub version: String,
  /// Root-relative paths fetched at install time
  pub precache: Vec<String>,
  pub network_first: Vec<String>,
  pub cache_first: Vec<String>,
  /// Cross-origin hosts containing any of these substrings are intercepted
  pub trusted_hosts: Vec<String>,
  pub fetch_timeout_secs: u64,
  /// Path of the cached app shell served to offline navigations
  pub app_shell: String,
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let routes = RouteTable::default();
    Self {
      prefix: "invoice-app".to_string(),
      version: "v1".to_string(),
      precache: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      network_first: routes.network_first,
      cache_first: routes.cache_first,
      trusted_hosts: routes.trusted_hosts,
      fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT.as_secs(),
      app_shell: "/".to_string(),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Endpoint path per record type, relative to `backend_url`
  pub endpoints: Endpoints,
  /// Background sync tag -> record type it delivers
  #[serde(deserialize_with = "deserialize_tags")]
  pub background_tags: BTreeMap<String, RecordType>,
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      endpoints: Endpoints::default(),
      background_tags: BTreeMap::from([("sync-invoices".to_string(), RecordType::Invoice)]),
      probe_interval_secs: 15,
    }
  }
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<BTreeMap<String, RecordType>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|(tag, kind)| (tag, RecordType::from(kind.as_str())))
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./invoice-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/invoice-sync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/invoice-sync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("invoice-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("invoice-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    // Validate the URLs up front so later calls can't fail on them.
    config.origin_url()?;
    config.backend_base()?;
    if config.cache.fetch_timeout_secs == 0 {
      return Err(eyre!("cache.fetch_timeout_secs must be at least 1"));
    }
    if config.sync.probe_interval_secs == 0 {
      return Err(eyre!("sync.probe_interval_secs must be at least 1"));
    }
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Backend URL with a trailing slash so endpoint paths join beneath it.
  pub fn backend_base(&self) -> Result<Url> {
    let mut raw = self.backend_url.clone();
    if !raw.ends_with('/') {
      raw.push('/');
    }
    Url::parse(&raw).map_err(|e| eyre!("Invalid backend_url '{}': {}", self.backend_url, e))
  }

  pub fn mediator_config(&self) -> Result<MediatorConfig> {
    Ok(MediatorConfig {
      origin: self.origin_url()?,
      prefix: self.cache.prefix.clone(),
      version: self.cache.version.clone(),
      precache: self.cache.precache.clone(),
      routes: RouteTable {
        network_first: self.cache.network_first.clone(),
        cache_first: self.cache.cache_first.clone(),
        trusted_hosts: self.cache.trusted_hosts.clone(),
      },
      fetch_timeout: Duration::from_secs(self.cache.fetch_timeout_secs),
      app_shell: self.cache.app_shell.clone(),
    })
  }

  /// Directory holding the databases and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("invoice-sync"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse(
      "origin: https://app.example.com\nbackend_url: https://api.example.com/v1\n",
    )
    .unwrap();

    assert_eq!(config.cache.prefix, "invoice-app");
    assert_eq!(config.cache.version, "v1");
    assert_eq!(config.cache.fetch_timeout_secs, 10);
    assert_eq!(
      config.sync.background_tags.get("sync-invoices"),
      Some(&RecordType::Invoice)
    );
    assert_eq!(config.backend_base().unwrap().as_str(), "https://api.example.com/v1/");
  }

  #[test]
  fn test_overrides() {
    let config = Config::parse(
      r#"
origin: https://app.example.com
backend_url: https://api.example.com
cache:
  version: v7
  precache: ["/", "/app.js"]
  fetch_timeout_secs: 3
sync:
  background_tags:
    sync-settings: settings
"#,
    )
    .unwrap();

    let mediator = config.mediator_config().unwrap();
    assert_eq!(mediator.version, "v7");
    assert_eq!(mediator.precache, vec!["/", "/app.js"]);
    assert_eq!(mediator.fetch_timeout, Duration::from_secs(3));
    // Untouched fields keep their defaults
    assert!(!mediator.routes.network_first.is_empty());
    assert_eq!(
      config.sync.background_tags.get("sync-settings"),
      Some(&RecordType::Settings)
    );
  }

  #[test]
  fn test_zero_intervals_are_rejected() {
    let base = "origin: https://app.example.com\nbackend_url: https://api.example.com\n";
    let err = Config::parse(&format!("{}cache:\n  fetch_timeout_secs: 0\n", base)).unwrap_err();
    assert!(err.to_string().contains("fetch_timeout_secs"));

    let err = Config::parse(&format!("{}sync:\n  probe_interval_secs: 0\n", base)).unwrap_err();
    assert!(err.to_string().contains("probe_interval_secs"));
  }

  #[test]
  fn test_invalid_origin_is_rejected() {
    assert!(Config::parse("origin: not a url\nbackend_url: https://api.example.com\n").is_err());
  }
}
