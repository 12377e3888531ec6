//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::CachedResponse;
use crate::error::CacheError;
use crate::mediator::Response;

type Result<T> = std::result::Result<T, CacheError>;

/// Trait for named cache partition backends.
///
/// Partitions are created on first write. Only successful (2xx) responses
/// are accepted; `put` reports whether the response was stored.
pub trait CacheStorage: Send + Sync + 'static {
  /// Store a response under `key` in `partition`, replacing any previous entry.
  fn put(&self, partition: &str, key: &str, url: &str, response: &Response) -> Result<bool>;

  /// Look up an entry in one partition.
  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Look up an entry in each partition in order, returning the first hit.
  fn match_any(&self, partitions: &[&str], key: &str) -> Result<Option<CachedResponse>> {
    for partition in partitions {
      if let Some(hit) = self.get(partition, key)? {
        return Ok(Some(hit));
      }
    }
    Ok(None)
  }

  /// Create an empty partition if it does not exist yet.
  fn ensure_partition(&self, partition: &str) -> Result<()>;

  /// Names of every partition, including those of older versions.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and its entries. Returns false if it did not exist.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Number of entries in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;
}

/// Storage used when no cache backend is available.
/// Every lookup misses and every write is discarded.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn put(&self, _partition: &str, _key: &str, _url: &str, _response: &Response) -> Result<bool> {
    Ok(false)
  }

  fn get(&self, _partition: &str, _key: &str) -> Result<Option<CachedResponse>> {
    Ok(None)
  }

  fn ensure_partition(&self, _partition: &str) -> Result<()> {
    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_partition(&self, _partition: &str) -> Result<bool> {
    Ok(false)
  }

  fn entry_count(&self, _partition: &str) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (creating if needed) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::Unavailable(format!(
          "Failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Unavailable(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory cache.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| CacheError::Unavailable(format!("Failed to open in-memory cache: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::Unavailable("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("invoice-sync").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::Poisoned(e.to_string()))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_partition ON cache_entries(partition);
"#;

impl CacheStorage for SqliteStorage {
  fn put(&self, partition: &str, key: &str, url: &str, response: &Response) -> Result<bool> {
    if !response.is_success() {
      return Ok(false);
    }

    let mut conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)?;
    let now = Utc::now().to_rfc3339();

    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![partition, now],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (partition, request_key, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![partition, key, url, response.status, headers, response.body, now],
    )?;
    tx.commit()?;

    Ok(true)
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, cached_at FROM cache_entries
         WHERE partition = ? AND request_key = ?",
        params![partition, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()?;

    match row {
      Some((url, status, headers, body, cached_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
        Ok(Some(CachedResponse {
          key: key.to_string(),
          url,
          partition: partition.to_string(),
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at),
        }))
      }
      None => Ok(None),
    }
  }

  fn ensure_partition(&self, partition: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![partition, Utc::now().to_rfc3339()],
    )?;
    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_partitions ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )?;
    let deleted = tx.execute(
      "DELETE FROM cache_partitions WHERE name = ?",
      params![partition],
    )?;
    tx.commit()?;
    Ok(deleted > 0)
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
      params![partition],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

/// Parse a stored RFC 3339 timestamp, treating garbage as the epoch.
fn parse_datetime(s: &str) -> DateTime<Utc> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .unwrap_or_default()
}
