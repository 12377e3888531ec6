//! Local durable record store.
//!
//! Every local write is an upsert keyed by `{type}_{entity_id}` that marks
//! the record unsynced. Records leave the pending set only through
//! `mark_synced`, explicit removal, or a clear.

mod record;

pub use record::{OfflineRecord, RecordType};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_records (
    id TEXT PRIMARY KEY,
    record_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    revision INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_offline_records_type ON offline_records(record_type);
CREATE INDEX IF NOT EXISTS idx_offline_records_synced ON offline_records(synced);
"#;

const SELECT_RECORD: &str =
  "SELECT id, record_type, entity_id, payload, timestamp, synced, revision FROM offline_records";

/// Where the store keeps its data.
#[derive(Debug, Clone)]
enum Location {
  File(PathBuf),
  Memory,
}

/// Key-indexed local record store with an open/dispose lifecycle.
///
/// Every operation fails with `StoreError::NotOpen` until `open()` succeeds.
pub struct OfflineStore {
  location: Location,
  conn: Mutex<Option<Connection>>,
  pending: watch::Sender<usize>,
}

impl OfflineStore {
  /// A store backed by the database file at `path`. Not opened yet.
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self::with_location(Location::File(path.into()))
  }

  /// A store that lives only as long as the process. Not opened yet.
  pub fn in_memory() -> Self {
    Self::with_location(Location::Memory)
  }

  fn with_location(location: Location) -> Self {
    let (pending, _) = watch::channel(0);
    Self {
      location,
      conn: Mutex::new(None),
      pending,
    }
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::StorageUnavailable("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("invoice-sync").join("offline.db"))
  }

  /// Open (creating on first use) the record collection and its indexes.
  pub fn open(&self) -> Result<()> {
    let conn = match &self.location {
      Location::File(path) => open_file(path)?,
      Location::Memory => Connection::open_in_memory()
        .map_err(|e| StoreError::StorageUnavailable(format!("In-memory store: {}", e)))?,
    };

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| StoreError::StorageUnavailable(format!("Failed to create schema: {}", e)))?;

    *self.lock()? = Some(conn);
    let pending = self.refresh_pending()?;
    info!(location = ?self.location, pending, "Offline store opened");
    Ok(())
  }

  /// Close the store. Later operations fail with `NotOpen` until reopened.
  pub fn dispose(&self) -> Result<()> {
    self.lock()?.take();
    debug!("Offline store disposed");
    Ok(())
  }

  pub fn is_open(&self) -> bool {
    self.lock().map(|c| c.is_some()).unwrap_or(false)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Connection>>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }

  fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut guard = self.lock()?;
    let conn = guard.as_mut().ok_or(StoreError::NotOpen)?;
    f(conn)
  }

  /// Upsert a record and mark it unsynced.
  ///
  /// The timestamp never moves backwards for an id, even if the clock does.
  pub fn save(&self, record_type: &RecordType, entity_id: &str, data: Value) -> Result<OfflineRecord> {
    let id = record_type.record_id(entity_id);
    let payload = serde_json::to_string(&data)?;
    let now = Utc::now().timestamp_millis();

    let record = self.with_conn(|conn| {
      let tx = conn.transaction()?;
      tx.execute(
        "INSERT INTO offline_records (id, record_type, entity_id, payload, timestamp, synced, revision)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, 1)
         ON CONFLICT(id) DO UPDATE SET
           record_type = excluded.record_type,
           entity_id = excluded.entity_id,
           payload = excluded.payload,
           timestamp = MAX(offline_records.timestamp, excluded.timestamp),
           synced = 0,
           revision = offline_records.revision + 1",
        params![id, record_type.as_str(), entity_id, payload, now],
      )?;
      let record = select_one(&tx, &id)?;
      tx.commit()?;
      record.ok_or(StoreError::Database(rusqlite::Error::QueryReturnedNoRows))
    })?;

    let pending = self.refresh_pending()?;
    debug!(id = %record.id, revision = record.revision, pending, "Saved record locally");
    Ok(record)
  }

  /// Point lookup when `entity_id` is given, otherwise every record of the type.
  pub fn get(&self, record_type: &RecordType, entity_id: Option<&str>) -> Result<Vec<OfflineRecord>> {
    self.with_conn(|conn| match entity_id {
      Some(entity_id) => Ok(
        select_one(conn, &record_type.record_id(entity_id))?
          .into_iter()
          .collect(),
      ),
      None => select_many(
        conn,
        &format!("{} WHERE record_type = ?", SELECT_RECORD),
        params![record_type.as_str()],
      ),
    })
  }

  /// Delete one record. Returns whether it existed.
  pub fn remove(&self, record_type: &RecordType, entity_id: &str) -> Result<bool> {
    let id = record_type.record_id(entity_id);
    let deleted = self.with_conn(|conn| {
      Ok(conn.execute("DELETE FROM offline_records WHERE id = ?", params![id])?)
    })?;

    self.refresh_pending()?;
    debug!(%id, deleted = deleted > 0, "Removed record");
    Ok(deleted > 0)
  }

  /// Delete every record of `record_type`, or everything when `None`.
  /// Returns the number of records deleted.
  pub fn clear(&self, record_type: Option<&RecordType>) -> Result<usize> {
    let deleted = self.with_conn(|conn| {
      let deleted = match record_type {
        Some(t) => conn.execute(
          "DELETE FROM offline_records WHERE record_type = ?",
          params![t.as_str()],
        )?,
        None => conn.execute("DELETE FROM offline_records", [])?,
      };
      Ok(deleted)
    })?;

    self.refresh_pending()?;
    info!(record_type = ?record_type.map(RecordType::as_str), deleted, "Cleared records");
    Ok(deleted)
  }

  /// Every record awaiting remote acknowledgment, oldest first.
  pub fn pending(&self) -> Result<Vec<OfflineRecord>> {
    self.with_conn(|conn| {
      select_many(
        conn,
        &format!("{} WHERE synced = 0 ORDER BY timestamp, id", SELECT_RECORD),
        [],
      )
    })
  }

  /// Pending records of one type, oldest first.
  pub fn pending_of(&self, record_type: &RecordType) -> Result<Vec<OfflineRecord>> {
    self.with_conn(|conn| {
      select_many(
        conn,
        &format!(
          "{} WHERE synced = 0 AND record_type = ? ORDER BY timestamp, id",
          SELECT_RECORD
        ),
        params![record_type.as_str()],
      )
    })
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.with_conn(|conn| {
      let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM offline_records WHERE synced = 0",
        [],
        |row| row.get(0),
      )?;
      Ok(count as usize)
    })
  }

  /// Watch the pending count; it is refreshed after every write.
  pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
    self.pending.subscribe()
  }

  /// Mark a record synced if it has not been rewritten since it was read.
  ///
  /// Returns false when the record changed or disappeared in the meantime;
  /// it then stays (or is gone from) the pending set.
  pub fn mark_synced(&self, record: &OfflineRecord) -> Result<bool> {
    let updated = self.with_conn(|conn| {
      Ok(conn.execute(
        "UPDATE offline_records SET synced = 1 WHERE id = ? AND revision = ?",
        params![record.id, record.revision],
      )?)
    })?;

    self.refresh_pending()?;
    Ok(updated > 0)
  }

  fn refresh_pending(&self) -> Result<usize> {
    let count = self.pending_count()?;
    self.pending.send_replace(count);
    Ok(count)
  }
}

fn open_file(path: &Path) -> Result<Connection> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| {
      StoreError::StorageUnavailable(format!(
        "Failed to create store directory {}: {}",
        parent.display(),
        e
      ))
    })?;
  }

  Connection::open(path).map_err(|e| {
    StoreError::StorageUnavailable(format!(
      "Failed to open store at {}: {}",
      path.display(),
      e
    ))
  })
}

/// Raw row, before the payload is parsed.
struct RawRecord {
  id: String,
  record_type: String,
  entity_id: String,
  payload: String,
  timestamp: i64,
  synced: bool,
  revision: i64,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      record_type: row.get(1)?,
      entity_id: row.get(2)?,
      payload: row.get(3)?,
      timestamp: row.get(4)?,
      synced: row.get(5)?,
      revision: row.get(6)?,
    })
  }

  fn parse(self) -> Result<OfflineRecord> {
    Ok(OfflineRecord {
      id: self.id,
      record_type: RecordType::from(self.record_type.as_str()),
      entity_id: self.entity_id,
      payload: serde_json::from_str(&self.payload)?,
      timestamp: self.timestamp,
      synced: self.synced,
      revision: self.revision,
    })
  }
}

fn select_one(conn: &Connection, id: &str) -> Result<Option<OfflineRecord>> {
  let raw = conn
    .query_row(
      &format!("{} WHERE id = ?", SELECT_RECORD),
      params![id],
      RawRecord::from_row,
    )
    .optional()?;
  raw.map(RawRecord::parse).transpose()
}

fn select_many(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<OfflineRecord>> {
  let mut stmt = conn.prepare(sql)?;
  let raws = stmt
    .query_map(params, RawRecord::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawRecord::parse).collect()
}
