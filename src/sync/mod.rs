//! Reconciliation of locally committed records with the remote backend.
//!
//! A reconciliation pass pushes every pending record, one at a time, through
//! the handler for its type. A failed push leaves the record pending for the
//! next pass; nothing is retried within a pass and no error reaches the
//! caller beyond the per-record outcome.

mod remote;

pub use remote::{Endpoints, HttpRemoteSync, RemoteSync};

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::event::{Event, EventHandler};
use crate::store::{OfflineRecord, OfflineStore, RecordType};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
}

impl SyncReport {
  /// Every attempted record was acknowledged.
  pub fn is_complete(&self) -> bool {
    self.failed == 0
  }
}

/// Drives pending records to the remote backend.
pub struct SyncEngine<R: RemoteSync> {
  store: Arc<OfflineStore>,
  remote: R,
  online: watch::Sender<bool>,
  background_tags: BTreeMap<String, RecordType>,
  /// Held for the duration of a pass so passes never interleave
  pass: Mutex<()>,
}

impl<R: RemoteSync> SyncEngine<R> {
  pub fn new(store: Arc<OfflineStore>, remote: R, online: bool) -> Self {
    let (online, _) = watch::channel(online);
    Self {
      store,
      remote,
      online,
      background_tags: BTreeMap::new(),
      pass: Mutex::new(()),
    }
  }

  /// Map background-sync tags to the record type each one delivers.
  pub fn with_background_tags(mut self, tags: BTreeMap<String, RecordType>) -> Self {
    self.background_tags = tags;
    self
  }

  pub fn store(&self) -> &OfflineStore {
    &self.store
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  pub fn subscribe_online(&self) -> watch::Receiver<bool> {
    self.online.subscribe()
  }

  /// Record a connectivity change. Going from offline to online runs a
  /// reconciliation pass and returns its report.
  pub async fn set_online(&self, online: bool) -> Result<Option<SyncReport>, StoreError> {
    let was_online = self.online.send_replace(online);
    if online && !was_online {
      info!("Connectivity restored, syncing pending records");
      return self.sync_all().await.map(Some);
    }
    if !online && was_online {
      info!("Connectivity lost, buffering writes locally");
    }
    Ok(None)
  }

  /// Push one record through its type's handler.
  ///
  /// Returns whether the record is now synced. Failures are logged and the
  /// record stays pending.
  pub async fn sync_one(&self, record: &OfflineRecord) -> bool {
    let result = match &record.record_type {
      RecordType::Invoice => self.remote.push_invoice(record).await,
      RecordType::BusinessInfo => self.remote.push_business_info(record).await,
      RecordType::Settings => self.remote.push_settings(record).await,
      RecordType::Other(_) => self.remote.push_other(record).await,
    };

    if let Err(e) = result {
      warn!(id = %record.id, error = %e, "Failed to sync record, will retry");
      return false;
    }

    match self.store.mark_synced(record) {
      Ok(true) => {
        debug!(id = %record.id, "Record synced");
        true
      }
      Ok(false) => {
        debug!(id = %record.id, "Record changed during sync, still pending");
        false
      }
      Err(e) => {
        warn!(id = %record.id, error = %e, "Failed to mark record synced");
        false
      }
    }
  }

  /// Push every pending record. Does nothing while offline.
  ///
  /// Only store failures (e.g. the store is not open) are returned as errors.
  pub async fn sync_all(&self) -> Result<SyncReport, StoreError> {
    self.run_pass(None).await
  }

  /// Push every pending record of one type.
  pub async fn sync_type(&self, record_type: &RecordType) -> Result<SyncReport, StoreError> {
    self.run_pass(Some(record_type)).await
  }

  /// Handle a tagged background-sync signal as connectivity restored for the
  /// tag's record type. Unknown tags are ignored.
  ///
  /// The pass runs even while the engine is offline, but the online flag is
  /// left alone: only a connectivity event moves it, so the next `Online`
  /// still triggers a full pass for every other type.
  pub async fn handle_background_sync(&self, tag: &str) -> Result<Option<SyncReport>, StoreError> {
    let Some(record_type) = self.background_tags.get(tag) else {
      warn!(%tag, "Ignoring unknown background sync tag");
      return Ok(None);
    };

    info!(%tag, %record_type, "Background sync");
    self.push_pending(Some(record_type)).await.map(Some)
  }

  async fn run_pass(&self, record_type: Option<&RecordType>) -> Result<SyncReport, StoreError> {
    if !self.is_online() {
      debug!("Offline, skipping sync");
      return Ok(SyncReport::default());
    }
    self.push_pending(record_type).await
  }

  async fn push_pending(&self, record_type: Option<&RecordType>) -> Result<SyncReport, StoreError> {
    let _pass = self.pass.lock().await;
    let pending = match record_type {
      Some(t) => self.store.pending_of(t)?,
      None => self.store.pending()?,
    };

    let mut report = SyncReport::default();
    for record in &pending {
      report.attempted += 1;
      if self.sync_one(record).await {
        report.succeeded += 1;
      } else {
        report.failed += 1;
      }
    }

    if report.attempted > 0 {
      info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failed,
        "Sync pass finished"
      );
    }
    Ok(report)
  }

  /// Apply events until the source closes.
  pub async fn run(&self, mut events: EventHandler) {
    while let Some(event) = events.next().await {
      let result = match &event {
        Event::Online => self.set_online(true).await.map(|_| ()),
        Event::Offline => self.set_online(false).await.map(|_| ()),
        Event::BackgroundSync(tag) => self.handle_background_sync(tag).await.map(|_| ()),
      };
      if let Err(e) = result {
        warn!(?event, error = %e, "Failed to handle event");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::RemoteError;
  use async_trait::async_trait;
  use serde_json::json;
  use std::collections::HashSet;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  /// Records every push and fails the ids it is told to.
  #[derive(Default)]
  struct FakeRemote {
    calls: std::sync::Mutex<Vec<String>>,
    failing: std::sync::Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
  }

  impl FakeRemote {
    fn failing(ids: &[&str]) -> Self {
      let remote = Self::default();
      remote
        .failing
        .lock()
        .unwrap()
        .extend(ids.iter().map(|s| s.to_string()));
      remote
    }

    fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }

    async fn push(&self, record: &OfflineRecord) -> Result<(), RemoteError> {
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(1)).await;
      self.in_flight.fetch_sub(1, Ordering::SeqCst);

      self.calls.lock().unwrap().push(record.id.clone());
      if self.failing.lock().unwrap().contains(&record.id) {
        Err(RemoteError::Rejected(500))
      } else {
        Ok(())
      }
    }
  }

  #[async_trait]
  impl RemoteSync for FakeRemote {
    async fn push_invoice(&self, record: &OfflineRecord) -> Result<(), RemoteError> {
      self.push(record).await
    }

    async fn push_business_info(&self, record: &OfflineRecord) -> Result<(), RemoteError> {
      self.push(record).await
    }

    async fn push_settings(&self, record: &OfflineRecord) -> Result<(), RemoteError> {
      self.push(record).await
    }
  }

  fn open_store() -> Arc<OfflineStore> {
    let store = OfflineStore::in_memory();
    store.open().unwrap();
    Arc::new(store)
  }

  fn save_invoices(store: &OfflineStore, n: usize) {
    for i in 0..n {
      store
        .save(&RecordType::Invoice, &i.to_string(), json!({"n": i}))
        .unwrap();
    }
  }

  #[tokio::test]
  async fn test_sync_all_converges() {
    let store = open_store();
    save_invoices(&store, 5);
    let engine = SyncEngine::new(store.clone(), FakeRemote::default(), true);

    let report = engine.sync_all().await.unwrap();
    assert_eq!(
      report,
      SyncReport {
        attempted: 5,
        succeeded: 5,
        failed: 0
      }
    );
    assert_eq!(store.pending_count().unwrap(), 0);
    assert!(store
      .get(&RecordType::Invoice, None)
      .unwrap()
      .iter()
      .all(|r| r.synced));
    assert_eq!(*store.subscribe_pending().borrow(), 0);
  }

  #[tokio::test]
  async fn test_partial_failure_is_isolated() {
    let store = open_store();
    save_invoices(&store, 4);
    let engine = SyncEngine::new(store.clone(), FakeRemote::failing(&["invoice_2"]), true);

    let report = engine.sync_all().await.unwrap();
    assert_eq!(report.attempted, 4);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 1);
    assert!(!report.is_complete());

    let pending = store.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "invoice_2");
  }

  #[tokio::test]
  async fn test_failed_record_is_retried_next_pass() {
    let store = open_store();
    save_invoices(&store, 2);
    let engine = SyncEngine::new(store.clone(), FakeRemote::failing(&["invoice_0"]), true);

    engine.sync_all().await.unwrap();
    engine.remote.failing.lock().unwrap().clear();
    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(
      engine.remote.calls(),
      vec!["invoice_0", "invoice_1", "invoice_0"]
    );
  }

  #[tokio::test]
  async fn test_records_are_pushed_one_at_a_time() {
    let store = open_store();
    save_invoices(&store, 6);
    let engine = SyncEngine::new(store, FakeRemote::default(), true);

    engine.sync_all().await.unwrap();
    assert_eq!(engine.remote.max_in_flight.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_offline_sync_attempts_nothing() {
    let store = open_store();
    save_invoices(&store, 3);
    let engine = SyncEngine::new(store.clone(), FakeRemote::default(), false);

    let report = engine.sync_all().await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert!(engine.remote.calls().is_empty());
    assert_eq!(store.pending_count().unwrap(), 3);
  }

  #[tokio::test]
  async fn test_coming_online_triggers_sync() {
    let store = open_store();
    let engine = SyncEngine::new(store.clone(), FakeRemote::default(), false);
    save_invoices(&store, 2);

    let report = engine.set_online(true).await.unwrap();
    assert_eq!(report.map(|r| r.succeeded), Some(2));
    assert_eq!(store.pending_count().unwrap(), 0);

    // Already online: no new pass
    store.save(&RecordType::Settings, "app", json!({})).unwrap();
    assert_eq!(engine.set_online(true).await.unwrap(), None);
    assert_eq!(store.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_unknown_type_stays_pending() {
    let store = open_store();
    store
      .save(&RecordType::Other("client".to_string()), "c1", json!({}))
      .unwrap();
    store.save(&RecordType::BusinessInfo, "main", json!({})).unwrap();
    let engine = SyncEngine::new(store.clone(), FakeRemote::default(), true);

    let report = engine.sync_all().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(store.pending().unwrap()[0].id, "client_c1");
  }

  #[tokio::test]
  async fn test_background_sync_delivers_tagged_type_only() {
    let store = open_store();
    save_invoices(&store, 2);
    store.save(&RecordType::Settings, "app", json!({})).unwrap();

    let tags = BTreeMap::from([("sync-invoices".to_string(), RecordType::Invoice)]);
    let engine =
      SyncEngine::new(store.clone(), FakeRemote::default(), false).with_background_tags(tags);

    let report = engine.handle_background_sync("sync-invoices").await.unwrap();
    assert_eq!(report.map(|r| r.succeeded), Some(2));
    assert!(!engine.is_online());

    let pending = store.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].record_type, RecordType::Settings);

    assert_eq!(engine.handle_background_sync("unknown").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_online_after_background_sync_delivers_other_types() {
    let store = open_store();
    save_invoices(&store, 1);
    store.save(&RecordType::Settings, "app", json!({})).unwrap();

    let tags = BTreeMap::from([("sync-invoices".to_string(), RecordType::Invoice)]);
    let engine =
      SyncEngine::new(store.clone(), FakeRemote::default(), false).with_background_tags(tags);

    engine.handle_background_sync("sync-invoices").await.unwrap();
    assert_eq!(store.pending_count().unwrap(), 1);

    let report = engine.set_online(true).await.unwrap();
    assert_eq!(report.map(|r| r.succeeded), Some(1));
    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(engine.remote.calls(), vec!["invoice_0", "settings_app"]);
  }

  #[tokio::test]
  async fn test_sync_on_closed_store_is_an_error() {
    let store = Arc::new(OfflineStore::in_memory());
    let engine = SyncEngine::new(store, FakeRemote::default(), true);
    assert!(matches!(engine.sync_all().await, Err(StoreError::NotOpen)));
  }

  #[tokio::test]
  async fn test_run_applies_events() {
    let store = open_store();
    let engine = SyncEngine::new(store.clone(), FakeRemote::default(), true);
    let (tx, events) = EventHandler::channel();

    tx.send(Event::Offline).unwrap();
    drop(tx);
    engine.run(events).await;
    assert!(!engine.is_online());

    save_invoices(&store, 3);
    let (tx, events) = EventHandler::channel();
    tx.send(Event::Online).unwrap();
    drop(tx);
    engine.run(events).await;

    assert!(engine.is_online());
    assert_eq!(store.pending_count().unwrap(), 0);
  }
}
