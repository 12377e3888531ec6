//! Tracked background fetches.
//!
//! Revalidations run detached from the response they accompany, but every
//! one is registered here so callers (and tests) can wait for them to land.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::FetchError;

#[derive(Default)]
pub struct BackgroundTasks {
  handles: Mutex<Vec<JoinHandle<()>>>,
  completed: Arc<AtomicUsize>,
  failed: Arc<AtomicUsize>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    // The vec is only pushed to and drained, a poisoned lock leaves it usable.
    self.handles.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Spawn a background task. Its error is logged, never propagated.
  pub fn spawn<F>(&self, label: String, task: F)
  where
    F: Future<Output = Result<(), FetchError>> + Send + 'static,
  {
    let completed = Arc::clone(&self.completed);
    let failed = Arc::clone(&self.failed);

    let handle = tokio::spawn(async move {
      match task.await {
        Ok(()) => debug!(task = %label, "Background fetch finished"),
        Err(e) => {
          failed.fetch_add(1, Ordering::SeqCst);
          debug!(task = %label, error = %e, "Background fetch failed");
        }
      }
      completed.fetch_add(1, Ordering::SeqCst);
    });

    let mut handles = self.handles();
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  /// Number of tasks not yet finished.
  pub fn in_flight(&self) -> usize {
    self.handles().iter().filter(|h| !h.is_finished()).count()
  }

  /// Tasks finished so far, successful or not.
  pub fn completed(&self) -> usize {
    self.completed.load(Ordering::SeqCst)
  }

  pub fn failed(&self) -> usize {
    self.failed.load(Ordering::SeqCst)
  }

  /// Wait for every registered task, including ones spawned while waiting.
  /// Returns the total number of completed tasks.
  pub async fn settle(&self) -> usize {
    loop {
      let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles());
      if pending.is_empty() {
        break;
      }
      for handle in pending {
        let _ = handle.await;
      }
    }
    self.completed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_settle_waits_for_all() {
    let tasks = BackgroundTasks::new();
    for i in 0..3u64 {
      tasks.spawn(format!("t{}", i), async move {
        tokio::time::sleep(Duration::from_millis(5 * i)).await;
        Ok(())
      });
    }

    assert_eq!(tasks.settle().await, 3);
    assert_eq!(tasks.in_flight(), 0);
    assert_eq!(tasks.failed(), 0);
  }

  #[tokio::test]
  async fn test_failures_are_counted_not_raised() {
    let tasks = BackgroundTasks::new();
    tasks.spawn("ok".to_string(), async { Ok(()) });
    tasks.spawn("bad".to_string(), async {
      Err(FetchError::Network("unreachable".to_string()))
    });

    assert_eq!(tasks.settle().await, 2);
    assert_eq!(tasks.failed(), 1);
  }
}
