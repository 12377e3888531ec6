use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// Connectivity and delivery events consumed by the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Connectivity came back
  Online,
  /// Connectivity was lost
  Offline,
  /// Platform background-sync signal carrying its tag
  BackgroundSync(String),
}

/// Something that can tell whether the backend is reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
  async fn is_reachable(&self) -> bool;
}

/// Probes reachability with a HEAD request; any HTTP response counts as online.
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> reqwest::Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, url })
  }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
  async fn is_reachable(&self) -> bool {
    self.client.head(self.url.clone()).send().await.is_ok()
  }
}

/// Event source feeding the sync engine
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// A handler fed by whoever holds the returned sender.
  pub fn channel() -> (mpsc::UnboundedSender<Event>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// A handler that polls `probe` every `tick_rate` and emits an event on
  /// each connectivity transition. The first probe always emits.
  pub fn with_probe<P: ConnectivityProbe>(probe: P, tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut last: Option<bool> = None;
      loop {
        let reachable = probe.is_reachable().await;
        if last != Some(reachable) {
          debug!(reachable, "Connectivity changed");
          let event = if reachable {
            Event::Online
          } else {
            Event::Offline
          };
          if tx.send(event).is_err() {
            break;
          }
          last = Some(reachable);
        }
        tokio::time::sleep(tick_rate).await;
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;
  use std::sync::Mutex;

  /// Replays a fixed sequence of probe results, then repeats the last one.
  struct ScriptedProbe {
    results: Mutex<VecDeque<bool>>,
  }

  #[async_trait]
  impl ConnectivityProbe for ScriptedProbe {
    async fn is_reachable(&self) -> bool {
      let mut results = self.results.lock().unwrap();
      if results.len() > 1 {
        results.pop_front().unwrap()
      } else {
        *results.front().unwrap()
      }
    }
  }

  #[tokio::test]
  async fn test_probe_emits_transitions_only() {
    let probe = ScriptedProbe {
      results: Mutex::new(VecDeque::from([true, true, false, false, true])),
    };
    let mut events = EventHandler::with_probe(probe, Duration::from_millis(1));

    let mut seen = Vec::new();
    for _ in 0..3 {
      let event = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
      seen.push(event);
    }
    assert_eq!(seen, vec![Event::Online, Event::Offline, Event::Online]);
  }

  #[tokio::test]
  async fn test_channel_closes_when_sender_dropped() {
    let (tx, mut events) = EventHandler::channel();
    tx.send(Event::BackgroundSync("sync-invoices".to_string())).unwrap();
    drop(tx);

    assert_eq!(
      events.next().await,
      Some(Event::BackgroundSync("sync-invoices".to_string()))
    );
    assert_eq!(events.next().await, None);
  }
}
