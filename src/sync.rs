//! Background sync: replays queued writes when connectivity returns.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::network::Network;
use crate::offline::OfflineStore;

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// False when the tag was not ours and nothing ran
  pub ran: bool,
  pub replayed: usize,
  pub failed: usize,
  pub remaining: usize,
}

/// Drains the offline store in insertion order, one action at a time.
///
/// There is no backoff and no retry limit: a failing action stays queued
/// until a later reconnect replays it successfully. Overlapping reconnects
/// wait for the running drain instead of replaying the same actions twice.
#[derive(Clone)]
pub struct SyncCoordinator {
  store: Arc<OfflineStore>,
  network: Arc<dyn Network>,
  tag: String,
  draining: Arc<Mutex<()>>,
}

impl SyncCoordinator {
  pub fn new(store: Arc<OfflineStore>, network: Arc<dyn Network>, tag: impl Into<String>) -> Self {
    Self {
      store,
      network,
      tag: tag.into(),
      draining: Arc::new(Mutex::new(())),
    }
  }

  /// Handle a reconnect signal. Only the configured tag triggers a drain.
  pub async fn on_reconnect(&self, tag: &str) -> SyncReport {
    if tag != self.tag {
      debug!(tag, expected = %self.tag, "Ignoring sync for unknown tag");
      return SyncReport::default();
    }
    self.drain().await
  }

  pub async fn drain(&self) -> SyncReport {
    let _draining = self.draining.lock().await;
    let mut report = SyncReport {
      ran: true,
      ..SyncReport::default()
    };

    let actions = match self.store.list_all() {
      Ok(actions) => actions,
      Err(e) => {
        error!(error = %e, "Failed to read offline queue");
        return report;
      }
    };

    if actions.is_empty() {
      debug!("Offline queue empty, nothing to replay");
      return report;
    }

    info!(count = actions.len(), "Replaying queued actions");

    for action in actions {
      let request = match action.to_request() {
        Ok(request) => request,
        Err(e) => {
          warn!(id = %action.id, error = %e, "Skipping unreplayable action");
          report.failed += 1;
          continue;
        }
      };

      match self.network.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = self.store.remove(&action.id) {
            warn!(id = %action.id, error = %e, "Replayed action could not be removed");
          }
          debug!(id = %action.id, status = response.status, "Replayed action");
          report.replayed += 1;
        }
        Ok(response) => {
          warn!(id = %action.id, status = response.status, "Replay rejected, keeping action");
          report.failed += 1;
        }
        Err(e) => {
          warn!(id = %action.id, error = %e, "Replay failed, keeping action");
          report.failed += 1;
        }
      }
    }

    report.remaining = self.store.len().unwrap_or(report.failed);
    info!(
      replayed = report.replayed,
      failed = report.failed,
      remaining = report.remaining,
      "Sync finished"
    );
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::{Request, Response};
  use crate::network::testing::MockNetwork;
  use url::Url;

  const TAG: &str = "background-sync";

  fn setup() -> (SyncCoordinator, Arc<OfflineStore>, Arc<MockNetwork>) {
    let store = Arc::new(OfflineStore::new(Database::open_in_memory().unwrap()));
    let network = Arc::new(MockNetwork::new());
    let sync = SyncCoordinator::new(store.clone(), network.clone(), TAG);
    (sync, store, network)
  }

  fn write(method: &str, path: &str) -> Request {
    let origin = Url::parse("http://localhost:3000/").unwrap();
    Request::parse(method, path, &origin).unwrap()
  }

  #[tokio::test]
  async fn test_drain_replays_in_order_and_empties_store() {
    let (sync, store, network) = setup();
    store.enqueue(&write("POST", "/api/cart").with_body("a")).unwrap();
    store.enqueue(&write("POST", "/api/cart").with_body("b")).unwrap();
    store.enqueue(&write("DELETE", "/api/cart/5")).unwrap();
    network
      .respond("POST", "http://localhost:3000/api/cart", Response::ok("application/json", "{}"))
      .respond("DELETE", "http://localhost:3000/api/cart/5", Response::new(204, "text/plain", ""));

    let report = sync.on_reconnect(TAG).await;

    assert_eq!(report.replayed, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(
      network.calls(),
      vec![
        "POST http://localhost:3000/api/cart",
        "POST http://localhost:3000/api/cart",
        "DELETE http://localhost:3000/api/cart/5",
      ]
    );
    assert!(store.list_all().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failure_keeps_action_and_continues() {
    let (sync, store, network) = setup();
    store.enqueue(&write("POST", "/api/a")).unwrap();
    let failing = store.enqueue(&write("POST", "/api/b")).unwrap();
    store.enqueue(&write("POST", "/api/c")).unwrap();
    network
      .respond("POST", "http://localhost:3000/api/a", Response::ok("text/plain", ""))
      .fail("POST", "http://localhost:3000/api/b")
      .respond("POST", "http://localhost:3000/api/c", Response::ok("text/plain", ""));

    let report = sync.drain().await;

    assert_eq!(report.replayed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(network.call_count(), 3);
    let left = store.list_all().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, failing);
  }

  #[tokio::test]
  async fn test_rejected_replay_stays_queued() {
    let (sync, store, network) = setup();
    store.enqueue(&write("POST", "/api/a")).unwrap();
    network.respond("POST", "http://localhost:3000/api/a", Response::new(500, "text/plain", ""));

    let report = sync.drain().await;
    assert_eq!(report.failed, 1);
    assert_eq!(store.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_empty_store_is_idempotent() {
    let (sync, _store, network) = setup();
    let first = sync.on_reconnect(TAG).await;
    let second = sync.on_reconnect(TAG).await;

    assert_eq!(first, second);
    assert_eq!(first.replayed, 0);
    assert_eq!(network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let (sync, store, network) = setup();
    store.enqueue(&write("POST", "/api/a")).unwrap();

    let report = sync.on_reconnect("periodic-refresh").await;
    assert!(!report.ran);
    assert_eq!(network.call_count(), 0);
    assert_eq!(store.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_overlapping_drains_replay_each_action_once() {
    let (sync, store, network) = setup();
    store.enqueue(&write("POST", "/api/cart")).unwrap();
    network.respond("POST", "http://localhost:3000/api/cart", Response::ok("text/plain", ""));

    let (first, second) = tokio::join!(sync.drain(), sync.drain());

    assert_eq!(first.replayed + second.replayed, 1);
    assert_eq!(network.call_count(), 1);
    assert_eq!(store.len().unwrap(), 0);
  }
}
