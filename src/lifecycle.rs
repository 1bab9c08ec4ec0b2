//! Lifecycle manager: install, wait, activate.
//!
//! ```text
//! Idle ──install()──▶ Installing ──ok──▶ Waiting ──activate()──▶ Activating ──▶ Active
//!                          │
//!                          └──manifest failure──▶ Redundant
//! ```

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};
use url::Url;

use crate::cache::{CacheRegistry, CacheRole, Versions};
use crate::http::{Request, Response};
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
  Idle,
  Installing,
  Waiting,
  Activating,
  Active,
  /// Install aborted; this generation will never activate
  Redundant,
}

#[derive(Debug)]
struct Inner {
  state: WorkerState,
  skip_waiting: bool,
  clients_claimed: bool,
}

/// Drives one generation through its lifecycle.
#[derive(Clone)]
pub struct Lifecycle {
  registry: CacheRegistry,
  network: Arc<dyn Network>,
  origin: Url,
  manifest: Vec<String>,
  inner: Arc<Mutex<Inner>>,
  // Held across a whole install or activation; state checks stay valid
  transition: Arc<tokio::sync::Mutex<()>>,
}

impl Lifecycle {
  pub fn new(
    registry: CacheRegistry,
    network: Arc<dyn Network>,
    origin: Url,
    manifest: Vec<String>,
  ) -> Self {
    Self {
      registry,
      network,
      origin,
      manifest,
      inner: Arc::new(Mutex::new(Inner {
        state: WorkerState::Idle,
        skip_waiting: false,
        clients_claimed: false,
      })),
      transition: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
    self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn set_state(&self, state: WorkerState) -> Result<()> {
    let mut inner = self.lock()?;
    debug!(from = ?inner.state, to = ?state, "Lifecycle transition");
    inner.state = state;
    Ok(())
  }

  pub fn state(&self) -> Result<WorkerState> {
    Ok(self.lock()?.state)
  }

  pub fn clients_claimed(&self) -> Result<bool> {
    Ok(self.lock()?.clients_claimed)
  }

  pub fn get_version(&self) -> Versions {
    self.registry.versions()
  }

  /// Pre-warm the static partition from the manifest.
  ///
  /// Every manifest entry is fetched before anything is written, so a single
  /// failure leaves no partial partition behind.
  pub async fn install(&self) -> Result<()> {
    let _transition = self.transition.lock().await;

    if self.state()? == WorkerState::Active {
      debug!("Already active, nothing to install");
      return Ok(());
    }

    self.set_state(WorkerState::Installing)?;
    let namespace = self.registry.namespace(CacheRole::Static).name.clone();
    info!(namespace = %namespace, entries = self.manifest.len(), "Installing");

    let stored = match self.fetch_manifest().await {
      Ok(entries) => self.registry.populate(CacheRole::Static, entries).await,
      Err(e) => Err(e),
    };
    if let Err(e) = stored {
      error!(namespace = %namespace, error = %e, "Install aborted");
      self.set_state(WorkerState::Redundant)?;
      return Err(e);
    }

    self.set_state(WorkerState::Waiting)?;
    info!(namespace = %namespace, "Installed, waiting to activate");

    let skip_waiting = self.lock()?.skip_waiting;
    if skip_waiting {
      self.cut_over().await?;
    }
    Ok(())
  }

  async fn fetch_manifest(&self) -> Result<Vec<(String, Response)>> {
    let fetches = self.manifest.iter().map(|path| async move {
      let request = Request::parse("GET", path, &self.origin)?;
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to fetch manifest entry {}: {}", path, e))?;
      if !response.is_cacheable() {
        return Err(eyre!(
          "Manifest entry {} returned status {}",
          path,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.cache_key(&self.origin), response))
    });
    try_join_all(fetches).await
  }

  /// Switch to this generation: purge every stale partition and claim
  /// all open application contexts.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let _transition = self.transition.lock().await;

    match self.state()? {
      WorkerState::Waiting => {}
      WorkerState::Active => {
        debug!("Already active");
        return Ok(Vec::new());
      }
      WorkerState::Redundant => return Err(eyre!("Cannot activate: install was aborted")),
      WorkerState::Idle => {
        if !self.installed_earlier().await? {
          return Err(eyre!(
            "Cannot activate: {} is not installed",
            self.registry.namespace(CacheRole::Static)
          ));
        }
      }
      state => return Err(eyre!("Cannot activate while {:?}", state)),
    }

    self.cut_over().await
  }

  /// A previous process committed the current static partition.
  async fn installed_earlier(&self) -> Result<bool> {
    self.registry.is_installed(CacheRole::Static).await
  }

  /// Callers hold the transition guard and have checked the state.
  async fn cut_over(&self) -> Result<Vec<String>> {
    let previous = self.state()?;
    self.set_state(WorkerState::Activating)?;

    let purged = match self.registry.open(CacheRole::Dynamic).await {
      Ok(()) => self.registry.purge_stale().await,
      Err(e) => Err(e),
    };
    let deleted = match purged {
      Ok(deleted) => deleted,
      Err(e) => {
        error!(error = %e, "Activation failed");
        self.set_state(previous)?;
        return Err(e);
      }
    };

    {
      let mut inner = self.lock()?;
      inner.state = WorkerState::Active;
      inner.clients_claimed = true;
    }
    info!(
      generation = %self.registry.versions().generation,
      purged = deleted.len(),
      "Activated and claimed clients"
    );
    Ok(deleted)
  }

  /// Cut over as soon as installation allows, without waiting.
  ///
  /// Before any install the request is remembered and honored when the
  /// install completes.
  pub async fn skip_waiting(&self) -> Result<()> {
    self.lock()?.skip_waiting = true;

    let _transition = self.transition.lock().await;
    let ready = match self.state()? {
      WorkerState::Waiting => true,
      WorkerState::Idle => self.installed_earlier().await?,
      _ => false,
    };
    if ready {
      self.cut_over().await?;
    } else {
      debug!("Skip-waiting recorded, nothing installed yet");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, SqliteStorage};
  use crate::config::CacheConfig;
  use crate::network::testing::MockNetwork;

  const ORIGIN: &str = "http://localhost:3000/";

  fn lifecycle(
    version: &str,
    storage: Arc<dyn CacheStorage>,
    network: Arc<MockNetwork>,
  ) -> Lifecycle {
    let config = CacheConfig {
      version: version.to_string(),
      ..CacheConfig::default()
    };
    Lifecycle::new(
      CacheRegistry::new(storage, &config),
      network,
      Url::parse(ORIGIN).unwrap(),
      vec!["/".to_string(), "/static/css/main.css".to_string()],
    )
  }

  fn script_manifest(network: &MockNetwork) {
    network
      .respond("GET", "http://localhost:3000/", Response::ok("text/html", "shell"))
      .respond("GET", "http://localhost:3000/static/css/main.css", Response::ok("text/css", "x"));
  }

  #[tokio::test]
  async fn test_install_populates_static_and_waits() {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    script_manifest(&network);
    let lc = lifecycle("v1", storage.clone(), network);

    lc.install().await.unwrap();
    assert_eq!(lc.state().unwrap(), WorkerState::Waiting);
    assert_eq!(
      storage.keys("static-v1").unwrap(),
      vec!["GET:/", "GET:/static/css/main.css"]
    );
  }

  #[tokio::test]
  async fn test_failed_manifest_entry_aborts_atomically() {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    network.respond("GET", "http://localhost:3000/", Response::ok("text/html", "shell"));
    let lc = lifecycle("v1", storage.clone(), network);

    assert!(lc.install().await.is_err());
    assert_eq!(lc.state().unwrap(), WorkerState::Redundant);
    assert!(storage.namespaces().unwrap().is_empty());
    assert!(lc.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_activation_with_new_generation_leaves_two_partitions() {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    script_manifest(&network);

    let old = lifecycle("v1", storage.clone(), network.clone());
    old.install().await.unwrap();
    old.activate().await.unwrap();
    storage
      .put("dynamic-v1", "GET:/api/products", &Response::ok("application/json", "[]"))
      .unwrap();

    let new = lifecycle("v2", storage.clone(), network);
    new.install().await.unwrap();
    let mut purged = new.activate().await.unwrap();
    purged.sort();

    assert_eq!(purged, vec!["dynamic-v1", "static-v1"]);
    assert_eq!(storage.namespaces().unwrap(), vec!["dynamic-v2", "static-v2"]);
    assert_eq!(new.state().unwrap(), WorkerState::Active);
    assert!(new.clients_claimed().unwrap());
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_is_remembered() {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    script_manifest(&network);
    let lc = lifecycle("v1", storage, network);

    lc.skip_waiting().await.unwrap();
    assert_eq!(lc.state().unwrap(), WorkerState::Idle);

    lc.install().await.unwrap();
    assert_eq!(lc.state().unwrap(), WorkerState::Active);
  }

  #[tokio::test]
  async fn test_activate_from_fresh_process_requires_committed_install() {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    script_manifest(&network);
    let lc = lifecycle("v1", storage.clone(), network.clone());
    assert!(lc.activate().await.is_err());

    lc.install().await.unwrap();
    let fresh = lifecycle("v1", storage, network);
    fresh.activate().await.unwrap();
    assert_eq!(fresh.state().unwrap(), WorkerState::Active);
    assert_eq!(fresh.get_version().static_cache, "static-v1");
  }

  #[tokio::test]
  async fn test_runtime_static_fill_is_not_an_install() {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    script_manifest(&network);

    let old = lifecycle("v1", storage.clone(), network.clone());
    old.install().await.unwrap();
    old.activate().await.unwrap();

    storage
      .put("static-v2", "GET:/static/app.css", &Response::ok("text/css", "x"))
      .unwrap();
    let new = lifecycle("v2", storage.clone(), network);

    assert!(new.activate().await.is_err());
    new.skip_waiting().await.unwrap();
    assert_eq!(new.state().unwrap(), WorkerState::Idle);
    assert!(storage.namespaces().unwrap().contains(&"static-v1".to_string()));
  }
}
