//! Worker context: every component built once and shared by all handlers.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheRegistry, CacheStorage, NoopStorage, SqliteStorage};
use crate::classify::{Classification, RequestClassifier};
use crate::config::Config;
use crate::db::Database;
use crate::event::{ControlMessage, HandlerTable, Reply, Signal, SignalKind};
use crate::http::Request;
use crate::lifecycle::Lifecycle;
use crate::network::{HttpNetwork, Network};
use crate::notify::{LogSurface, NotificationDispatcher, NotificationPayload, NotificationSurface};
use crate::offline::OfflineStore;
use crate::strategy::StrategyExecutor;
use crate::sync::SyncCoordinator;

/// Shared components for one worker generation.
#[derive(Clone)]
pub struct Worker {
  config: Arc<Config>,
  registry: CacheRegistry,
  classifier: RequestClassifier,
  executor: StrategyExecutor,
  lifecycle: Lifecycle,
  store: Arc<OfflineStore>,
  sync: SyncCoordinator,
  notifier: Arc<NotificationDispatcher>,
}

impl Worker {
  /// Open on-disk storage and the real network.
  pub fn open(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;

    let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
      Arc::new(SqliteStorage::open(&data_dir.join("cache.db"))?)
    } else {
      Arc::new(NoopStorage)
    };
    let db = Database::open(&data_dir, &config.app_name)?;

    Ok(Self::from_parts(
      config,
      storage,
      db,
      Arc::new(HttpNetwork::new()?),
      Arc::new(LogSurface),
    ))
  }

  pub fn from_parts(
    config: Config,
    storage: Arc<dyn CacheStorage>,
    db: Database,
    network: Arc<dyn Network>,
    surface: Arc<dyn NotificationSurface>,
  ) -> Self {
    let registry = CacheRegistry::new(storage, &config.cache);
    let classifier = RequestClassifier::new(config.routes.clone());
    let executor = StrategyExecutor::new(
      registry.clone(),
      network.clone(),
      classifier.clone(),
      config.origin.clone(),
      config.offline.clone(),
    )
    .with_offline_document(config.cache.offline_document.clone());
    let lifecycle = Lifecycle::new(
      registry.clone(),
      network.clone(),
      config.origin.clone(),
      config.cache.manifest.clone(),
    );
    let store = Arc::new(OfflineStore::new(db));
    let sync = SyncCoordinator::new(store.clone(), network, config.sync.tag.clone());
    let notifier = Arc::new(NotificationDispatcher::new(
      config.notifications.clone(),
      surface,
    ));

    Self {
      config: Arc::new(config),
      registry,
      classifier,
      executor,
      lifecycle,
      store,
      sync,
      notifier,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn registry(&self) -> &CacheRegistry {
    &self.registry
  }

  pub fn store(&self) -> &OfflineStore {
    &self.store
  }

  /// Register one handler per signal kind.
  pub fn handlers(&self) -> HandlerTable {
    let mut table = HandlerTable::new();

    let w = self.clone();
    table.on(SignalKind::Install, move |_| {
      let w = w.clone();
      async move {
        w.lifecycle.install().await?;
        Ok(Reply::Ack)
      }
    });

    let w = self.clone();
    table.on(SignalKind::Activate, move |_| {
      let w = w.clone();
      async move {
        let purged = w.lifecycle.activate().await?;
        Ok(Reply::Activated {
          purged,
          clients_claimed: w.lifecycle.clients_claimed()?,
        })
      }
    });

    let w = self.clone();
    table.on(SignalKind::Fetch, move |signal| {
      let w = w.clone();
      async move {
        match signal {
          Signal::Fetch { request } => w.handle_fetch(request).await,
          other => Err(unexpected(&other)),
        }
      }
    });

    let w = self.clone();
    table.on(SignalKind::Sync, move |signal| {
      let w = w.clone();
      async move {
        match signal {
          Signal::Sync { tag } => Ok(Reply::Synced {
            report: w.sync.on_reconnect(&tag).await,
          }),
          other => Err(unexpected(&other)),
        }
      }
    });

    let w = self.clone();
    table.on(SignalKind::Push, move |signal| {
      let w = w.clone();
      async move {
        match signal {
          Signal::Push { payload } => Ok(Reply::Notification {
            notification: w.notifier.on_push(payload.as_deref()).await?,
          }),
          other => Err(unexpected(&other)),
        }
      }
    });

    let w = self.clone();
    table.on(SignalKind::NotificationClick, move |signal| {
      let w = w.clone();
      async move {
        match signal {
          Signal::NotificationClick {
            action,
            notification,
          } => Ok(Reply::Click {
            outcome: w.notifier.on_click(&notification, action.as_deref()).await?,
          }),
          other => Err(unexpected(&other)),
        }
      }
    });

    let w = self.clone();
    table.on(SignalKind::Message, move |signal| {
      let w = w.clone();
      async move {
        match signal {
          Signal::Message { message } => w.handle_message(message).await,
          other => Err(unexpected(&other)),
        }
      }
    });

    table
  }

  /// Answer an intercepted request.
  pub async fn handle_fetch(&self, request: Request) -> Result<Reply> {
    let class = self.classifier.classify(&request);
    debug!(method = %request.method, url = %request.url, ?class, "Classified request");

    match class {
      Classification::Passthrough => Ok(Reply::Passthrough),
      Classification::Direct => self.handle_write(request).await,
      _ => Ok(self.executor.execute(class, &request).await?.into()),
    }
  }

  /// Non-GET requests go straight to the network. A write that cannot
  /// reach the network is queued for replay; the caller still sees the
  /// original failure.
  async fn handle_write(&self, request: Request) -> Result<Reply> {
    match self.executor.execute(Classification::Direct, &request).await {
      Ok(served) => Ok(served.into()),
      Err(e) => {
        if self.config.sync.queue_writes {
          match self.store.enqueue(&request) {
            Ok(id) => info!(id = %id, method = %request.method, url = %request.url, "Queued failed write"),
            Err(store_err) => {
              warn!(error = %store_err, url = %request.url, "Failed to queue write, it will not be retried")
            }
          }
        }
        Err(e)
      }
    }
  }

  async fn handle_message(&self, message: ControlMessage) -> Result<Reply> {
    match message {
      ControlMessage::ForceActivateNow => {
        self.lifecycle.skip_waiting().await?;
        Ok(Reply::Ack)
      }
      ControlMessage::ReportVersion => Ok(Reply::Version {
        versions: self.lifecycle.get_version(),
      }),
    }
  }

  /// Build the notification a click signal refers to.
  pub fn clicked_notification(&self, url: Option<&str>) -> NotificationPayload {
    let mut notification = self.notifier.render(None);
    if let Some(url) = url {
      notification
        .data
        .insert("url".to_string(), serde_json::Value::String(url.to_string()));
    }
    notification
  }
}

fn unexpected(signal: &Signal) -> color_eyre::Report {
  eyre!("Handler received unexpected signal {:?}", signal.kind())
}
