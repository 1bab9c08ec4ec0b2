//! Signals, the handler table and the dispatcher loop.
//!
//! Every external event becomes a [`Signal`]. Handlers are registered per
//! [`SignalKind`] and return a boxed future; the dispatcher awaits it before
//! the event counts as handled.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::{CacheSource, Served, Versions};
use crate::http::Request;
use crate::notify::{ClickOutcome, NotificationPayload};
use crate::sync::SyncReport;

/// Control messages posted by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
  ForceActivateNow,
  ReportVersion,
}

/// External events
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
  Install,
  Activate,
  /// Intercepted request expecting exactly one response
  Fetch { request: Request },
  /// Connectivity returned
  Sync { tag: String },
  Push {
    #[serde(default)]
    payload: Option<String>,
  },
  NotificationClick {
    #[serde(default)]
    action: Option<String>,
    notification: NotificationPayload,
  },
  Message { message: ControlMessage },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
  Install,
  Activate,
  Fetch,
  Sync,
  Push,
  NotificationClick,
  Message,
}

impl Signal {
  pub fn kind(&self) -> SignalKind {
    match self {
      Signal::Install => SignalKind::Install,
      Signal::Activate => SignalKind::Activate,
      Signal::Fetch { .. } => SignalKind::Fetch,
      Signal::Sync { .. } => SignalKind::Sync,
      Signal::Push { .. } => SignalKind::Push,
      Signal::NotificationClick { .. } => SignalKind::NotificationClick,
      Signal::Message { .. } => SignalKind::Message,
    }
  }
}

/// Handler results, serialized one per line by `swgate run`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
  Ack,
  Activated {
    purged: Vec<String>,
    clients_claimed: bool,
  },
  Response {
    status: u16,
    headers: BTreeMap<String, String>,
    #[serde(with = "crate::http::base64_body")]
    body: Vec<u8>,
    source: CacheSource,
  },
  /// Not intercepted; default network handling applies
  Passthrough,
  Synced {
    report: SyncReport,
  },
  Notification {
    notification: NotificationPayload,
  },
  Click {
    outcome: ClickOutcome,
  },
  Version {
    versions: Versions,
  },
  Error {
    message: String,
  },
}

impl From<Served> for Reply {
  fn from(served: Served) -> Self {
    Reply::Response {
      status: served.response.status,
      headers: served.response.headers,
      body: served.response.body,
      source: served.source,
    }
  }
}

/// A boxed future that returns a handler result
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An async handler for one signal kind
pub type Handler = Arc<dyn Fn(Signal) -> BoxFuture<Result<Reply>> + Send + Sync>;

/// Signal kind → handler registration table.
#[derive(Default, Clone)]
pub struct HandlerTable {
  handlers: HashMap<SignalKind, Handler>,
}

impl HandlerTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the handler for a kind, replacing any previous one.
  pub fn on<F, Fut>(&mut self, kind: SignalKind, handler: F) -> &mut Self
  where
    F: Fn(Signal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply>> + Send + 'static,
  {
    let boxed: Handler =
      Arc::new(move |signal| -> BoxFuture<Result<Reply>> { Box::pin(handler(signal)) });
    self.handlers.insert(kind, boxed);
    self
  }

  /// Run the handler for a signal to completion.
  ///
  /// Unhandled fetches pass through; other unhandled signals are errors.
  pub async fn dispatch(&self, signal: Signal) -> Result<Reply> {
    let kind = signal.kind();
    match self.handlers.get(&kind) {
      Some(handler) => handler(signal).await,
      None if kind == SignalKind::Fetch => Ok(Reply::Passthrough),
      None => Err(eyre!("No handler registered for {:?}", kind)),
    }
  }
}

struct Envelope {
  signal: Signal,
  reply: oneshot::Sender<Result<Reply>>,
}

/// Cloneable handle for delivering signals to a running dispatcher.
#[derive(Clone)]
pub struct SignalSender {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl SignalSender {
  /// Deliver a signal and wait for its handler to finish.
  pub async fn request(&self, signal: Signal) -> Result<Reply> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope { signal, reply: tx })
      .map_err(|_| eyre!("Dispatcher has shut down"))?;
    rx.await
      .map_err(|_| eyre!("Handler dropped without replying"))?
  }
}

/// Event loop delivering signals to the handler table.
///
/// Every handler is spawned, so a slow drain or install never holds up an
/// intercepted request. Components serialize their own critical sections.
/// A spawned handler runs to completion even when its requester has gone
/// away.
pub struct Dispatcher {
  table: Arc<HandlerTable>,
  rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Dispatcher {
  pub fn new(table: HandlerTable) -> (Self, SignalSender) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      Self {
        table: Arc::new(table),
        rx,
      },
      SignalSender { tx },
    )
  }

  /// Run until every sender is dropped and spawned handlers have finished.
  pub async fn run(mut self) {
    let mut in_flight = tokio::task::JoinSet::new();

    while let Some(Envelope { signal, reply }) = self.rx.recv().await {
      let kind = signal.kind();
      debug!(?kind, "Dispatching signal");

      let table = Arc::clone(&self.table);
      in_flight.spawn(async move {
        let result = table.dispatch(signal).await;
        deliver(kind, reply, result);
      });

      // Reap finished handlers without blocking
      while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
  }
}

fn deliver(kind: SignalKind, reply: oneshot::Sender<Result<Reply>>, result: Result<Reply>) {
  if let Err(Err(e)) = reply.send(result) {
    // Requester went away; the failure would otherwise vanish
    warn!(?kind, error = %e, "Handler failed");
  }
}
