mod cache;
mod classify;
mod config;
mod db;
mod event;
mod http;
mod lifecycle;
mod network;
mod notify;
mod offline;
mod strategy;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cache::CacheRole;
use crate::event::{ControlMessage, Dispatcher, Reply, Signal, SignalSender};
use crate::http::Request;
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "swgate")]
#[command(about = "An offline-tolerant request gateway with versioned caches")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./swgate.yaml or $XDG_CONFIG_HOME/swgate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-warm the static partition from the manifest
  Install {
    /// Activate immediately after a successful install
    #[arg(long)]
    activate: bool,
  },
  /// Purge stale partitions and take control
  Activate,
  /// Send one request through the gateway
  Fetch {
    /// Path (resolved against the origin) or absolute URL
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Header as "Name: value", repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    #[arg(short, long)]
    data: Option<String>,
    /// Treat as a top-level page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Signal that connectivity returned
  Sync {
    /// Sync tag (defaults to the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Inspect the offline queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// List cache partitions and the current keys
  Partitions,
  /// Report the current generation identifiers
  Version,
  /// Deliver a push payload
  Push { payload: Option<String> },
  /// Simulate a click on a notification
  Click {
    #[arg(long)]
    action: Option<String>,
    /// Target URL stored in the notification data
    #[arg(long)]
    url: Option<String>,
  },
  /// Post a control message (force-activate-now, report-version)
  Message {
    #[arg(value_name = "TYPE")]
    kind: String,
  },
  /// Read JSON-line signals from stdin and print JSON-line replies
  Run,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  List,
  Remove { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config.data_dir()?, args.verbose)?;

  let worker = Worker::open(config)?;
  let (dispatcher, sender) = Dispatcher::new(worker.handlers());
  let running = tokio::spawn(dispatcher.run());

  let result = run_command(args.command, &worker, &sender).await;

  // Let spawned handlers finish before exiting
  drop(sender);
  running
    .await
    .map_err(|e| eyre!("Dispatcher task failed: {}", e))?;

  result
}

async fn run_command(command: Command, worker: &Worker, sender: &SignalSender) -> Result<()> {
  match command {
    Command::Install { activate } => {
      print_json(&sender.request(Signal::Install).await?)?;
      if activate {
        print_json(&sender.request(Signal::Activate).await?)?;
      }
    }
    Command::Activate => print_json(&sender.request(Signal::Activate).await?)?,
    Command::Fetch {
      url,
      method,
      headers,
      data,
      navigate,
    } => {
      let mut request = Request::parse(&method, &url, &worker.config().origin)?;
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }
      if navigate {
        request = request.navigate();
      }
      print_json(&sender.request(Signal::Fetch { request }).await?)?;
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| worker.config().sync.tag.clone());
      print_json(&sender.request(Signal::Sync { tag }).await?)?;
    }
    Command::Queue { command } => match command {
      QueueCommand::List => print_json(&worker.store().list_all()?)?,
      QueueCommand::Remove { id } => {
        if !worker.store().remove(&id)? {
          return Err(eyre!("No queued action with id {}", id));
        }
      }
    },
    Command::Partitions => {
      let registry = worker.registry();
      let current = registry.versions();
      print_json(&serde_json::json!({
        "current": current,
        "partitions": registry.partitions()?,
        "static_keys": registry.keys(CacheRole::Static)?,
        "dynamic_keys": registry.keys(CacheRole::Dynamic)?,
      }))?;
    }
    Command::Version => {
      let message = ControlMessage::ReportVersion;
      print_json(&sender.request(Signal::Message { message }).await?)?;
    }
    Command::Push { payload } => print_json(&sender.request(Signal::Push { payload }).await?)?,
    Command::Click { action, url } => {
      let notification = worker.clicked_notification(url.as_deref());
      print_json(
        &sender
          .request(Signal::NotificationClick {
            action,
            notification,
          })
          .await?,
      )?;
    }
    Command::Message { kind } => {
      let message: ControlMessage = serde_json::from_value(serde_json::json!({ "type": kind }))
        .map_err(|e| eyre!("Unknown message type '{}': {}", kind, e))?;
      print_json(&sender.request(Signal::Message { message }).await?)?;
    }
    Command::Run => run_stream(sender).await?,
  }
  Ok(())
}

/// Dispatch each stdin line as a signal. Replies are printed as they
/// complete, tagged with the input line number.
async fn run_stream(sender: &SignalSender) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut pending = tokio::task::JoinSet::new();
  let mut line_no = 0usize;

  while let Some(line) = lines
    .next_line()
    .await
    .map_err(|e| eyre!("Failed to read stdin: {}", e))?
  {
    line_no += 1;
    if line.trim().is_empty() {
      continue;
    }

    let sender = sender.clone();
    pending.spawn(async move {
      let reply = match serde_json::from_str::<Signal>(&line) {
        Ok(signal) => sender.request(signal).await.unwrap_or_else(|e| Reply::Error {
          message: e.to_string(),
        }),
        Err(e) => Reply::Error {
          message: format!("Invalid signal: {}", e),
        },
      };
      if let Ok(out) = serde_json::to_string(&serde_json::json!({ "line": line_no, "result": reply })) {
        println!("{}", out);
      }
    });
  }

  while pending.join_next().await.is_some() {}
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", out);
  Ok(())
}

/// Log to a daily file in the data directory, optionally mirrored to stderr.
fn init_logging(data_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(data_dir, "swgate.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swgate=info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
