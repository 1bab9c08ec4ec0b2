//! Push notification rendering and click routing.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::NotificationConfig;

pub const VIEW_ACTION: &str = "view";
pub const DISMISS_ACTION: &str = "dismiss";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub id: String,
  pub label: String,
  pub icon: String,
}

/// Rendered notification. Lives only for the duration of dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub data: Map<String, Value>,
  pub actions: Vec<NotificationAction>,
}

/// Where notifications are shown and application contexts opened.
#[async_trait]
pub trait NotificationSurface: Send + Sync {
  async fn show(&self, notification: &NotificationPayload) -> Result<()>;
  async fn close(&self, notification: &NotificationPayload) -> Result<()>;
  async fn open_window(&self, url: &str) -> Result<()>;
}

/// Surface that reports through the log, used by the CLI.
pub struct LogSurface;

#[async_trait]
impl NotificationSurface for LogSurface {
  async fn show(&self, notification: &NotificationPayload) -> Result<()> {
    info!(title = %notification.title, body = %notification.body, "Notification shown");
    Ok(())
  }

  async fn close(&self, notification: &NotificationPayload) -> Result<()> {
    debug!(title = %notification.title, "Notification closed");
    Ok(())
  }

  async fn open_window(&self, url: &str) -> Result<()> {
    info!(url, "Opening application window");
    Ok(())
  }
}

/// What a click resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ClickOutcome {
  Opened { url: String },
  Dismissed,
}

pub struct NotificationDispatcher {
  config: NotificationConfig,
  surface: Arc<dyn NotificationSurface>,
}

impl NotificationDispatcher {
  pub fn new(config: NotificationConfig, surface: Arc<dyn NotificationSurface>) -> Self {
    Self { config, surface }
  }

  /// Build the notification for a push payload's text.
  pub fn render(&self, payload: Option<&str>) -> NotificationPayload {
    let body = match payload.map(str::trim) {
      Some(text) if !text.is_empty() => text.to_string(),
      _ => self.config.default_body.clone(),
    };

    let mut data = Map::new();
    data.insert("url".to_string(), Value::String(self.config.default_url.clone()));
    data.insert(
      "date_of_arrival".to_string(),
      Value::from(Utc::now().timestamp_millis()),
    );

    NotificationPayload {
      title: self.config.title.clone(),
      body,
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      data,
      actions: vec![
        NotificationAction {
          id: VIEW_ACTION.to_string(),
          label: "View".to_string(),
          icon: self.config.icon.clone(),
        },
        NotificationAction {
          id: DISMISS_ACTION.to_string(),
          label: "Dismiss".to_string(),
          icon: self.config.icon.clone(),
        },
      ],
    }
  }

  pub async fn on_push(&self, payload: Option<&str>) -> Result<NotificationPayload> {
    let notification = self.render(payload);
    self.surface.show(&notification).await?;
    Ok(notification)
  }

  /// Close the notification, then open its target for the view action or a
  /// click on the body. Any other action only closes.
  pub async fn on_click(
    &self,
    notification: &NotificationPayload,
    action: Option<&str>,
  ) -> Result<ClickOutcome> {
    self.surface.close(notification).await?;

    match action {
      None | Some(VIEW_ACTION) => {
        let url = notification
          .data
          .get("url")
          .and_then(Value::as_str)
          .unwrap_or(&self.config.default_url)
          .to_string();
        self.surface.open_window(&url).await?;
        Ok(ClickOutcome::Opened { url })
      }
      Some(other) => {
        debug!(action = other, "Notification dismissed");
        Ok(ClickOutcome::Dismissed)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[derive(Default)]
  struct RecordingSurface {
    events: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl NotificationSurface for RecordingSurface {
    async fn show(&self, n: &NotificationPayload) -> Result<()> {
      self.events.lock().unwrap().push(format!("show:{}", n.body));
      Ok(())
    }
    async fn close(&self, _n: &NotificationPayload) -> Result<()> {
      self.events.lock().unwrap().push("close".to_string());
      Ok(())
    }
    async fn open_window(&self, url: &str) -> Result<()> {
      self.events.lock().unwrap().push(format!("open:{}", url));
      Ok(())
    }
  }

  fn dispatcher() -> (NotificationDispatcher, Arc<RecordingSurface>) {
    let surface = Arc::new(RecordingSurface::default());
    (
      NotificationDispatcher::new(NotificationConfig::default(), surface.clone()),
      surface,
    )
  }

  #[tokio::test]
  async fn test_push_uses_text_and_two_actions() {
    let (d, surface) = dispatcher();
    let n = d.on_push(Some("Your order shipped")).await.unwrap();

    assert_eq!(n.body, "Your order shipped");
    let ids: Vec<&str> = n.actions.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec![VIEW_ACTION, DISMISS_ACTION]);
    assert_eq!(surface.events.lock().unwrap().as_slice(), ["show:Your order shipped"]);
  }

  #[test]
  fn test_empty_push_falls_back_to_default() {
    let (d, _) = dispatcher();
    assert_eq!(d.render(None).body, "New notification");
    assert_eq!(d.render(Some("   ")).body, "New notification");
  }

  #[tokio::test]
  async fn test_click_on_body_opens_target() {
    let (d, surface) = dispatcher();
    let mut n = d.render(Some("hi"));
    n.data.insert("url".to_string(), Value::String("/orders/9".to_string()));

    let outcome = d.on_click(&n, None).await.unwrap();
    assert_eq!(outcome, ClickOutcome::Opened { url: "/orders/9".to_string() });
    assert_eq!(surface.events.lock().unwrap().as_slice(), ["close", "open:/orders/9"]);
  }

  #[tokio::test]
  async fn test_dismiss_only_closes() {
    let (d, surface) = dispatcher();
    let n = d.render(Some("hi"));

    let outcome = d.on_click(&n, Some(DISMISS_ACTION)).await.unwrap();
    assert_eq!(outcome, ClickOutcome::Dismissed);
    assert_eq!(surface.events.lock().unwrap().as_slice(), ["close"]);
  }
}
