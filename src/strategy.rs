//! Strategy executor: cache-first, network-first and live passthrough.
//!
//! Network failures inside a strategy are recovered through the fallback
//! chain and never surface as errors, except for direct writes and live
//! computation endpoints where the failure is the answer.

use color_eyre::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheRegistry, CacheRole, Served};
use crate::classify::{Classification, RequestClassifier};
use crate::config::OfflineConfig;
use crate::http::{Request, Response};
use crate::network::Network;

/// Synthetic response used when neither network nor cache can answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OfflineTemplate {
  /// `{"error": ..., "message": ...}`
  Json { error: String, message: String },
  /// Minimal page with a reload control
  Html {
    title: String,
    heading: String,
    message: String,
    retry_label: String,
  },
}

impl OfflineTemplate {
  pub fn default_api() -> Self {
    OfflineTemplate::Json {
      error: "Network error".to_string(),
      message: "You are offline. Please check your connection.".to_string(),
    }
  }

  pub fn default_navigation() -> Self {
    OfflineTemplate::Html {
      title: "Offline".to_string(),
      heading: "You're offline".to_string(),
      message: "Check your connection and try again.".to_string(),
      retry_label: "Retry".to_string(),
    }
  }

  /// Render as a 503 response.
  pub fn render(&self) -> Response {
    match self {
      OfflineTemplate::Json { error, message } => {
        let body = serde_json::json!({ "error": error, "message": message });
        Response::new(503, "application/json", body.to_string())
      }
      OfflineTemplate::Html {
        title,
        heading,
        message,
        retry_label,
      } => {
        let body = format!(
          "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{}</title></head>\n\
           <body>\n<h1>{}</h1>\n<p>{}</p>\n<button onclick=\"window.location.reload()\">{}</button>\n\
           </body>\n</html>\n",
          escape_html(title),
          escape_html(heading),
          escape_html(message),
          escape_html(retry_label)
        );
        Response::new(503, "text/html; charset=utf-8", body)
      }
    }
  }
}

fn escape_html(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    match c {
      '&' => out.push_str("&amp;"),
      '<' => out.push_str("&lt;"),
      '>' => out.push_str("&gt;"),
      '"' => out.push_str("&quot;"),
      _ => out.push(c),
    }
  }
  out
}

/// Runs the strategy chosen by the classifier against cache and network.
#[derive(Clone)]
pub struct StrategyExecutor {
  registry: CacheRegistry,
  network: Arc<dyn Network>,
  classifier: RequestClassifier,
  origin: Url,
  offline: OfflineConfig,
  offline_document: Option<String>,
}

impl StrategyExecutor {
  pub fn new(
    registry: CacheRegistry,
    network: Arc<dyn Network>,
    classifier: RequestClassifier,
    origin: Url,
    offline: OfflineConfig,
  ) -> Self {
    Self {
      registry,
      network,
      classifier,
      origin,
      offline,
      offline_document: None,
    }
  }

  /// Serve this path from the static partition before the synthetic page.
  pub fn with_offline_document(mut self, path: Option<String>) -> Self {
    self.offline_document = path;
    self
  }

  pub async fn execute(&self, class: Classification, request: &Request) -> Result<Served> {
    if self.classifier.is_bypassed(request) {
      return Ok(self.bypass(request).await);
    }

    match class {
      Classification::Static => Ok(self.cache_first(request).await),
      Classification::Api if self.classifier.is_live(request) => self.live(request).await,
      Classification::Api | Classification::Navigation | Classification::Other => {
        Ok(self.network_first(class, request).await)
      }
      Classification::Direct | Classification::Passthrough => self.live(request).await,
    }
  }

  /// Extension schemes go straight to the network whatever their
  /// classification and never read or write either partition.
  async fn bypass(&self, request: &Request) -> Served {
    debug!(url = %request.url, "Bypassing cache for scheme");
    match self.network.fetch(request).await {
      Ok(response) => Served::network(response),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Bypassed fetch failed");
        Served::synthetic(Response::service_unavailable())
      }
    }
  }

    /// Static partition first; the network only fills misses.
  async fn cache_first(&self, request: &Request) -> Served {
    let key = request.cache_key(&self.origin);

    match self.registry.lookup(CacheRole::Static, &key).await {
      Ok(Some(entry)) => {
        debug!(key = %key, "Static cache hit");
        return Served::cached(entry.response);
      }
      Ok(None) => debug!(key = %key, "Static cache miss"),
      Err(e) => warn!(key = %key, error = %e, "Static cache lookup failed"),
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.remember(CacheRole::Static, &key, &response).await;
        Served::network(response)
      }
      Err(e) => {
        warn!(key = %key, error = %e, "Static fetch failed");
        Served::synthetic(Response::service_unavailable())
      }
    }
  }

  /// Network first, falling back to the dynamic partition and then to a
  /// synthetic offline response for the request's classification.
  async fn network_first(&self, class: Classification, request: &Request) -> Served {
    let key = request.cache_key(&self.origin);

    let error = match self.network.fetch(request).await {
      Ok(response) => {
        self.remember(CacheRole::Dynamic, &key, &response).await;
        return Served::network(response);
      }
      Err(e) => e,
    };

    warn!(key = %key, error = %error, "Network failed, falling back to cache");

    if let Some(response) = self.cached(CacheRole::Dynamic, &key).await {
      return Served::offline(response);
    }

    match class {
      Classification::Api => Served::synthetic(self.offline.api.render()),
      Classification::Navigation => {
        if let Some(response) = self.cached(CacheRole::Static, &key).await {
          return Served::offline(response);
        }
        if let Some(response) = self.offline_document().await {
          return Served::offline(response);
        }
        Served::synthetic(self.offline.navigation.render())
      }
      _ => Served::synthetic(Response::service_unavailable()),
    }
  }

  /// Always the network, never the cache. Failures propagate.
  async fn live(&self, request: &Request) -> Result<Served> {
    debug!(method = %request.method, url = %request.url, "Uncached network request");
    let response = self.network.fetch(request).await?;
    Ok(Served::network(response))
  }

  async fn cached(&self, role: CacheRole, key: &str) -> Option<Response> {
    match self.registry.lookup(role, key).await {
      Ok(entry) => entry.map(|e| e.response),
      Err(e) => {
        warn!(key, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  async fn offline_document(&self) -> Option<Response> {
    let path = self.offline_document.as_deref()?;
    let request = match Request::parse("GET", path, &self.origin) {
      Ok(request) => request,
      Err(e) => {
        warn!(error = %e, "Invalid offline document path");
        return None;
      }
    };
    self
      .cached(CacheRole::Static, &request.cache_key(&self.origin))
      .await
  }

  /// Cache write failures never affect the live response.
  async fn remember(&self, role: CacheRole, key: &str, response: &Response) {
    if let Err(e) = self.registry.store(role, key, response).await {
      warn!(key, error = %e, "Failed to cache response");
    }
  }
}
