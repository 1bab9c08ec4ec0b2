//! Request and response snapshots passed through the gateway.
//!
//! Payloads are opaque bytes; only method, URL, headers and status are
//! interpreted.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

pub type Headers = BTreeMap<String, String>;

/// How the request was issued by the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Subresource or programmatic fetch
  #[default]
  Resource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
  pub method: String,
  pub url: Url,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default, with = "base64_body::option")]
  pub body: Option<Vec<u8>>,
  #[serde(default)]
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Headers::new(),
      body: None,
      mode: RequestMode::Resource,
    }
  }

  #[cfg(test)]
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// Build a request from a path or absolute URL, resolving against `origin`.
  pub fn parse(method: &str, target: &str, origin: &Url) -> Result<Self> {
    let url = origin
      .join(target)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", target, e))?;
    Ok(Self::new(method, url))
  }

  pub fn navigate(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Canonical cache key: `METHOD:` followed by path and query for
  /// same-origin requests, or the full URL for anything else.
  pub fn cache_key(&self, origin: &Url) -> String {
    if self.url.origin() == origin.origin() {
      match self.url.query() {
        Some(q) => format!("{}:{}?{}", self.method, self.url.path(), q),
        None => format!("{}:{}", self.method, self.url.path()),
      }
    } else {
      let mut url = self.url.clone();
      url.set_fragment(None);
      format!("{}:{}", self.method, url)
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default, with = "base64_body")]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    let mut headers = Headers::new();
    headers.insert("content-type".to_string(), content_type.to_string());
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, content_type, body)
  }

  /// Bare 503 used when a static asset can be neither fetched nor served.
  pub fn service_unavailable() -> Self {
    Self::new(503, "text/plain", "Offline")
  }

  /// Only full 200 responses are ever persisted.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Payloads cross the JSON boundary as standard base64 so arbitrary bytes
/// survive unchanged.
pub mod base64_body {
  use base64::prelude::*;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64_STANDARD
      .decode(encoded)
      .map_err(serde::de::Error::custom)
  }

  pub mod option {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
      bytes: &Option<Vec<u8>>,
      serializer: S,
    ) -> Result<S::Ok, S::Error> {
      match bytes {
        Some(bytes) => super::serialize(bytes, serializer),
        None => serializer.serialize_none(),
      }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
      deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
      match Option::<String>::deserialize(deserializer)? {
        Some(encoded) => BASE64_STANDARD
          .decode(encoded)
          .map(Some)
          .map_err(serde::de::Error::custom),
        None => Ok(None),
      }
    }
  }
}
