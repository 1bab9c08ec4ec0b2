//! Persistent queue of writes that failed while offline.
//!
//! Entries are never deduplicated: the same failed write enqueued twice is
//! replayed twice.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use url::Url;

use crate::db::Database;
use crate::http::{Headers, Request};

/// A failed write awaiting replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedAction {
  pub id: String,
  pub enqueued_at: DateTime<Utc>,
  pub method: String,
  pub url: String,
  pub headers: Headers,
  #[serde(with = "crate::http::base64_body::option")]
  pub body: Option<Vec<u8>>,
}

impl QueuedAction {
  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> Result<Request> {
    let url =
      Url::parse(&self.url).map_err(|e| eyre!("Invalid queued URL '{}': {}", self.url, e))?;
    let mut request = Request::new(&self.method, url);
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    Ok(request)
  }
}

struct Inner {
  db: Database,
  /// Last assigned timestamp, keeps enqueue order strict within a process
  last_micros: i64,
}

/// Durable store owning every queued action's lifetime.
pub struct OfflineStore {
  inner: Mutex<Inner>,
}

impl OfflineStore {
  pub fn new(db: Database) -> Self {
    Self {
      inner: Mutex::new(Inner { db, last_micros: 0 }),
    }
  }

  /// Queue a request. Id and timestamp are assigned here regardless of
  /// when the caller built the request.
  pub fn enqueue(&self, request: &Request) -> Result<String> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let micros = Utc::now().timestamp_micros().max(inner.last_micros + 1);
    inner.last_micros = micros;

    let id = action_id(micros, request);
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    inner
      .db
      .conn()
      .execute(
        "INSERT INTO queued_actions (id, enqueued_at, method, url, headers, body)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          id,
          micros,
          request.method,
          request.url.as_str(),
          headers,
          request.body
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue action: {}", e))?;

    Ok(id)
  }

  /// Every queued action, oldest first.
  pub fn list_all(&self) -> Result<Vec<QueuedAction>> {
    let inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = inner
      .db
      .conn()
      .prepare(
        "SELECT id, enqueued_at, method, url, headers, body FROM queued_actions
         ORDER BY enqueued_at, id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, i64>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, Option<Vec<u8>>>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query actions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read action row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, micros, method, url, headers, body)| {
        let enqueued_at = DateTime::from_timestamp_micros(micros)
          .ok_or_else(|| eyre!("Invalid timestamp {} for action {}", micros, id))?;
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", id, e))?;
        Ok(QueuedAction {
          id,
          enqueued_at,
          method,
          url,
          headers,
          body,
        })
      })
      .collect()
  }

  /// Remove an action. Returns whether it was still queued.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = inner
      .db
      .conn()
      .execute("DELETE FROM queued_actions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove action {}: {}", id, e))?;

    Ok(removed > 0)
  }

  pub fn len(&self) -> Result<usize> {
    let inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = inner
      .db
      .conn()
      .query_row("SELECT COUNT(*) FROM queued_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count actions: {}", e))?;

    Ok(count as usize)
  }
}

/// `<timestamp hex>-<digest prefix>`: sorts by time, unique across processes.
fn action_id(micros: i64, request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(micros.to_be_bytes());
  hasher.update(std::process::id().to_be_bytes());
  hasher.update(request.method.as_bytes());
  hasher.update(request.url.as_str().as_bytes());
  if let Some(body) = &request.body {
    hasher.update(body);
  }
  let digest = hex::encode(hasher.finalize());
  format!("{:016x}-{}", micros, &digest[..12])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> OfflineStore {
    OfflineStore::new(Database::open_in_memory().unwrap())
  }

  fn write(method: &str, path: &str) -> Request {
    let origin = Url::parse("http://localhost:3000/").unwrap();
    Request::parse(method, path, &origin).unwrap()
  }

  #[test]
  fn test_list_preserves_enqueue_order() {
    let store = store();
    let a = store.enqueue(&write("POST", "/api/cart").with_body("{\"sku\":1}")).unwrap();
    let b = store.enqueue(&write("POST", "/api/cart").with_body("{\"sku\":1}")).unwrap();
    let c = store.enqueue(&write("DELETE", "/api/cart/5")).unwrap();

    let actions = store.list_all().unwrap();
    let ids: Vec<&str> = actions.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec![a.as_str(), b.as_str(), c.as_str()]);
    assert!(actions[0].enqueued_at < actions[1].enqueued_at);
  }

  #[test]
  fn test_identical_writes_are_not_deduplicated() {
    let store = store();
    let request = write("POST", "/api/cart").with_body("same");
    let first = store.enqueue(&request).unwrap();
    let second = store.enqueue(&request).unwrap();

    assert_ne!(first, second);
    assert_eq!(store.len().unwrap(), 2);
  }

  #[test]
  fn test_action_roundtrips_to_request() {
    let store = store();
    let request = write("PUT", "/api/profile")
      .with_header("Content-Type", "application/json")
      .with_body("{}");
    store.enqueue(&request).unwrap();

    let action = &store.list_all().unwrap()[0];
    assert_eq!(action.body.as_deref(), Some(&b"{}"[..]));
    assert_eq!(action.to_request().unwrap(), request);
  }

  #[test]
  fn test_remove() {
    let store = store();
    let id = store.enqueue(&write("DELETE", "/api/cart/5")).unwrap();
    assert!(store.remove(&id).unwrap());
    assert!(!store.remove(&id).unwrap());
    assert!(store.list_all().unwrap().is_empty());
  }
}
