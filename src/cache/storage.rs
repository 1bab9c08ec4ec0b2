//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::CachedEntry;
use crate::http::{Headers, Response};

/// Trait for cache storage backends.
///
/// Namespaces are flat names; entries are keyed by canonical request key
/// within a namespace. Writes to an existing key replace it.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist yet.
  fn open_namespace(&self, namespace: &str) -> Result<()>;

  /// Whether a complete batch was committed with `put_all`. Namespaces
  /// filled one entry at a time never count as installed.
  fn is_installed(&self, namespace: &str) -> Result<bool>;

  /// All namespace names, sorted.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and every entry in it. Returns whether it existed.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;

  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store one entry, opening the namespace on demand.
  fn put(&self, namespace: &str, key: &str, response: &Response) -> Result<()>;

  /// Store a batch atomically and mark the namespace installed: either the
  /// namespace ends up with every entry or storage is left as it was.
  fn put_all(&self, namespace: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Request keys stored in a namespace, sorted.
  fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open_namespace(&self, _namespace: &str) -> Result<()> {
    Ok(())
  }

  fn is_installed(&self, _namespace: &str) -> Result<bool> {
    Ok(false)
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_namespace(&self, _namespace: &str) -> Result<bool> {
    Ok(false)
  }

  fn get(&self, _namespace: &str, _key: &str) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _namespace: &str, _key: &str, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all(&self, _namespace: &str, _entries: &[(String, Response)]) -> Result<()> {
    Ok(()) // Discard
  }

  fn keys(&self, _namespace: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Volatile storage, used by tests and `cache.enabled` experiments.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- installed is set only by a committed put_all
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    installed INTEGER NOT NULL DEFAULT 0
);

-- One row per (namespace, canonical request key); last write wins
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (namespace, request_key)
);
"#;

fn insert_namespace(conn: &Connection, namespace: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
      params![namespace, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;
  Ok(())
}

fn mark_installed(conn: &Connection, namespace: &str) -> Result<()> {
  conn
    .execute(
      "UPDATE cache_namespaces SET installed = 1 WHERE name = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to mark {} installed: {}", namespace, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, namespace: &str, key: &str, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, request_key, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        key,
        response.status,
        headers,
        response.body,
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key, namespace, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, namespace: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    insert_namespace(&conn, namespace)
  }

  fn is_installed(&self, namespace: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let installed: Option<bool> = conn
      .query_row(
        "SELECT installed FROM cache_namespaces WHERE name = ?",
        params![namespace],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up namespace {}: {}", namespace, e))?;

    Ok(installed.unwrap_or(false))
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE namespace = ? AND request_key = ?",
        params![namespace, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", key, namespace, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedEntry {
          key: key.to_string(),
          response: Response {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &str, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    insert_namespace(&conn, namespace)?;
    insert_entry(&conn, namespace, key, response)
  }

  fn put_all(&self, namespace: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction without commit rolls back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_namespace(&tx, namespace)?;
    for (key, response) in entries {
      insert_entry(&tx, namespace, key, response)?;
    }
    mark_installed(&tx, namespace)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT request_key FROM cache_entries WHERE namespace = ? ORDER BY request_key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", namespace, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key row: {}", e))?;

    Ok(keys)
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(body: &str) -> Response {
    Response::ok("text/plain", body)
  }

  #[test]
  fn test_put_and_get_roundtrip_preserves_bytes() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let mut res = response("body{color:red}");
    res.headers.insert("etag".to_string(), "\"abc\"".to_string());
    storage.put("static-v1", "GET:/static/app.css", &res).unwrap();

    let entry = storage.get("static-v1", "GET:/static/app.css").unwrap().unwrap();
    assert_eq!(entry.response, res);
    assert!(storage.get("dynamic-v1", "GET:/static/app.css").unwrap().is_none());
  }

  #[test]
  fn test_single_puts_never_mark_namespace_installed() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("static-v1", "GET:/static/app.css", &response("x")).unwrap();

    assert_eq!(storage.namespaces().unwrap(), vec!["static-v1".to_string()]);
    assert!(!storage.is_installed("static-v1").unwrap());
    assert!(!storage.is_installed("static-v2").unwrap());
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("dynamic-v1", "GET:/api/products", &response("old")).unwrap();
    storage.put("dynamic-v1", "GET:/api/products", &response("new")).unwrap();

    let entry = storage.get("dynamic-v1", "GET:/api/products").unwrap().unwrap();
    assert_eq!(entry.response.body_text(), "new");
    assert_eq!(storage.keys("dynamic-v1").unwrap().len(), 1);
  }

  #[test]
  fn test_delete_namespace_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("static-v1", "GET:/a.js", &response("a")).unwrap();
    storage.open_namespace("static-v2").unwrap();

    assert!(storage.delete_namespace("static-v1").unwrap());
    assert!(!storage.delete_namespace("static-v1").unwrap());
    assert_eq!(storage.namespaces().unwrap(), vec!["static-v2".to_string()]);
    assert!(storage.get("static-v1", "GET:/a.js").unwrap().is_none());
  }

  #[test]
  fn test_put_all_installs_namespace_with_every_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("static-v1", "GET:/static/app.css", &response("x")).unwrap();
    let entries = vec![
      ("GET:/".to_string(), response("shell")),
      ("GET:/manifest.json".to_string(), response("{}")),
    ];
    storage.put_all("static-v1", &entries).unwrap();

    assert!(storage.is_installed("static-v1").unwrap());
    assert_eq!(
      storage.keys("static-v1").unwrap(),
      vec![
        "GET:/".to_string(),
        "GET:/manifest.json".to_string(),
        "GET:/static/app.css".to_string()
      ]
    );
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage.put("static-v1", "GET:/a.js", &response("a")).unwrap();
    assert!(storage.get("static-v1", "GET:/a.js").unwrap().is_none());
    assert!(storage.namespaces().unwrap().is_empty());
  }
}
