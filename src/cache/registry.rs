//! Cache namespace registry: owns which partitions are current.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info};

use super::storage::CacheStorage;
use super::traits::{CacheNamespace, CacheRole, CachedEntry, Versions};
use crate::config::CacheConfig;
use crate::http::Response;

/// Registry of the two current partitions over a shared storage backend.
///
/// Cheap to clone; every handler holds its own handle to the same storage.
#[derive(Clone)]
pub struct CacheRegistry {
  storage: Arc<dyn CacheStorage>,
  static_ns: CacheNamespace,
  dynamic_ns: CacheNamespace,
}

impl CacheRegistry {
  pub fn new(storage: Arc<dyn CacheStorage>, config: &CacheConfig) -> Self {
    Self {
      storage,
      static_ns: CacheNamespace::new(&config.static_prefix, &config.version),
      dynamic_ns: CacheNamespace::new(&config.dynamic_prefix, &config.version),
    }
  }

  /// The current namespace for a role.
  pub fn namespace(&self, role: CacheRole) -> &CacheNamespace {
    match role {
      CacheRole::Static => &self.static_ns,
      CacheRole::Dynamic => &self.dynamic_ns,
    }
  }

  pub fn versions(&self) -> Versions {
    Versions {
      generation: self.static_ns.generation.clone(),
      static_cache: self.static_ns.name.clone(),
      dynamic_cache: self.dynamic_ns.name.clone(),
    }
  }

  /// Run a storage call on the blocking pool so SQLite never stalls the
  /// event loop.
  async fn blocking<T, F>(&self, op: F) -> Result<T>
  where
    F: FnOnce(&dyn CacheStorage) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || op(storage.as_ref()))
      .await
      .map_err(|e| eyre!("Cache storage task failed: {}", e))?
  }

  pub async fn lookup(&self, role: CacheRole, key: &str) -> Result<Option<CachedEntry>> {
    let namespace = self.namespace(role).name.clone();
    let key = key.to_string();
    self
      .blocking(move |storage| storage.get(&namespace, &key))
      .await
  }

  /// Store a response under `key` if it is cacheable.
  ///
  /// Returns whether anything was written.
  pub async fn store(&self, role: CacheRole, key: &str, response: &Response) -> Result<bool> {
    if !response.is_cacheable() {
      debug!(key, status = response.status, "Not caching non-200 response");
      return Ok(false);
    }
    let namespace = self.namespace(role).name.clone();
    let key = key.to_string();
    let response = response.clone();
    self
      .blocking(move |storage| storage.put(&namespace, &key, &response))
      .await?;
    Ok(true)
  }

  /// Populate a role's partition in one atomic batch and mark it installed.
  pub async fn populate(&self, role: CacheRole, entries: Vec<(String, Response)>) -> Result<()> {
    let namespace = self.namespace(role).name.clone();
    self
      .blocking(move |storage| storage.put_all(&namespace, &entries))
      .await
  }

  pub async fn open(&self, role: CacheRole) -> Result<()> {
    let namespace = self.namespace(role).name.clone();
    self
      .blocking(move |storage| storage.open_namespace(&namespace))
      .await
  }

  /// Whether the role's partition holds a committed install.
  pub async fn is_installed(&self, role: CacheRole) -> Result<bool> {
    let namespace = self.namespace(role).name.clone();
    self
      .blocking(move |storage| storage.is_installed(&namespace))
      .await
  }

  /// Every namespace currently in storage, current or not.
  pub fn partitions(&self) -> Result<Vec<String>> {
    self.storage.namespaces()
  }

  pub fn keys(&self, role: CacheRole) -> Result<Vec<String>> {
    self.storage.keys(&self.namespace(role).name)
  }

  /// Delete every namespace that is not current for either role.
  ///
  /// Deletion is irreversible. Returns the deleted names.
  pub async fn purge_stale(&self) -> Result<Vec<String>> {
    let current = [self.static_ns.name.clone(), self.dynamic_ns.name.clone()];
    let deleted = self
      .blocking(move |storage| {
        let mut deleted = Vec::new();
        for name in storage.namespaces()? {
          if current.contains(&name) {
            continue;
          }
          if storage.delete_namespace(&name)? {
            deleted.push(name);
          }
        }
        Ok(deleted)
      })
      .await?;

    for name in &deleted {
      info!(namespace = %name, "Deleted stale cache partition");
    }
    Ok(deleted)
  }
}
