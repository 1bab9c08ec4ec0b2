//! Core types for the versioned cache partitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::http::Response;

/// Logical role of a cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRole {
  /// Pre-warmed app shell and assets, served cache-first
  Static,
  /// Responses captured from network-first traffic
  Dynamic,
}

/// A named, versioned partition. The name is always `<prefix>-<generation>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheNamespace {
  pub name: String,
  pub generation: String,
}

impl CacheNamespace {
  pub fn new(prefix: &str, generation: &str) -> Self {
    Self {
      name: format!("{}-{}", prefix, generation),
      generation: generation.to_string(),
    }
  }
}

impl fmt::Display for CacheNamespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub key: String,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Generation identifiers reported to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Versions {
  pub generation: String,
  pub static_cache: String,
  pub dynamic_cache: String,
}

/// Where a response handed back to the application came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Served from a partition without touching the network
  Cache,
  /// Network failed, prior cached response served
  Offline,
  /// Network failed and nothing was cached: generated placeholder
  Synthetic,
}

/// Response plus provenance.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
}

impl Served {
  pub fn network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  pub fn cached(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
    }
  }

  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
    }
  }

  pub fn synthetic(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Synthetic,
    }
  }
}
