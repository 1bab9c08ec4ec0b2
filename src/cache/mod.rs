//! Versioned cache partitions for intercepted responses.
//!
//! This module provides:
//! - Named partitions per role (static, dynamic) tagged with a generation
//! - A storage trait with SQLite and no-op backends
//! - Purging of partitions left behind by older generations

mod registry;
mod storage;
mod traits;

pub use registry::CacheRegistry;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheNamespace, CacheRole, CacheSource, CachedEntry, Served, Versions};
