pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Database connection wrapper for the persistent offline store
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the store for `app_name` inside `data_dir`
  pub fn open(data_dir: &Path, app_name: &str) -> Result<Self> {
    let path = Self::store_path(data_dir, app_name);

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Volatile store, used by tests
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// The store is named for the application
  pub fn store_path(data_dir: &Path, app_name: &str) -> PathBuf {
    data_dir.join(format!("{}-offline.db", app_name))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Get a reference to the connection
  pub fn conn(&self) -> &Connection {
    &self.conn
  }
}
