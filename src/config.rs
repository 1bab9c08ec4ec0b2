use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::strategy::OfflineTemplate;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Names the persistent offline store and the data directory
  pub app_name: String,
  /// Base URL that relative request paths resolve against
  pub origin: Url,
  /// Overrides the platform data directory
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  pub offline: OfflineConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app_name: "swgate".to_string(),
      origin: Url::parse("http://localhost:3000/").expect("static origin parses"),
      data_dir: None,
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      offline: OfflineConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Generation tag shared by both partitions
  pub version: String,
  pub static_prefix: String,
  pub dynamic_prefix: String,
  /// When false, nothing is persisted and every lookup misses
  pub enabled: bool,
  /// Resources that must be fetched before an install is accepted
  pub manifest: Vec<String>,
  /// Dedicated offline page served from the static partition
  pub offline_document: Option<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      static_prefix: "static".to_string(),
      dynamic_prefix: "dynamic".to_string(),
      enabled: true,
      manifest: vec![
        "/".to_string(),
        "/manifest.json".to_string(),
        "/favicon.ico".to_string(),
        "/icons/icon-192x192.png".to_string(),
        "/icons/icon-512x512.png".to_string(),
        "/static/js/bundle.js".to_string(),
        "/static/css/main.css".to_string(),
      ],
      offline_document: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  pub api_prefixes: Vec<String>,
  pub static_prefixes: Vec<String>,
  /// File extensions without the leading dot (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
  /// Application routes a navigation may be answered for
  pub navigation_routes: Vec<String>,
  /// Path fragments identifying live computation endpoints
  pub live_markers: Vec<String>,
  /// URL schemes that skip the cache entirely
  pub bypass_schemes: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      api_prefixes: vec!["/api/".to_string()],
      static_prefixes: vec![
        "/static/".to_string(),
        "/icons/".to_string(),
        "/images/".to_string(),
        "/fonts/".to_string(),
      ],
      static_extensions: ["css", "js", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf"]
        .into_iter()
        .map(String::from)
        .collect(),
      navigation_routes: vec![
        "/".to_string(),
        "/products".to_string(),
        "/cart".to_string(),
        "/checkout".to_string(),
        "/orders".to_string(),
        "/profile".to_string(),
      ],
      live_markers: vec!["/ai/".to_string(), "/insights".to_string()],
      bypass_schemes: vec!["chrome-extension".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  pub api: OfflineTemplate,
  pub navigation: OfflineTemplate,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      api: OfflineTemplate::default_api(),
      navigation: OfflineTemplate::default_navigation(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Reconnect tag the coordinator responds to
  pub tag: String,
  /// Enqueue non-GET requests that fail on the network
  pub queue_writes: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "background-sync".to_string(),
      queue_writes: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  pub default_url: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "swgate".to_string(),
      default_body: "New notification".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/icon-72x72.png".to_string(),
      default_url: "/".to_string(),
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./swgate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swgate/config.yaml
  ///
  /// Falls back to built-in defaults when nothing is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("swgate.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swgate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Apply SWGATE_ORIGIN and SWGATE_CACHE_VERSION from the environment.
  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("SWGATE_ORIGIN") {
      self.origin =
        Url::parse(&origin).map_err(|e| eyre!("Invalid SWGATE_ORIGIN '{}': {}", origin, e))?;
    }
    if let Ok(version) = std::env::var("SWGATE_CACHE_VERSION") {
      self.cache.version = version;
    }
    Ok(self)
  }

  /// Directory holding the cache database, the offline store and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join(&self.app_name))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_cover_builtin_routes() {
    let config = Config::default();
    assert_eq!(config.cache.version, "v1");
    assert!(config.routes.api_prefixes.contains(&"/api/".to_string()));
    assert!(config.routes.static_extensions.contains("woff2"));
    assert_eq!(config.sync.tag, "background-sync");
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "app_name: shop\norigin: https://shop.example/\ncache:\n  version: v7\nroutes:\n  static_extensions: [\".CSS\", js]\n"
    )
    .unwrap();

    let config = Config::load_from_path(file.path()).unwrap();
    assert_eq!(config.app_name, "shop");
    assert_eq!(config.origin.as_str(), "https://shop.example/");
    assert_eq!(config.cache.version, "v7");
    assert_eq!(config.cache.static_prefix, "static");
    assert!(config.routes.static_extensions.contains("css"));
    assert!(!config.routes.static_extensions.contains("png"));
    assert_eq!(config.sync.tag, "background-sync");
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }

  #[test]
  fn test_data_dir_override() {
    let config = Config {
      data_dir: Some(PathBuf::from("/tmp/swgate-test")),
      ..Config::default()
    };
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/swgate-test"));
  }
}
