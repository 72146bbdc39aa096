use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::SqliteStore;
use crate::generation::GenerationId;
use crate::http::resolve;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL that preload paths and requests are resolved against
  pub origin: Url,
  /// Name of the current cache generation
  #[serde(default = "default_cache_name")]
  pub cache_name: String,
  /// Paths that must be cached before install succeeds
  #[serde(default = "default_preload")]
  pub preload: Vec<String>,
  /// Document served for offline navigations
  #[serde(default = "default_fallback")]
  pub fallback: String,
  /// Body of the synthesized 408 response
  #[serde(default = "default_offline_message")]
  pub offline_message: String,
  /// Activate right after install instead of waiting for clients to close
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  /// SQLite database path (defaults to the user data directory)
  pub store: Option<PathBuf>,
  #[serde(default)]
  pub notifications: NotificationConfig,
  #[serde(default)]
  pub log: LogConfig,
}

fn default_cache_name() -> String {
  "offcache-v1".to_string()
}

fn default_preload() -> Vec<String> {
  vec!["./".to_string(), "./index.html".to_string()]
}

fn default_fallback() -> String {
  "./index.html".to_string()
}

fn default_offline_message() -> String {
  "You are offline.".to_string()
}

fn default_true() -> bool {
  true
}

/// Defaults for notifications built from push messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub tag: Option<String>,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "offcache".to_string(),
      body: "You have a new notification.".to_string(),
      icon: Some("./icons/icon-192x192.png".to_string()),
      badge: Some("./icons/badge-72x72.png".to_string()),
      tag: Some("offcache-notification".to_string()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter used when RUST_LOG is not set
  pub level: String,
  /// Also write logs to this file
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    self.preload_urls()?;
    self.fallback_url()?;
    Ok(())
  }

  pub fn generation(&self) -> GenerationId {
    GenerationId::new(self.cache_name.clone())
  }

  /// Preload paths resolved against the origin, in manifest order.
  pub fn preload_urls(&self) -> Result<Vec<Url>> {
    self
      .preload
      .iter()
      .map(|p| self.resolve(p))
      .collect()
  }

  pub fn fallback_url(&self) -> Result<Url> {
    self.resolve(&self.fallback)
  }

  pub fn resolve(&self, path: &str) -> Result<Url> {
    resolve(&self.origin, path).map_err(|e| eyre!("{}", e))
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.store {
      Some(path) => Ok(path.clone()),
      None => SqliteStore::default_path().ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }
}
