use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::http::Request;

/// Version tag of the cache store. Bump it to invalidate every previously cached asset.
pub const DEFAULT_CACHE_NAME: &str = "nexus-store-v1";

pub const DEFAULT_ORIGIN: &str = "http://localhost:3000";

/// Assets pre-cached at install time: the app shell plus the CDN libraries it loads.
pub const DEFAULT_MANIFEST: &[&str] = &[
  "/",
  "/index.html",
  "/manifest.json",
  "/icon.jpg",
  "https://unpkg.com/vue@3/dist/vue.global.js",
  "https://cdn.tailwindcss.com",
  "https://cdn.jsdelivr.net/npm/axios/dist/axios.min.js",
  "https://cdn.jsdelivr.net/npm/remixicon@3.5.0/fonts/remixicon.css",
  "https://cdn.jsdelivr.net/npm/sweetalert2@11",
  "https://cdn.socket.io/4.7.2/socket.io.min.js",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache_name: String,
  /// Origin that root-relative manifest entries and requests resolve against
  pub origin: String,
  pub manifest: Vec<String>,
  /// Cache database location (defaults to $XDG_DATA_HOME/offline-agent/caches.db)
  pub database: Option<PathBuf>,
  /// Take over as soon as install finishes
  pub skip_waiting: bool,
  /// Take control of pages that are already open on activation
  pub claim_clients: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_name: DEFAULT_CACHE_NAME.to_string(),
      origin: DEFAULT_ORIGIN.to_string(),
      manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      database: None,
      skip_waiting: true,
      claim_clients: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-agent/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-agent").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;

    config.validate()?;
    Ok(config)
  }

  /// Check values that the YAML types alone cannot express.
  pub fn validate(&self) -> Result<()> {
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    self.origin_url()?;
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve the asset manifest into GET requests.
  pub fn manifest_requests(&self) -> Result<Vec<Request>> {
    let origin = self.origin_url()?;
    self
      .manifest
      .iter()
      .map(|entry| Request::resolve(Method::GET, &origin, entry))
      .collect()
  }

  /// Path of the cache database.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-agent").join("caches.db"))
  }
}
