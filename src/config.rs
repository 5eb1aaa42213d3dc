use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::offline::OfflineConfig;
use crate::queue::QueueConfig;
use crate::retry::RetryPolicy;

/// Environment variable consulted when the config file has no API key.
pub const API_KEY_ENV: &str = "TETHER_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub circuit_breaker: CircuitBreakerConfig,
  #[serde(default)]
  pub retry: RetryPolicy,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
  Firebase,
  /// Sends the key both as `apikey` and as a bearer token
  Supabase,
  Rest,
  /// Nothing configured; every request fails fast
  #[default]
  None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  pub provider: Provider,
  pub base_url: String,
  pub api_key: Option<String>,
  #[serde(with = "crate::serde_millis", rename = "timeout_ms")]
  pub timeout: Duration,
  /// Extra headers sent with every request
  pub headers: BTreeMap<String, String>,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      provider: Provider::None,
      base_url: String::new(),
      api_key: None,
      timeout: Duration::from_secs(30),
      headers: BTreeMap::new(),
    }
  }
}

impl BackendConfig {
  /// A backend is usable only with a provider and a base URL.
  pub fn is_configured(&self) -> bool {
    self.provider != Provider::None && !self.base_url.trim().is_empty()
  }

  /// Headers for every request, derived from the provider and the key.
  pub fn headers(&self) -> Vec<(String, String)> {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

    if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
      match self.provider {
        Provider::Supabase => {
          headers.push(("apikey".to_string(), key.to_string()));
          headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
        }
        Provider::Firebase | Provider::Rest => {
          headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
        }
        Provider::None => {}
      }
    }

    headers
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  pub max_size: usize,
  #[serde(with = "crate::serde_millis", rename = "ttl_ms")]
  pub ttl: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size: 100,
      ttl: Duration::from_secs(5 * 60),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tether.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tether/config.yaml
  ///
  /// Without any file the defaults apply, which leave the backend
  /// unconfigured.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        tracing::info!("no config file found, using defaults");
        Config::default()
      }
    };
    config.apply_env(std::env::var(API_KEY_ENV).ok());

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tether.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tether").join("config.yaml");
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
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Fill the API key from the environment when the file has none.
  fn apply_env(&mut self, api_key: Option<String>) {
    if self.backend.api_key.is_none() {
      self.backend.api_key = api_key.filter(|k| !k.is_empty());
    }
  }

  /// Copy safe to print: secrets replaced.
  pub fn redacted(&self) -> Self {
    let mut config = self.clone();
    if config.backend.api_key.is_some() {
      config.backend.api_key = Some("<redacted>".to_string());
    }
    for (name, value) in config.backend.headers.iter_mut() {
      if name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case("apikey") {
        *value = "<redacted>".to_string();
      }
    }
    config
  }
}
