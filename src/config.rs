use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::BusinessHours;
use crate::retry::RetryPolicy;

/// Synchronization settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Trigger a sync cycle when connectivity returns.
  pub sync_on_reconnect: bool,
  /// Trigger a sync cycle when the app returns to the foreground (and is
  /// online).
  pub sync_on_foreground: bool,
  /// Business-hours window used by the policy adjuster.
  pub business_hours: BusinessHoursConfig,
  /// Retry bounds for the reconnect sync cycle.
  pub reconnect_retry: RetryConfig,
  /// Fixed per-request timeout for the remote API, in milliseconds.
  pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      sync_on_reconnect: true,
      sync_on_foreground: true,
      business_hours: BusinessHoursConfig::default(),
      reconnect_retry: RetryConfig::default(),
      request_timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BusinessHoursConfig {
  /// Inclusive opening hour, local time (0-23).
  pub start_hour: u32,
  /// Exclusive closing hour, local time (0-23).
  pub end_hour: u32,
}

impl Default for BusinessHoursConfig {
  fn default() -> Self {
    Self { start_hour: 9, end_hour: 22 }
  }
}

impl From<BusinessHoursConfig> for BusinessHours {
  fn from(c: BusinessHoursConfig) -> Self {
    BusinessHours { start_hour: c.start_hour, end_hour: c.end_hour }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub cap_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self { max_attempts: 3, base_delay_ms: 1000, cap_ms: 30_000 }
  }
}

impl From<RetryConfig> for RetryPolicy {
  fn from(c: RetryConfig) -> Self {
    RetryPolicy {
      max_attempts: c.max_attempts,
      base_delay: Duration::from_millis(c.base_delay_ms),
      cap: Duration::from_millis(c.cap_ms),
    }
  }
}

impl SyncConfig {
  /// Load configuration from file, falling back to defaults when no file
  /// exists.
  ///
  /// Search order:
  /// 1. Explicit path if provided (an error if missing)
  /// 2. ./shiftsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shiftsync/config.yaml
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
    let local = PathBuf::from("shiftsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shiftsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: SyncConfig = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    if config.business_hours.start_hour >= config.business_hours.end_hour {
      return Err(eyre!(
        "Invalid business hours in {}: start ({}) must be before end ({})",
        path.display(),
        config.business_hours.start_hour,
        config.business_hours.end_hour
      ));
    }

    Ok(config)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_sensible() {
    let config = SyncConfig::default();
    assert!(config.sync_on_reconnect);
    assert!(config.sync_on_foreground);
    assert_eq!(config.business_hours.start_hour, 9);
    assert_eq!(config.business_hours.end_hour, 22);
    assert_eq!(config.reconnect_retry.max_attempts, 3);
    assert_eq!(config.request_timeout(), Duration::from_secs(10));
  }

  #[test]
  fn partial_yaml_fills_in_defaults() {
    let config: SyncConfig =
      serde_yaml::from_str("sync_on_foreground: false\nbusiness_hours:\n  start_hour: 8\n").unwrap();

    assert!(config.sync_on_reconnect);
    assert!(!config.sync_on_foreground);
    assert_eq!(config.business_hours.start_hour, 8);
    assert_eq!(config.business_hours.end_hour, 22);
  }

  #[test]
  fn missing_explicit_path_is_an_error() {
    assert!(SyncConfig::load(Some(Path::new("/nonexistent/shiftsync.yaml"))).is_err());
  }
}
