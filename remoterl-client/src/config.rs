//! Local client configuration.
//!
//! Default parameters (relay URL, region, role defaults, optionally the API
//! key) persisted as TOML under the user's config directory. `clear` deletes
//! the file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Environment variable consulted when no API key is passed explicitly.
pub const API_KEY_ENV: &str = "REMOTERL_API_KEY";

const DEFAULT_RELAY_URL: &str = "wss://relay.remoterl.com/ws";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub trainer: TrainerDefaults,
    #[serde(default)]
    pub simulator: SimulatorDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerDefaults {
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,
    #[serde(default = "default_num_env_runners")]
    pub num_env_runners: u32,
    #[serde(default)]
    pub framework: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorDefaults {
    #[serde(default = "default_max_env_runners")]
    pub max_env_runners: u32,
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}
fn default_num_workers() -> u32 {
    1
}
fn default_num_env_runners() -> u32 {
    2
}
fn default_max_env_runners() -> u32 {
    32
}

impl Default for TrainerDefaults {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            num_env_runners: default_num_env_runners(),
            framework: None,
        }
    }
}

impl Default for SimulatorDefaults {
    fn default() -> Self {
        Self {
            max_env_runners: default_max_env_runners(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            relay_url: default_relay_url(),
            region: None,
            trainer: TrainerDefaults::default(),
            simulator: SimulatorDefaults::default(),
        }
    }
}

impl LocalConfig {
    /// `<config dir>/remoterl/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("remoterl").join("config.toml"))
            .ok_or_else(|| ClientError::Config("no user config directory".to_string()))
    }

    /// Load from the default path. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        fs::write(path, text)?;
        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Delete the config file. Returns whether one existed.
    pub fn clear() -> Result<bool> {
        Self::clear_at(&Self::default_path()?)
    }

    pub fn clear_at(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Pick the API key: explicit argument, then `REMOTERL_API_KEY`, then the
/// local config.
pub fn resolve_api_key(explicit: Option<&str>, config: &LocalConfig) -> Result<String> {
    let from_env = std::env::var(API_KEY_ENV).ok();
    [explicit.map(str::to_string), from_env, config.api_key.clone()]
        .into_iter()
        .flatten()
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
        .ok_or(ClientError::MissingApiKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = LocalConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, LocalConfig::default());
        assert_eq!(config.trainer.num_env_runners, 2);
    }

    #[test]
    fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = LocalConfig::default();
        config.region = Some("eu-west".to_string());
        config.trainer.num_workers = 4;
        config.save_to(&path).unwrap();

        let loaded = LocalConfig::load_from(&path).unwrap();
        assert_eq!(loaded.region.as_deref(), Some("eu-west"));
        assert_eq!(loaded.trainer.num_workers, 4);

        assert!(LocalConfig::clear_at(&path).unwrap());
        assert!(!path.exists());
        assert!(!LocalConfig::clear_at(&path).unwrap());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "region = \"us-east\"\n[simulator]\nmax_env_runners = 8\n").unwrap();

        let config = LocalConfig::load_from(&path).unwrap();
        assert_eq!(config.region.as_deref(), Some("us-east"));
        assert_eq!(config.simulator.max_env_runners, 8);
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "region = [").unwrap();
        assert!(matches!(LocalConfig::load_from(&path), Err(ClientError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_explicit_key_wins() {
        std::env::set_var(API_KEY_ENV, "from-env");
        let config = LocalConfig {
            api_key: Some("from-file".to_string()),
            ..LocalConfig::default()
        };
        assert_eq!(resolve_api_key(Some("explicit"), &config).unwrap(), "explicit");
        std::env::remove_var(API_KEY_ENV);
    }

    #[test]
    #[serial]
    fn test_env_before_file() {
        std::env::set_var(API_KEY_ENV, "from-env");
        let config = LocalConfig {
            api_key: Some("from-file".to_string()),
            ..LocalConfig::default()
        };
        assert_eq!(resolve_api_key(None, &config).unwrap(), "from-env");

        std::env::remove_var(API_KEY_ENV);
        assert_eq!(resolve_api_key(None, &config).unwrap(), "from-file");
    }

    #[test]
    #[serial]
    fn test_no_key_anywhere() {
        std::env::remove_var(API_KEY_ENV);
        assert!(matches!(
            resolve_api_key(Some("  "), &LocalConfig::default()),
            Err(ClientError::MissingApiKey)
        ));
    }
}
