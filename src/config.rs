//! Store configuration, loadable from TOML.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How action names are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingMode {
    /// `Owner.key`, readable in logs and devtools.
    #[default]
    Development,
    /// `Owner.#N`, independent of declared keys.
    Production,
}

/// Root configuration container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub naming: NamingMode,
    #[serde(default)]
    pub persist: Option<PersistSettings>,
}

fn default_debounce_ms() -> u64 {
    50
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistSettings {
    /// Storage key holding the blob.
    pub key: String,
    /// Version stamp; a stored blob with another version is discarded.
    pub version: u32,
    /// Blob alias -> slice name.
    #[serde(default)]
    pub allowlist: BTreeMap<String, String>,
    /// Write-back debounce window.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Directory for `FileStorage`. Defaults to the platform data dir.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl PersistSettings {
    pub fn new(key: impl Into<String>, version: u32) -> Self {
        Self {
            key: key.into(),
            version,
            allowlist: BTreeMap::new(),
            debounce_ms: default_debounce_ms(),
            directory: None,
        }
    }

    /// Allow-list a slice under `alias`.
    pub fn allow(mut self, alias: impl Into<String>, slice: impl Into<String>) -> Self {
        self.allowlist.insert(alias.into(), slice.into());
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Directory used by `FileStorage` when none is configured.
    pub fn storage_dir(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("reslice")
        })
    }

    /// Validates the persistence section.
    ///
    /// Checks:
    /// - The storage key is not empty
    /// - No slice is allow-listed under two aliases
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "persist.key must not be empty".to_string(),
            });
        }
        if self.allowlist.contains_key(crate::persist::PERSIST_FIELD) {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "'{}' is reserved and cannot be used as an alias",
                    crate::persist::PERSIST_FIELD
                ),
            });
        }
        let mut seen = HashSet::new();
        for (alias, slice) in &self.allowlist {
            if !seen.insert(slice) {
                return Err(ConfigError::ValidationError {
                    message: format!(
                        "Slice '{}' is allow-listed more than once (alias '{}')",
                        slice, alias
                    ),
                });
            }
        }
        Ok(())
    }
}

impl StoreConfig {
    /// Returns the path to the configuration file.
    ///
    /// Uses `~/.config/reslice/config.toml` on Unix/macOS, or the equivalent
    /// via `dirs::config_dir()`. Falls back to the current directory.
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("reslice").join("config.toml")
    }

    /// Loads configuration from the default config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from `path`.
    ///
    /// - If the file doesn't exist, returns `StoreConfig::default()`.
    /// - Otherwise parses it as TOML and validates.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(StoreConfig::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: StoreConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.persist {
            Some(persist) => persist.validate(),
            None => Ok(()),
        }
    }
}
