//! Configuration management.

use anyhow::{Context, Result};
use carcass_common::expand_data_dir;
use carcass_hypervisor::{BackendKind, HypervisorClient, HypervisorError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the configuration file, relative to `$HOME`.
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/carcass/config.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hypervisor connection
    pub hypervisor: HypervisorSettings,
    /// Image storage
    pub storage: StorageSettings,
    /// Machine control
    pub control: ControlSettings,
    /// Logging
    pub logging: LoggingSettings,
}

/// Hypervisor connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    pub backend: BackendKind,
    /// Connection URI
    pub uri: String,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Libvirt,
            uri: "qemu:///system".to_string(),
        }
    }
}

/// Image storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Storage pool receiving the images
    pub pool: String,
    /// Local data directory, holds the image provenance file
    pub data_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            pool: "default".to_string(),
            data_dir: "~/.local/share/carcass".to_string(),
        }
    }
}

/// Machine control settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// Send shutdown requests to inactive machines too
    pub force_stop: bool,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Values given on the command line, they take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub connect: Option<String>,
    pub data_dir: Option<String>,
    pub storage_pool: Option<String>,
    pub log_level: Option<String>,
    pub force_stop: bool,
    pub dev: bool,
}

impl Settings {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load the given file, or the default file when it exists, or fall back
    /// to the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                // no resolvable home means no default file
                match expand_data_dir(DEFAULT_CONFIG_PATH) {
                    Ok(default) if default.exists() => Self::load(default),
                    _ => Ok(Self::default()),
                }
            }
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(ref uri) = overrides.connect {
            self.hypervisor.uri = uri.clone();
        }

        if let Some(ref dir) = overrides.data_dir {
            self.storage.data_dir = dir.clone();
        }

        if let Some(ref pool) = overrides.storage_pool {
            self.storage.pool = pool.clone();
        }

        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }

        if overrides.force_stop {
            self.control.force_stop = true;
        }

        if overrides.dev {
            self.hypervisor.backend = BackendKind::Mock;
        }

        self
    }

    /// Data directory with `~` and `~user` expanded.
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_data_dir(&self.storage.data_dir)
    }

    /// Connect to the configured hypervisor.
    pub async fn connect(&self) -> std::result::Result<HypervisorClient, HypervisorError> {
        HypervisorClient::connect(self.hypervisor.backend, &self.hypervisor.uri).await
    }
}
