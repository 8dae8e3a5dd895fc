//! Server configuration

use anyhow::{Context, Result};
use lifecycle_lib::config::{settings, LifecycleConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Listener and audit sink settings, read from the `server` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the prediction API
    pub port: u16,

    /// Port for the Prometheus exporter
    pub metrics_port: u16,

    /// CSV prediction log
    pub audit_log_path: PathBuf,

    /// SQLite prediction store
    pub audit_db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            metrics_port: 9100,
            audit_log_path: PathBuf::from("logs/predictions.csv"),
            audit_db_path: PathBuf::from("logs/predictions.db"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    #[serde(default)]
    server: ServerConfig,
}

/// Lifecycle settings plus the server section
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub lifecycle: LifecycleConfig,
    pub server: ServerConfig,
}

impl ServerSettings {
    /// Load from `path` (or `lifecycle.*` in the working directory) and `LIFECYCLE__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let layered = settings(path).context("Failed to read configuration")?;

        let lifecycle: LifecycleConfig = layered
            .clone()
            .try_deserialize()
            .context("Invalid lifecycle configuration")?;
        lifecycle.validate()?;

        let section: ServerSection = layered
            .try_deserialize()
            .context("Invalid server configuration")?;

        Ok(Self {
            lifecycle,
            server: section.server,
        })
    }
}
