//! Experiment tracking and model registry clients
//!
//! The pipeline and the resolver only talk to [`ModelRegistry`]. Two backends
//! are provided:
//! - [`FileRegistry`]: embedded store under a local directory (`file://...`)
//! - [`MlflowRegistry`]: REST client for an MLflow-compatible tracking server

mod file;
mod mlflow;

pub use file::FileRegistry;
pub use mlflow::MlflowRegistry;

use crate::config::RegistryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Service could not be reached or answered with a server error
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("registry storage error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry payload error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid registry endpoint '{0}'")]
    InvalidEndpoint(String),
}

/// Terminal state of a tracking run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// Tracking run created for one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub run_name: String,
}

/// One version of a registered model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModelVersion {
    pub name: String,
    /// Assigned by the registry, monotonically increasing per name
    pub version: u64,
    pub run_id: String,
    /// Artifact path inside the source run
    pub artifact_path: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl RegisteredModelVersion {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Remote store for tracking runs and registered model versions
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Experiment id for `name`, created if missing
    async fn ensure_experiment(&self, name: &str) -> Result<String, RegistryError>;

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo, RegistryError>;

    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<(), RegistryError>;

    async fn log_metrics(&self, run_id: &str, metrics: &[(String, f64)]) -> Result<(), RegistryError>;

    /// Store `bytes` as `<artifact_path>/<file_name>` in the run's artifact store
    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(), RegistryError>;

    async fn download_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        file_name: &str,
    ) -> Result<Vec<u8>, RegistryError>;

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<(), RegistryError>;

    /// Register the run's artifact as a new version of `name`
    async fn register_version(
        &self,
        name: &str,
        run_id: &str,
        artifact_path: &str,
    ) -> Result<RegisteredModelVersion, RegistryError>;

    async fn set_version_tag(&self, name: &str, version: u64, key: &str, value: &str) -> Result<(), RegistryError>;

    async fn delete_version(&self, name: &str, version: u64) -> Result<(), RegistryError>;

    /// All versions of `name`, in no particular order
    async fn list_versions(&self, name: &str) -> Result<Vec<RegisteredModelVersion>, RegistryError>;

    /// Versions of `name` whose tag `key` equals `value`
    async fn search_versions_by_tag(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<RegisteredModelVersion>, RegistryError> {
        Ok(self
            .list_versions(name)
            .await?
            .into_iter()
            .filter(|v| v.tag(key) == Some(value))
            .collect())
    }
}

/// Build the backend named by `config.endpoint`
pub fn connect(config: &RegistryConfig) -> Result<Arc<dyn ModelRegistry>, RegistryError> {
    let endpoint = config.endpoint.trim();
    if let Some(dir) = endpoint.strip_prefix("file://") {
        if dir.is_empty() {
            return Err(RegistryError::InvalidEndpoint(endpoint.to_string()));
        }
        return Ok(Arc::new(FileRegistry::open(dir)?));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(Arc::new(MlflowRegistry::new(endpoint, config.timeout_secs)?));
    }
    Err(RegistryError::InvalidEndpoint(endpoint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_connect_selects_backend() {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig {
            endpoint: format!("file://{}", dir.path().join("mlruns").display()),
            ..Default::default()
        };
        assert!(connect(&config).is_ok());

        let config = RegistryConfig {
            endpoint: "http://localhost:5000".to_string(),
            ..Default::default()
        };
        assert!(connect(&config).is_ok());
    }

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        for endpoint in ["ftp://host", "file://", "mlruns"] {
            let config = RegistryConfig {
                endpoint: endpoint.to_string(),
                ..Default::default()
            };
            assert!(matches!(connect(&config), Err(RegistryError::InvalidEndpoint(_))));
        }
    }

    #[test]
    fn test_run_status_wire_format() {
        assert_eq!(serde_json::to_string(&RunStatus::Failed).unwrap(), "\"FAILED\"");
        assert_eq!(RunStatus::Finished.as_str(), "FINISHED");
    }
}
