//! Pipeline configuration
//!
//! Every component receives the parts of [`LifecycleConfig`] it needs at
//! construction time. Values come from an optional config file followed by
//! `LIFECYCLE__*` environment overrides; anything unset falls back to the
//! defaults below.

use crate::classifier::ModelSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides (`LIFECYCLE__REGISTRY__ENDPOINT`, ...)
pub const ENV_PREFIX: &str = "LIFECYCLE";

/// Default config file stem, resolved as `lifecycle.toml`, `lifecycle.yaml`, ...
pub const DEFAULT_CONFIG_FILE: &str = "lifecycle";

/// Metric used to rank candidates against each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMetric {
    #[default]
    Accuracy,
    WeightedF1,
}

impl SelectionMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMetric::Accuracy => "accuracy",
            SelectionMetric::WeightedF1 => "weighted_f1",
        }
    }
}

/// When the dataset digest is written back to the hash store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashCommitPolicy {
    /// Persist as soon as a change is detected. A failed retrain consumes the change.
    #[default]
    Eager,
    /// Persist only after the new model has been promoted.
    OnSuccess,
}

/// Tracking and registry service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// `file://<dir>` for the embedded registry, `http(s)://...` for an MLflow server
    pub endpoint: String,
    /// Experiment that candidate runs are recorded under
    pub experiment_name: String,
    /// Logical name every promoted version is registered under
    pub model_name: String,
    /// Version tag key carrying the stage
    pub stage_key: String,
    /// Stage value marking the servable version
    pub active_stage: String,
    /// Stage value written to versions demoted by a newer promotion
    pub archived_stage: String,
    /// Keep at most one version carrying `active_stage`
    pub exclusive_stage: bool,
    /// Request timeout for remote registries
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: "file://mlruns".to_string(),
            experiment_name: "iris_classification".to_string(),
            model_name: "IrisBestModel".to_string(),
            stage_key: "stage".to_string(),
            active_stage: "Production".to_string(),
            archived_stage: "Archived".to_string(),
            exclusive_stage: true,
            timeout_secs: 30,
        }
    }
}

/// Configuration for the retraining pipeline and model resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Flat CSV dataset with a header row
    pub dataset_path: PathBuf,
    /// File holding the hex digest from the previous run
    pub hash_store_path: PathBuf,
    /// Column holding the class label; every other column is a feature
    pub label_column: String,
    /// Shell command producing `dataset_path` when it is missing
    pub data_load_command: Option<String>,
    /// Fraction of rows held out for evaluation
    pub test_fraction: f64,
    /// Seed for the train/test shuffle
    pub split_seed: u64,
    /// Candidate models trained every cycle, in order
    pub roster: Vec<ModelSpec>,
    pub selection_metric: SelectionMetric,
    pub hash_commit: HashCommitPolicy,
    /// Root directory of local `<model_type>_<timestamp>` snapshots
    pub snapshot_root: PathBuf,
    pub registry: RegistryConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("data/raw/iris.csv"),
            hash_store_path: PathBuf::from("data/last_hash.txt"),
            label_column: "species".to_string(),
            data_load_command: None,
            test_fraction: 0.2,
            split_seed: 42,
            roster: ModelSpec::default_roster(),
            selection_metric: SelectionMetric::default(),
            hash_commit: HashCommitPolicy::default(),
            snapshot_root: PathBuf::from("saved_models"),
            registry: RegistryConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Load from `path` (or `lifecycle.*` in the working directory) plus environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let settings = settings(path)?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            anyhow::bail!(
                "test_fraction must be in (0, 1), got {}",
                self.test_fraction
            );
        }
        if self.roster.is_empty() {
            anyhow::bail!("roster must name at least one model");
        }
        if self.registry.model_name.trim().is_empty() {
            anyhow::bail!("registry.model_name must not be empty");
        }
        if self.registry.timeout_secs == 0 {
            anyhow::bail!("registry.timeout_secs must be at least 1");
        }
        Ok(())
    }
}

/// Layered settings shared by the library and the binaries
pub fn settings(path: Option<&Path>) -> Result<config::Config, config::ConfigError> {
    let file = match path {
        Some(p) => config::File::from(p).required(true),
        None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    config::Config::builder()
        .add_source(file)
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_original_layout() {
        let config = LifecycleConfig::default();
        assert_eq!(config.dataset_path, PathBuf::from("data/raw/iris.csv"));
        assert_eq!(config.hash_store_path, PathBuf::from("data/last_hash.txt"));
        assert_eq!(config.registry.model_name, "IrisBestModel");
        assert_eq!(config.registry.active_stage, "Production");
        assert_eq!(config.roster.len(), 2);
        assert_eq!(config.selection_metric, SelectionMetric::Accuracy);
        assert_eq!(config.hash_commit, HashCommitPolicy::Eager);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_overrides_and_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lifecycle.toml");
        std::fs::write(
            &path,
            r#"
dataset_path = "input/data.csv"
selection_metric = "weighted_f1"
hash_commit = "on_success"

[registry]
endpoint = "http://localhost:5000"

[[roster]]
type = "random_forest"
n_estimators = 10
random_state = 7
"#,
        )
        .unwrap();

        let config = LifecycleConfig::load(Some(&path)).unwrap();
        assert_eq!(config.dataset_path, PathBuf::from("input/data.csv"));
        assert_eq!(config.selection_metric, SelectionMetric::WeightedF1);
        assert_eq!(config.hash_commit, HashCommitPolicy::OnSuccess);
        assert_eq!(config.registry.endpoint, "http://localhost:5000");
        assert_eq!(config.registry.model_name, "IrisBestModel");
        assert_eq!(config.roster.len(), 1);
        assert_eq!(config.roster[0].model_type(), "RandomForest");
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let config = LifecycleConfig {
            test_fraction: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = LifecycleConfig::default();
        config.registry.timeout_secs = 0;
        assert!(config.validate().is_err());

        config.registry.timeout_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_roster() {
        let config = LifecycleConfig {
            roster: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
