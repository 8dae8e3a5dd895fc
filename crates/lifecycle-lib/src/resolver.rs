//! Startup model resolution
//!
//! ```text
//! REGISTRY_LOOKUP ──ok──────────────────────────► SUCCESS
//!        │ any registry error / no tagged version
//!        ▼
//! FILESYSTEM_FALLBACK ──loadable snapshot──────► SUCCESS
//!        │ no root / nothing loadable
//!        ▼
//!      FATAL
//! ```
//! Resolution runs once per process; a newly promoted version is picked up
//! by restarting the server.

use crate::artifact::{self, ModelArtifact, MODEL_FILE};
use crate::config::RegistryConfig;
use crate::observability::StructuredLogger;
use crate::registry::{ModelRegistry, RegistryError};
use crate::snapshot;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolver state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    RegistryLookup,
    FilesystemFallback,
    Success,
    Fatal,
}

/// Where the served model came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Registry { name: String, version: u64, run_id: String },
    Snapshot { path: PathBuf },
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Registry { name, version, .. } => write!(f, "registry:{}/{}", name, version),
            ModelSource::Snapshot { path } => write!(f, "snapshot:{}", path.display()),
        }
    }
}

/// Deserialized model ready for inference, shared read-only by all requests
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub artifact: ModelArtifact,
    pub source: ModelSource,
}

/// Neither the registry nor the snapshot directory produced a model
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no model available (registry: {registry}; snapshots: {fallback})")]
    Unresolvable { registry: String, fallback: String },
}

pub struct ModelResolver {
    registry: Option<Arc<dyn ModelRegistry>>,
    config: RegistryConfig,
    snapshot_root: PathBuf,
    logger: StructuredLogger,
}

impl ModelResolver {
    /// `registry` is `None` when the client could not even be constructed
    pub fn new(
        registry: Option<Arc<dyn ModelRegistry>>,
        config: RegistryConfig,
        snapshot_root: impl Into<PathBuf>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            registry,
            config,
            snapshot_root: snapshot_root.into(),
            logger,
        }
    }

    pub async fn resolve_active_model(&self) -> Result<LoadedModel, ResolveError> {
        let mut state = ResolverState::RegistryLookup;
        debug!(state = ?state, "Resolving active model");

        let registry_error = match self.lookup_registry().await {
            Ok(model) => {
                state = ResolverState::Success;
                debug!(state = ?state, source = %model.source, "Model resolved");
                self.logger
                    .log_model_resolved(&model.source.to_string(), &model.artifact.model_type, false);
                return Ok(model);
            }
            Err(e) => e,
        };

        state = ResolverState::FilesystemFallback;
        warn!(state = ?state, error = %registry_error, "Registry lookup failed, falling back to snapshots");

        match self.load_newest_snapshot() {
            Ok(model) => {
                state = ResolverState::Success;
                debug!(state = ?state, source = %model.source, "Model resolved");
                self.logger
                    .log_model_resolved(&model.source.to_string(), &model.artifact.model_type, true);
                Ok(model)
            }
            Err(fallback_error) => {
                state = ResolverState::Fatal;
                warn!(state = ?state, error = %fallback_error, "No usable model");
                Err(ResolveError::Unresolvable {
                    registry: registry_error.to_string(),
                    fallback: fallback_error,
                })
            }
        }
    }

    async fn lookup_registry(&self) -> Result<LoadedModel, RegistryError> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| RegistryError::Unavailable("no registry client".to_string()))?;

        let mut tagged = registry
            .search_versions_by_tag(&self.config.model_name, &self.config.stage_key, &self.config.active_stage)
            .await?;
        // Highest version first, so a non-exclusive registry still resolves deterministically
        tagged.sort_by(|a, b| b.version.cmp(&a.version));

        let chosen = tagged.into_iter().next().ok_or_else(|| {
            RegistryError::NotFound(format!(
                "no version of {} tagged {}={}",
                self.config.model_name, self.config.stage_key, self.config.active_stage
            ))
        })?;

        let bytes = registry
            .download_artifact(&chosen.run_id, &chosen.artifact_path, MODEL_FILE)
            .await?;
        let artifact = ModelArtifact::from_bytes(&bytes).map_err(|e| RegistryError::Rejected {
            status: 200,
            message: format!("version {} artifact unreadable: {}", chosen.version, e),
        })?;

        Ok(LoadedModel {
            artifact,
            source: ModelSource::Registry {
                name: chosen.name,
                version: chosen.version,
                run_id: chosen.run_id,
            },
        })
    }

    fn load_newest_snapshot(&self) -> Result<LoadedModel, String> {
        if !self.snapshot_root.is_dir() {
            return Err(format!("snapshot root {} does not exist", self.snapshot_root.display()));
        }

        let entries = snapshot::list(&self.snapshot_root)
            .map_err(|e| format!("failed to scan {}: {}", self.snapshot_root.display(), e))?;

        for entry in entries {
            match artifact::read_dir(&entry.path) {
                Ok(artifact) => {
                    return Ok(LoadedModel {
                        artifact,
                        source: ModelSource::Snapshot { path: entry.path },
                    })
                }
                Err(e) => warn!(path = %entry.path.display(), error = %e, "Skipping unloadable snapshot"),
            }
        }

        Err(format!("no loadable snapshot under {}", self.snapshot_root.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::fitted_artifact;
    use crate::registry::{FileRegistry, MlflowRegistry};
    use chrono::{Duration, Local};
    use tempfile::TempDir;

    async fn publish(registry: &FileRegistry, model_type: &str, stage: Option<&str>) -> u64 {
        let experiment = registry.ensure_experiment("exp").await.unwrap();
        let run = registry.create_run(&experiment, model_type).await.unwrap();
        let (mut artifact, _) = fitted_artifact();
        artifact.model_type = model_type.to_string();
        registry
            .log_artifact(&run.run_id, "model", MODEL_FILE, &artifact.to_bytes().unwrap())
            .await
            .unwrap();
        let version = registry.register_version("IrisBestModel", &run.run_id, "model").await.unwrap();
        if let Some(stage) = stage {
            registry
                .set_version_tag("IrisBestModel", version.version, "stage", stage)
                .await
                .unwrap();
        }
        version.version
    }

    fn resolver(registry: Option<Arc<dyn ModelRegistry>>, root: PathBuf) -> ModelResolver {
        ModelResolver::new(registry, RegistryConfig::default(), root, StructuredLogger::new("test"))
    }

    #[tokio::test]
    async fn test_registry_tagged_version_is_loaded() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(FileRegistry::open(dir.path().join("mlruns")).unwrap());
        publish(&registry, "LogisticRegression", Some("Production")).await;

        let model = resolver(Some(registry as Arc<dyn ModelRegistry>), dir.path().join("saved_models"))
            .resolve_active_model()
            .await
            .unwrap();

        assert!(matches!(model.source, ModelSource::Registry { version: 1, .. }));
        assert_eq!(model.artifact.model_type, "LogisticRegression");
    }

    #[tokio::test]
    async fn test_highest_tagged_version_wins() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(FileRegistry::open(dir.path().join("mlruns")).unwrap());
        publish(&registry, "LogisticRegression", Some("Production")).await;
        publish(&registry, "RandomForest", Some("Production")).await;
        publish(&registry, "LogisticRegression", None).await;

        let model = resolver(Some(registry as Arc<dyn ModelRegistry>), dir.path().join("saved_models"))
            .resolve_active_model()
            .await
            .unwrap();

        assert!(matches!(model.source, ModelSource::Registry { version: 2, .. }));
        assert_eq!(model.artifact.model_type, "RandomForest");
    }

    #[tokio::test]
    async fn test_unreachable_registry_falls_back_to_snapshot() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("saved_models");
        let (artifact, example) = fitted_artifact();
        let written = snapshot::write(&root, &artifact, &example, Local::now()).unwrap();

        let unreachable: Arc<dyn ModelRegistry> = Arc::new(MlflowRegistry::new("http://127.0.0.1:1", 2).unwrap());
        let model = resolver(Some(unreachable), root).resolve_active_model().await.unwrap();

        assert_eq!(model.source, ModelSource::Snapshot { path: written });
    }

    #[tokio::test]
    async fn test_untagged_registry_falls_back() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(FileRegistry::open(dir.path().join("mlruns")).unwrap());
        publish(&registry, "LogisticRegression", Some("Archived")).await;

        let root = dir.path().join("saved_models");
        let (artifact, example) = fitted_artifact();
        snapshot::write(&root, &artifact, &example, Local::now()).unwrap();

        let model = resolver(Some(registry as Arc<dyn ModelRegistry>), root).resolve_active_model().await.unwrap();
        assert!(matches!(model.source, ModelSource::Snapshot { .. }));
    }

    #[tokio::test]
    async fn test_newest_loadable_snapshot_wins() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("saved_models");
        let (artifact, example) = fitted_artifact();

        let good = snapshot::write(&root, &artifact, &example, Local::now()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let broken = snapshot::write(&root, &artifact, &example, Local::now() + Duration::seconds(5)).unwrap();
        std::fs::write(broken.join(MODEL_FILE), b"corrupt").unwrap();

        let model = resolver(None, root).resolve_active_model().await.unwrap();
        assert_eq!(model.source, ModelSource::Snapshot { path: good });
    }

    #[tokio::test]
    async fn test_snapshot_with_mismatched_classes_is_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("saved_models");
        let (artifact, example) = fitted_artifact();

        let good = snapshot::write(&root, &artifact, &example, Local::now()).unwrap();
        let bad = snapshot::write(&root, &artifact, &example, Local::now() + Duration::seconds(5)).unwrap();
        let mut doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(bad.join(MODEL_FILE)).unwrap()).unwrap();
        doc["classifier"]["classes"].as_array_mut().unwrap().pop();
        std::fs::write(bad.join(MODEL_FILE), serde_json::to_vec(&doc).unwrap()).unwrap();

        let model = resolver(None, root).resolve_active_model().await.unwrap();
        assert_eq!(model.source, ModelSource::Snapshot { path: good });
    }

    #[tokio::test]
    async fn test_nothing_available_is_fatal() {
        let dir = TempDir::new().unwrap();
        let result = resolver(None, dir.path().join("saved_models")).resolve_active_model().await;
        assert!(matches!(result, Err(ResolveError::Unresolvable { .. })));
    }

    #[tokio::test]
    async fn test_empty_snapshot_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("saved_models");
        std::fs::create_dir_all(root.join("RandomForest_20240101_000000")).unwrap();

        let result = resolver(None, root).resolve_active_model().await;
        assert!(matches!(result, Err(ResolveError::Unresolvable { .. })));
    }

    #[test]
    fn test_source_display() {
        let source = ModelSource::Registry {
            name: "IrisBestModel".to_string(),
            version: 4,
            run_id: "r".to_string(),
        };
        assert_eq!(source.to_string(), "registry:IrisBestModel/4");
    }
}
