//! Embedded registry backed by a local directory
//!
//! Layout:
//! ```text
//! <root>/registry.json                          experiments, runs, model versions
//! <root>/artifacts/<run_id>/<artifact_path>/..  logged artifact files
//! ```
//! Every mutation rewrites `registry.json` through a temp file and rename.
//! The in-memory state only changes once that write has succeeded.

use super::{ModelRegistry, RegisteredModelVersion, RegistryError, RunInfo, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

const STATE_FILE: &str = "registry.json";
const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    /// Experiment name -> id
    experiments: BTreeMap<String, String>,
    runs: BTreeMap<String, RunRecord>,
    models: BTreeMap<String, ModelRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    info: RunInfo,
    status: RunStatus,
    params: BTreeMap<String, String>,
    metrics: BTreeMap<String, f64>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ModelRecord {
    /// Never reused, even after a version is deleted
    next_version: u64,
    versions: BTreeMap<u64, RegisteredModelVersion>,
}

/// Registry stored under a local directory
pub struct FileRegistry {
    root: PathBuf,
    state: Mutex<State>,
}

impl FileRegistry {
    /// Open (or create) a registry rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| RegistryError::Io {
            path: root.clone(),
            source,
        })?;

        let state_path = root.join(STATE_FILE);
        let state = if state_path.exists() {
            let bytes = fs::read(&state_path).map_err(|source| RegistryError::Io {
                path: state_path.clone(),
                source,
            })?;
            serde_json::from_slice(&bytes)?
        } else {
            State::default()
        };

        debug!(root = %root.display(), "Opened file registry");
        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn persist(&self, state: &State) -> Result<(), RegistryError> {
        let path = self.root.join(STATE_FILE);
        let temp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        fs::write(&temp_path, bytes).map_err(|source| RegistryError::Io {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &path).map_err(|source| RegistryError::Io { path, source })
    }

    /// Apply `change` to a copy of the state, persist it, then swap it in
    async fn update<T>(
        &self,
        change: impl FnOnce(&mut State) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let result = change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(result)
    }

    fn artifact_file(&self, run_id: &str, artifact_path: &str, file_name: &str) -> Result<PathBuf, RegistryError> {
        for part in [run_id, artifact_path, file_name] {
            let escapes = Path::new(part)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if part.is_empty() || escapes {
                return Err(RegistryError::Rejected {
                    status: 400,
                    message: format!("invalid artifact path component '{}'", part),
                });
            }
        }
        Ok(self
            .root
            .join(ARTIFACTS_DIR)
            .join(run_id)
            .join(artifact_path)
            .join(file_name))
    }
}

fn run_mut<'a>(state: &'a mut State, run_id: &str) -> Result<&'a mut RunRecord, RegistryError> {
    state
        .runs
        .get_mut(run_id)
        .ok_or_else(|| RegistryError::NotFound(format!("run {}", run_id)))
}

fn version_mut<'a>(
    state: &'a mut State,
    name: &str,
    version: u64,
) -> Result<&'a mut RegisteredModelVersion, RegistryError> {
    state
        .models
        .get_mut(name)
        .and_then(|m| m.versions.get_mut(&version))
        .ok_or_else(|| RegistryError::NotFound(format!("{} version {}", name, version)))
}

#[async_trait]
impl ModelRegistry for FileRegistry {
    async fn ensure_experiment(&self, name: &str) -> Result<String, RegistryError> {
        {
            let state = self.state.lock().await;
            if let Some(id) = state.experiments.get(name) {
                return Ok(id.clone());
            }
        }
        self.update(|state| {
            if let Some(id) = state.experiments.get(name) {
                return Ok(id.clone());
            }
            let id = state.experiments.len().to_string();
            state.experiments.insert(name.to_string(), id.clone());
            Ok(id)
        })
        .await
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo, RegistryError> {
        self.update(|state| {
            if !state.experiments.values().any(|id| id == experiment_id) {
                return Err(RegistryError::NotFound(format!("experiment {}", experiment_id)));
            }

            let info = RunInfo {
                run_id: uuid::Uuid::new_v4().simple().to_string(),
                experiment_id: experiment_id.to_string(),
                run_name: run_name.to_string(),
            };
            state.runs.insert(
                info.run_id.clone(),
                RunRecord {
                    info: info.clone(),
                    status: RunStatus::Running,
                    params: BTreeMap::new(),
                    metrics: BTreeMap::new(),
                    started_at: Utc::now(),
                    finished_at: None,
                },
            );
            Ok(info)
        })
        .await
    }

    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<(), RegistryError> {
        self.update(|state| {
            let run = run_mut(state, run_id)?;
            for (key, value) in params {
                run.params.insert(key.clone(), value.clone());
            }
            Ok(())
        })
        .await
    }

    async fn log_metrics(&self, run_id: &str, metrics: &[(String, f64)]) -> Result<(), RegistryError> {
        self.update(|state| {
            let run = run_mut(state, run_id)?;
            for (key, value) in metrics {
                run.metrics.insert(key.clone(), *value);
            }
            Ok(())
        })
        .await
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(), RegistryError> {
        let state = self.state.lock().await;
        if !state.runs.contains_key(run_id) {
            return Err(RegistryError::NotFound(format!("run {}", run_id)));
        }

        let path = self.artifact_file(run_id, artifact_path, file_name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, bytes).map_err(|source| RegistryError::Io { path, source })
    }

    async fn download_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        file_name: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let path = self.artifact_file(run_id, artifact_path, file_name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RegistryError::NotFound(format!(
                "artifact {}/{} in run {}",
                artifact_path, file_name, run_id
            ))),
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<(), RegistryError> {
        self.update(|state| {
            let run = run_mut(state, run_id)?;
            run.status = status;
            run.finished_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    async fn register_version(
        &self,
        name: &str,
        run_id: &str,
        artifact_path: &str,
    ) -> Result<RegisteredModelVersion, RegistryError> {
        self.update(|state| {
            if !state.runs.contains_key(run_id) {
                return Err(RegistryError::NotFound(format!("run {}", run_id)));
            }

            let model = state.models.entry(name.to_string()).or_default();
            model.next_version += 1;
            let version = RegisteredModelVersion {
                name: name.to_string(),
                version: model.next_version,
                run_id: run_id.to_string(),
                artifact_path: artifact_path.to_string(),
                tags: BTreeMap::new(),
                created_at: Utc::now(),
            };
            model.versions.insert(version.version, version.clone());
            Ok(version)
        })
        .await
    }

    async fn set_version_tag(&self, name: &str, version: u64, key: &str, value: &str) -> Result<(), RegistryError> {
        self.update(|state| {
            version_mut(state, name, version)?
                .tags
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }

    async fn delete_version(&self, name: &str, version: u64) -> Result<(), RegistryError> {
        self.update(|state| {
            let removed = state
                .models
                .get_mut(name)
                .and_then(|m| m.versions.remove(&version));
            match removed {
                Some(_) => Ok(()),
                None => Err(RegistryError::NotFound(format!("{} version {}", name, version))),
            }
        })
        .await
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<RegisteredModelVersion>, RegistryError> {
        let state = self.state.lock().await;
        Ok(state
            .models
            .get(name)
            .map(|m| m.versions.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn registry_with_run(dir: &TempDir) -> (FileRegistry, RunInfo) {
        let registry = FileRegistry::open(dir.path().join("mlruns")).unwrap();
        let experiment = registry.ensure_experiment("iris_classification").await.unwrap();
        let run = registry.create_run(&experiment, "RandomForest").await.unwrap();
        (registry, run)
    }

    #[tokio::test]
    async fn test_experiment_is_created_once() {
        let dir = TempDir::new().unwrap();
        let registry = FileRegistry::open(dir.path()).unwrap();
        let a = registry.ensure_experiment("exp").await.unwrap();
        let b = registry.ensure_experiment("exp").await.unwrap();
        let c = registry.ensure_experiment("other").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_versions_are_monotonic_and_never_reused() {
        let dir = TempDir::new().unwrap();
        let (registry, run) = registry_with_run(&dir).await;

        let v1 = registry.register_version("M", &run.run_id, "model").await.unwrap();
        let v2 = registry.register_version("M", &run.run_id, "model").await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        registry.delete_version("M", 2).await.unwrap();
        let v3 = registry.register_version("M", &run.run_id, "model").await.unwrap();
        assert_eq!(v3.version, 3);
        assert_eq!(registry.list_versions("M").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tag_search() {
        let dir = TempDir::new().unwrap();
        let (registry, run) = registry_with_run(&dir).await;
        registry.register_version("M", &run.run_id, "model").await.unwrap();
        registry.register_version("M", &run.run_id, "model").await.unwrap();
        registry.set_version_tag("M", 2, "stage", "Production").await.unwrap();

        let tagged = registry.search_versions_by_tag("M", "stage", "Production").await.unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].version, 2);
        assert!(registry.search_versions_by_tag("Other", "stage", "Production").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let (registry, run) = registry_with_run(&dir).await;
        registry.log_params(&run.run_id, &[("model_name".into(), "RandomForest".into())]).await.unwrap();
        registry.log_metrics(&run.run_id, &[("accuracy".into(), 0.9)]).await.unwrap();
        registry.register_version("M", &run.run_id, "model").await.unwrap();
        registry.set_version_tag("M", 1, "stage", "Production").await.unwrap();
        registry.finish_run(&run.run_id, RunStatus::Finished).await.unwrap();
        drop(registry);

        let reopened = FileRegistry::open(dir.path().join("mlruns")).unwrap();
        let versions = reopened.list_versions("M").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].tag("stage"), Some("Production"));
        let next = reopened.register_version("M", &run.run_id, "model").await.unwrap();
        assert_eq!(next.version, 2);
    }

    #[tokio::test]
    async fn test_artifact_roundtrip_and_missing() {
        let dir = TempDir::new().unwrap();
        let (registry, run) = registry_with_run(&dir).await;

        registry.log_artifact(&run.run_id, "model", "model.json", b"{}").await.unwrap();
        let bytes = registry.download_artifact(&run.run_id, "model", "model.json").await.unwrap();
        assert_eq!(bytes, b"{}");

        let missing = registry.download_artifact(&run.run_id, "model", "other.json").await;
        assert!(matches!(missing, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_artifact_path_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let (registry, run) = registry_with_run(&dir).await;
        let result = registry.log_artifact(&run.run_id, "../..", "model.json", b"{}").await;
        assert!(matches!(result, Err(RegistryError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let (registry, run) = registry_with_run(&dir).await;
        registry.register_version("M", &run.run_id, "model").await.unwrap();

        // A directory in place of the temp file makes every persist fail
        let blocker = dir.path().join("mlruns").join("registry.json.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        let result = registry.register_version("M", &run.run_id, "model").await;
        assert!(matches!(result, Err(RegistryError::Io { .. })));
        assert!(registry.set_version_tag("M", 1, "stage", "Production").await.is_err());
        assert!(registry.delete_version("M", 1).await.is_err());

        let versions = registry.list_versions("M").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].tag("stage"), None);

        // Once writes work again numbering continues from what was stored
        std::fs::remove_dir(&blocker).unwrap();
        let next = registry.register_version("M", &run.run_id, "model").await.unwrap();
        assert_eq!(next.version, 2);
    }

    #[tokio::test]
    async fn test_unknown_run_and_version() {
        let dir = TempDir::new().unwrap();
        let registry = FileRegistry::open(dir.path()).unwrap();
        assert!(matches!(
            registry.log_params("nope", &[]).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.set_version_tag("M", 7, "stage", "Production").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.delete_version("M", 1).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
