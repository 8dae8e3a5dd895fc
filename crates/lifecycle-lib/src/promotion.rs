//! Best-candidate selection and registry promotion
//!
//! A promotion registers the winner as a new version, writes a local snapshot,
//! re-logs the artifact into the winning run, tags the version with the active
//! stage and (when exclusive) archives every other holder of that stage.
//! If any step before tagging fails, the new version and any snapshot written
//! are removed again so the previously active version keeps serving.

use crate::artifact::{ArtifactError, INPUT_EXAMPLE_FILE, MODEL_FILE};
use crate::config::{RegistryConfig, SelectionMetric};
use crate::observability::StructuredLogger;
use crate::registry::{ModelRegistry, RegisteredModelVersion, RegistryError};
use crate::snapshot;
use crate::trainer::TrainingCandidate;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Artifact path the winning model is re-logged under in its own run
pub const BEST_MODEL_PATH: &str = "best_model";

/// Error type for selection and promotion
#[derive(Debug, thiserror::Error)]
pub enum PromotionError {
    #[error("no candidates to promote")]
    NoCandidates,

    #[error("registry error during promotion: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to write local snapshot: {0}")]
    Snapshot(#[from] ArtifactError),

    #[error("{original}; rollback also failed: {compensation}")]
    Compensation {
        #[source]
        original: Box<PromotionError>,
        compensation: String,
    },
}

/// Completed promotion
#[derive(Debug, Clone)]
pub struct Promotion {
    pub model_name: String,
    pub version: u64,
    pub run_id: String,
    pub model_type: String,
    pub metric: SelectionMetric,
    pub metric_value: f64,
    pub snapshot_dir: PathBuf,
    /// Versions that lost the active stage to this one
    pub archived: Vec<u64>,
}

/// Candidate with the strictly highest `metric`; the earliest wins ties
pub fn select_best(candidates: &[TrainingCandidate], metric: SelectionMetric) -> Option<&TrainingCandidate> {
    let mut best: Option<&TrainingCandidate> = None;
    for candidate in candidates {
        match best {
            Some(current) if candidate.metric(metric) <= current.metric(metric) => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Registers and promotes winning candidates
pub struct Registrar {
    registry: Arc<dyn ModelRegistry>,
    config: RegistryConfig,
    snapshot_root: PathBuf,
    logger: StructuredLogger,
}

impl Registrar {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
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

    /// Pick the best candidate and make it the active version
    pub async fn select_and_promote(
        &self,
        candidates: &[TrainingCandidate],
        metric: SelectionMetric,
    ) -> Result<Promotion, PromotionError> {
        let best = select_best(candidates, metric).ok_or(PromotionError::NoCandidates)?;
        let metric_value = best.metric(metric);
        info!(
            model_type = %best.model_type,
            metric = metric.as_str(),
            value = metric_value,
            "Selected best candidate"
        );

        let version = self
            .registry
            .register_version(&self.config.model_name, &best.run_id, &best.artifact_path)
            .await?;

        let snapshot_dir = match snapshot::write(&self.snapshot_root, &best.artifact, &best.input_example, Local::now()) {
            Ok(dir) => dir,
            Err(e) => return Err(self.compensate(&version, None, e.into()).await),
        };

        if let Err(e) = self.relog_artifact(best).await {
            return Err(self.compensate(&version, Some(&snapshot_dir), e).await);
        }

        if let Err(e) = self
            .registry
            .set_version_tag(
                &self.config.model_name,
                version.version,
                &self.config.stage_key,
                &self.config.active_stage,
            )
            .await
        {
            return Err(self.compensate(&version, Some(&snapshot_dir), e.into()).await);
        }

        let archived = self.demote_others(version.version).await;

        self.logger.log_model_promoted(
            &self.config.model_name,
            version.version,
            &best.model_type,
            metric.as_str(),
            metric_value,
            &snapshot_dir.display().to_string(),
        );

        Ok(Promotion {
            model_name: self.config.model_name.clone(),
            version: version.version,
            run_id: best.run_id.clone(),
            model_type: best.model_type.clone(),
            metric,
            metric_value,
            snapshot_dir,
            archived,
        })
    }

    /// Move the active stage to an existing version
    pub async fn promote_version(&self, version: u64) -> Result<Vec<u64>, PromotionError> {
        let versions = self.registry.list_versions(&self.config.model_name).await?;
        if !versions.iter().any(|v| v.version == version) {
            return Err(RegistryError::NotFound(format!("{} version {}", self.config.model_name, version)).into());
        }

        self.registry
            .set_version_tag(
                &self.config.model_name,
                version,
                &self.config.stage_key,
                &self.config.active_stage,
            )
            .await?;
        let archived = self.demote_others(version).await;

        info!(
            model_name = %self.config.model_name,
            version = version,
            archived = ?archived,
            "Moved active stage"
        );
        Ok(archived)
    }

    async fn relog_artifact(&self, best: &TrainingCandidate) -> Result<(), PromotionError> {
        let model_bytes = best.artifact.to_bytes()?;
        let example_bytes = serde_json::to_vec_pretty(&best.input_example).map_err(ArtifactError::from)?;

        self.registry
            .log_artifact(&best.run_id, BEST_MODEL_PATH, MODEL_FILE, &model_bytes)
            .await?;
        self.registry
            .log_artifact(&best.run_id, BEST_MODEL_PATH, INPUT_EXAMPLE_FILE, &example_bytes)
            .await?;
        Ok(())
    }

    /// Archive every other version holding the active stage.
    ///
    /// Failures are logged, not returned: the resolver picks the highest
    /// tagged version, so a missed demotion cannot change what is served.
    async fn demote_others(&self, keep: u64) -> Vec<u64> {
        if !self.config.exclusive_stage {
            return Vec::new();
        }

        let holders = match self
            .registry
            .search_versions_by_tag(&self.config.model_name, &self.config.stage_key, &self.config.active_stage)
            .await
        {
            Ok(holders) => holders,
            Err(e) => {
                warn!(error = %e, "Could not list active versions to archive");
                return Vec::new();
            }
        };

        let mut archived = Vec::new();
        for holder in holders.into_iter().filter(|v| v.version != keep) {
            match self
                .registry
                .set_version_tag(
                    &self.config.model_name,
                    holder.version,
                    &self.config.stage_key,
                    &self.config.archived_stage,
                )
                .await
            {
                Ok(()) => archived.push(holder.version),
                Err(e) => warn!(version = holder.version, error = %e, "Failed to archive previous version"),
            }
        }
        archived.sort_unstable();
        archived
    }

    async fn compensate(
        &self,
        version: &RegisteredModelVersion,
        snapshot_dir: Option<&Path>,
        original: PromotionError,
    ) -> PromotionError {
        let mut failures = Vec::new();

        if let Some(dir) = snapshot_dir {
            if let Err(e) = snapshot::remove(dir) {
                failures.push(format!("removing snapshot {}: {}", dir.display(), e));
            }
        }
        if let Err(e) = self.registry.delete_version(&version.name, version.version).await {
            failures.push(format!("deleting version {}: {}", version.version, e));
        }

        let reason = original.to_string();
        self.logger
            .log_promotion_compensated(&version.name, version.version, &reason, failures.is_empty());

        if failures.is_empty() {
            original
        } else {
            PromotionError::Compensation {
                original: Box::new(original),
                compensation: failures.join("; "),
            }
        }
    }
}
