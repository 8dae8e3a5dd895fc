//! Retraining pipeline
//!
//! One run-to-completion cycle: change check, dataset load and split,
//! candidate training, selection and promotion. Concurrent cycles against the
//! same hash store are not coordinated.

use crate::change_detector::{ChangeCheck, ChangeDetector, ChangeStatus, FingerprintError};
use crate::config::{HashCommitPolicy, LifecycleConfig};
use crate::dataset::{self, Dataset, DatasetError};
use crate::observability::StructuredLogger;
use crate::promotion::{Promotion, PromotionError, Registrar};
use crate::registry::{self, ModelRegistry, RegistryError};
use crate::resolver::ModelResolver;
use crate::trainer::{Trainer, TrainingError};
use std::sync::Arc;
use tracing::{info, warn};

/// Error type for a retraining cycle
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("change detection failed: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("training failed: {0}")]
    Training(#[from] TrainingError),

    #[error("promotion failed: {0}")]
    Promotion(#[from] PromotionError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Scores of one trained candidate
#[derive(Debug, Clone)]
pub struct CandidateSummary {
    pub model_type: String,
    pub accuracy: f64,
    pub weighted_f1: f64,
    pub run_id: String,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    /// Dataset unchanged and no force requested
    Skipped { check: ChangeCheck },
    Promoted {
        check: ChangeCheck,
        candidates: Vec<CandidateSummary>,
        promotion: Promotion,
    },
}

pub struct RetrainPipeline {
    config: LifecycleConfig,
    registry: Arc<dyn ModelRegistry>,
    detector: ChangeDetector,
    trainer: Trainer,
    registrar: Registrar,
    logger: StructuredLogger,
}

impl RetrainPipeline {
    /// Build a pipeline against the registry named in `config`
    pub fn connect(config: LifecycleConfig) -> Result<Self, PipelineError> {
        let registry = registry::connect(&config.registry)?;
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: LifecycleConfig, registry: Arc<dyn ModelRegistry>) -> Self {
        let logger = StructuredLogger::new("pipeline");
        let detector = ChangeDetector::new(
            &config.hash_store_path,
            config.hash_commit,
            dataset::data_source(config.data_load_command.as_deref()),
        );
        let trainer = Trainer::new(registry.clone(), &config.registry.experiment_name, logger.clone());
        let registrar = Registrar::new(
            registry.clone(),
            config.registry.clone(),
            &config.snapshot_root,
            logger.clone(),
        );

        Self {
            config,
            registry,
            detector,
            trainer,
            registrar,
            logger,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    /// Resolver sharing this pipeline's registry and snapshot root
    pub fn resolver(&self) -> ModelResolver {
        ModelResolver::new(
            Some(self.registry.clone()),
            self.config.registry.clone(),
            &self.config.snapshot_root,
            self.logger.clone(),
        )
    }

    /// Change check only
    pub fn check(&self) -> Result<ChangeCheck, PipelineError> {
        let check = self.detector.check(&self.config.dataset_path)?;
        self.logger.log_data_check(
            &self.config.dataset_path.display().to_string(),
            check.status.as_str(),
            check.fingerprint.as_ref().map(|f| f.digest.as_str()),
            check.changed(),
        );
        Ok(check)
    }

    /// Run one cycle. `force` retrains even when the dataset is unchanged.
    pub async fn run(&self, force: bool) -> Result<PipelineOutcome, PipelineError> {
        let mut check = self.check()?;
        if !check.changed() && !force {
            info!("Dataset unchanged, skipping retraining");
            return Ok(PipelineOutcome::Skipped { check });
        }

        let data = Dataset::from_csv(&self.config.dataset_path, &self.config.label_column)?;
        let split = data.split(self.config.test_fraction, self.config.split_seed)?;
        info!(
            rows = data.len(),
            train = split.y_train.len(),
            test = split.y_test.len(),
            features = split.feature_names.len(),
            "Dataset loaded"
        );

        let candidates = self.trainer.train_candidates(&split, &self.config.roster).await?;
        let promotion = self
            .registrar
            .select_and_promote(&candidates, self.config.selection_metric)
            .await?;

        self.record_success(&mut check);

        Ok(PipelineOutcome::Promoted {
            check,
            candidates: candidates
                .iter()
                .map(|c| CandidateSummary {
                    model_type: c.model_type.clone(),
                    accuracy: c.accuracy,
                    weighted_f1: c.weighted_f1,
                    run_id: c.run_id.clone(),
                })
                .collect(),
            promotion,
        })
    }

    /// Store the digest a completed cycle trained on.
    ///
    /// The model is already promoted at this point, so a failure here is
    /// logged and only costs one redundant retrain.
    fn record_success(&self, check: &mut ChangeCheck) {
        let result = if check.status == ChangeStatus::Missing {
            // Dataset was produced by the load command during this cycle
            self.detector
                .commit_current(&self.config.dataset_path)
                .map(|_| check.committed = true)
        } else if self.config.hash_commit == HashCommitPolicy::OnSuccess {
            self.detector.commit(check)
        } else {
            Ok(())
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to record dataset digest after promotion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::test_support::clustered_dataset;
    use crate::classifier::ModelSpec;
    use crate::registry::FileRegistry;
    use std::fmt::Write as _;
    use std::path::Path;
    use tempfile::TempDir;

    fn dataset_csv() -> String {
        let (x, y) = clustered_dataset();
        let mut csv = String::from("sepal_length,sepal_width,petal_length,petal_width,species\n");
        for (row, label) in x.rows().into_iter().zip(y) {
            let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(csv, "{},{}", values.join(","), label).unwrap();
        }
        csv
    }

    fn config(root: &Path) -> LifecycleConfig {
        LifecycleConfig {
            dataset_path: root.join("data/raw/iris.csv"),
            hash_store_path: root.join("data/last_hash.txt"),
            snapshot_root: root.join("saved_models"),
            roster: vec![
                ModelSpec::LogisticRegression {
                    max_iter: 200,
                    learning_rate: 0.5,
                    alpha: 0.01,
                },
                ModelSpec::RandomForest {
                    n_estimators: 10,
                    max_depth: None,
                    random_state: 42,
                },
            ],
            ..Default::default()
        }
    }

    fn pipeline(root: &Path, config: LifecycleConfig) -> RetrainPipeline {
        let registry = Arc::new(FileRegistry::open(root.join("mlruns")).unwrap());
        RetrainPipeline::with_registry(config, registry)
    }

    fn write_dataset(config: &LifecycleConfig) {
        std::fs::create_dir_all(config.dataset_path.parent().unwrap()).unwrap();
        std::fs::write(&config.dataset_path, dataset_csv()).unwrap();
    }

    #[tokio::test]
    async fn test_first_run_promotes_then_rerun_skips() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        write_dataset(&config);
        let pipeline = pipeline(dir.path(), config.clone());

        match pipeline.run(false).await.unwrap() {
            PipelineOutcome::Promoted {
                check,
                candidates,
                promotion,
            } => {
                assert_eq!(check.status, ChangeStatus::FirstRun);
                assert_eq!(candidates.len(), 2);
                assert_eq!(promotion.version, 1);
                assert!(promotion.snapshot_dir.exists());
            }
            other => panic!("expected promotion, got {:?}", other),
        }
        assert!(config.hash_store_path.exists());

        assert!(matches!(
            pipeline.run(false).await.unwrap(),
            PipelineOutcome::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_force_retrains_unchanged_dataset() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        write_dataset(&config);
        let pipeline = pipeline(dir.path(), config);

        pipeline.run(false).await.unwrap();
        match pipeline.run(true).await.unwrap() {
            PipelineOutcome::Promoted { check, promotion, .. } => {
                assert_eq!(check.status, ChangeStatus::Unchanged);
                assert_eq!(promotion.version, 2);
                assert_eq!(promotion.archived, vec![1]);
            }
            other => panic!("expected promotion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_promoted_model_is_resolvable() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        write_dataset(&config);
        let pipeline = pipeline(dir.path(), config);
        pipeline.run(false).await.unwrap();

        let model = pipeline.resolver().resolve_active_model().await.unwrap();
        assert!(matches!(
            model.source,
            crate::resolver::ModelSource::Registry { version: 1, .. }
        ));
        assert_eq!(model.artifact.feature_names.len(), 4);
    }

    #[tokio::test]
    async fn test_eager_policy_consumes_change_on_failure() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        write_dataset(&config);
        std::fs::write(&config.snapshot_root, b"blocked").unwrap();
        let pipeline = pipeline(dir.path(), config.clone());

        assert!(matches!(
            pipeline.run(false).await,
            Err(PipelineError::Promotion(_))
        ));
        assert!(config.hash_store_path.exists());
        assert!(!pipeline.check().unwrap().changed());
    }

    #[tokio::test]
    async fn test_on_success_policy_retries_after_failure() {
        let dir = TempDir::new().unwrap();
        let config = LifecycleConfig {
            hash_commit: HashCommitPolicy::OnSuccess,
            ..config(dir.path())
        };
        write_dataset(&config);
        std::fs::write(&config.snapshot_root, b"blocked").unwrap();
        let pipeline = pipeline(dir.path(), config.clone());

        assert!(pipeline.run(false).await.is_err());
        assert!(!config.hash_store_path.exists());

        std::fs::remove_file(&config.snapshot_root).unwrap();
        assert!(matches!(
            pipeline.run(false).await.unwrap(),
            PipelineOutcome::Promoted { .. }
        ));
        assert!(config.hash_store_path.exists());
        assert!(!pipeline.check().unwrap().changed());
    }

    #[tokio::test]
    async fn test_missing_dataset_without_loader_fails() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(dir.path(), config(dir.path()));
        assert!(matches!(
            pipeline.run(false).await,
            Err(PipelineError::Dataset(DatasetError::Io { .. }))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_dataset_is_loaded_and_recorded() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.csv");
        std::fs::write(&source, dataset_csv()).unwrap();

        let mut config = config(dir.path());
        config.data_load_command = Some(format!(
            "mkdir -p '{}' && cp '{}' '{}'",
            config.dataset_path.parent().unwrap().display(),
            source.display(),
            config.dataset_path.display()
        ));
        let pipeline = pipeline(dir.path(), config.clone());

        match pipeline.run(false).await.unwrap() {
            PipelineOutcome::Promoted { check, .. } => assert_eq!(check.status, ChangeStatus::Missing),
            other => panic!("expected promotion, got {:?}", other),
        }
        assert!(!pipeline.check().unwrap().changed());
    }
}
