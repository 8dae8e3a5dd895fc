//! Candidate training
//!
//! Fits every roster entry on the training split, scores it on the held-out
//! split and records one tracking run per candidate. Candidates come back in
//! roster order; ranking is left to the promotion step.

use crate::artifact::{ArtifactError, InputExample, ModelArtifact, INPUT_EXAMPLE_FILE, MODEL_FILE};
use crate::classifier::{ClassifierError, ModelSpec};
use crate::config::SelectionMetric;
use crate::dataset::TrainTestSplit;
use crate::observability::StructuredLogger;
use crate::registry::{ModelRegistry, RegistryError, RunInfo, RunStatus};
use crate::scoring;
use ndarray::Array2;
use std::sync::Arc;
use tracing::{debug, warn};

/// Artifact path used inside every candidate run
pub const ARTIFACT_PATH: &str = "model";

/// Error type for a training cycle. Any of these aborts the whole cycle.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("roster is empty")]
    EmptyRoster,

    #[error("training {model_type} failed: {source}")]
    Candidate {
        model_type: String,
        #[source]
        source: ClassifierError,
    },

    #[error("training task for {0} did not complete")]
    Interrupted(String),

    #[error("tracking failed: {0}")]
    Tracking(#[from] RegistryError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// One fitted and scored roster entry
#[derive(Debug, Clone)]
pub struct TrainingCandidate {
    pub model_type: String,
    pub spec: ModelSpec,
    pub artifact: ModelArtifact,
    pub input_example: InputExample,
    pub accuracy: f64,
    pub weighted_f1: f64,
    pub run_id: String,
    pub artifact_path: String,
}

impl TrainingCandidate {
    pub fn metric(&self, metric: SelectionMetric) -> f64 {
        match metric {
            SelectionMetric::Accuracy => self.accuracy,
            SelectionMetric::WeightedF1 => self.weighted_f1,
        }
    }
}

/// Trains a roster and records each candidate as a tracking run
pub struct Trainer {
    registry: Arc<dyn ModelRegistry>,
    experiment_name: String,
    logger: StructuredLogger,
}

impl Trainer {
    pub fn new(registry: Arc<dyn ModelRegistry>, experiment_name: impl Into<String>, logger: StructuredLogger) -> Self {
        Self {
            registry,
            experiment_name: experiment_name.into(),
            logger,
        }
    }

    /// Train every roster entry in order
    pub async fn train_candidates(
        &self,
        split: &TrainTestSplit,
        roster: &[ModelSpec],
    ) -> Result<Vec<TrainingCandidate>, TrainingError> {
        if roster.is_empty() {
            return Err(TrainingError::EmptyRoster);
        }

        let experiment_id = self.registry.ensure_experiment(&self.experiment_name).await?;
        let mut candidates = Vec::with_capacity(roster.len());

        for spec in roster {
            let run = self.registry.create_run(&experiment_id, spec.model_type()).await?;

            match self.train_in_run(&run, split, spec).await {
                Ok(candidate) => {
                    self.registry.finish_run(&run.run_id, RunStatus::Finished).await?;
                    self.logger.log_candidate_trained(
                        &candidate.model_type,
                        &candidate.run_id,
                        candidate.accuracy,
                        candidate.weighted_f1,
                    );
                    candidates.push(candidate);
                }
                Err(e) => {
                    if let Err(finish_err) = self.registry.finish_run(&run.run_id, RunStatus::Failed).await {
                        warn!(run_id = %run.run_id, error = %finish_err, "Failed to mark run as failed");
                    }
                    return Err(e);
                }
            }
        }

        Ok(candidates)
    }

    async fn train_in_run(
        &self,
        run: &RunInfo,
        split: &TrainTestSplit,
        spec: &ModelSpec,
    ) -> Result<TrainingCandidate, TrainingError> {
        let model_type = spec.model_type().to_string();
        debug!(model_type = %model_type, run_id = %run.run_id, "Training candidate");

        let (artifact, y_pred) = fit_and_predict(spec, split).await?;
        let accuracy = scoring::accuracy(&split.y_test, &y_pred);
        let weighted_f1 = scoring::weighted_f1(&split.y_test, &y_pred);
        let input_example = InputExample::from_first_row(&split.feature_names, &split.x_train);

        self.registry.log_params(&run.run_id, &spec.params()).await?;
        self.registry
            .log_metrics(
                &run.run_id,
                &[
                    ("accuracy".to_string(), accuracy),
                    ("f1_score".to_string(), weighted_f1),
                ],
            )
            .await?;
        self.registry
            .log_artifact(&run.run_id, ARTIFACT_PATH, MODEL_FILE, &artifact.to_bytes()?)
            .await?;
        self.registry
            .log_artifact(
                &run.run_id,
                ARTIFACT_PATH,
                INPUT_EXAMPLE_FILE,
                &serde_json::to_vec_pretty(&input_example).map_err(ArtifactError::from)?,
            )
            .await?;

        Ok(TrainingCandidate {
            model_type,
            spec: spec.clone(),
            artifact,
            input_example,
            accuracy,
            weighted_f1,
            run_id: run.run_id.clone(),
            artifact_path: ARTIFACT_PATH.to_string(),
        })
    }
}

/// Fit on the training split and predict the held-out split off the async runtime
async fn fit_and_predict(
    spec: &ModelSpec,
    split: &TrainTestSplit,
) -> Result<(ModelArtifact, Vec<i64>), TrainingError> {
    let model_type = spec.model_type().to_string();
    let mut classifier = spec.build();
    let x_train: Array2<f64> = split.x_train.clone();
    let y_train = split.y_train.clone();
    let x_test = split.x_test.clone();
    let feature_names = split.feature_names.clone();
    let task_type = model_type.clone();

    let result = tokio::task::spawn_blocking(move || {
        classifier.fit(&x_train, &y_train)?;
        let y_pred = classifier.predict(&x_test)?;
        Ok::<_, ClassifierError>((ModelArtifact::new(task_type, feature_names, classifier), y_pred))
    })
    .await
    .map_err(|_| TrainingError::Interrupted(model_type.clone()))?;

    result.map_err(|source| TrainingError::Candidate { model_type, source })
}
