use super::{validate_features, PredictError};
use crate::audit::{AuditLog, AuditStats, PredictionRecord};
use crate::observability::{ServiceMetrics, StructuredLogger};
use crate::resolver::LoadedModel;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Serves one resolved model. Cheap to share across request handlers.
pub struct PredictionService {
    model: Arc<LoadedModel>,
    audit: Arc<AuditLog>,
    metrics: ServiceMetrics,
    logger: StructuredLogger,
}

impl PredictionService {
    pub fn new(model: Arc<LoadedModel>, audit: Arc<AuditLog>, metrics: ServiceMetrics, logger: StructuredLogger) -> Self {
        Self {
            model,
            audit,
            metrics,
            logger,
        }
    }

    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    /// Number of features the model expects, in its fitted column order
    pub fn expected_features(&self) -> usize {
        self.model.artifact.feature_names.len()
    }

    /// Validate, predict and audit one feature vector.
    ///
    /// Invalid input never reaches the model or the audit sinks.
    pub fn predict(&self, features: Vec<f64>) -> Result<i64, PredictError> {
        let start = Instant::now();
        validate_features(&features, self.expected_features())?;

        let label = self
            .model
            .artifact
            .predict_one(&features)
            .map_err(|e| PredictError::Inference(e.to_string()))?;

        let record = PredictionRecord::now(features, label);
        if let Err(e) = self.audit.record(&record) {
            self.metrics.inc_audit_failures();
            error!(error = %e, prediction = label, "Audit write failed");
            return Err(e.into());
        }

        self.metrics.inc_prediction(label);
        self.logger
            .log_prediction(&record.features, label, start.elapsed().as_secs_f64());
        Ok(label)
    }

    /// Aggregates over every audited prediction
    pub fn stats(&self) -> Result<AuditStats, PredictError> {
        Ok(self.audit.stats()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::fitted_artifact;
    use crate::resolver::ModelSource;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> PredictionService {
        let (artifact, _) = fitted_artifact();
        let model = Arc::new(LoadedModel {
            artifact,
            source: ModelSource::Snapshot {
                path: PathBuf::from("saved_models/RandomForest_20240101_000000"),
            },
        });
        let audit = Arc::new(
            AuditLog::open(dir.path().join("predictions.csv"), dir.path().join("predictions.db")).unwrap(),
        );
        PredictionService::new(model, audit, ServiceMetrics::new(), StructuredLogger::new("test"))
    }

    #[test]
    fn test_valid_prediction_is_audited() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let label = service.predict(vec![5.0, 5.0, 1.0, 1.0]).unwrap();
        assert!(service.model().artifact.classes().contains(&label));

        let stats = service.stats().unwrap();
        assert_eq!(stats.total_predictions, 1);
        assert_eq!(stats.prediction_counts.get(&label), Some(&1));

        let csv = std::fs::read_to_string(dir.path().join("predictions.csv")).unwrap();
        assert_eq!(csv.lines().count(), 2);
    }

    #[test]
    fn test_invalid_input_writes_no_audit() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        for features in [vec![5.0, 0.0, 1.0, 1.0], vec![5.0, -1.0, 1.0, 1.0], vec![5.0, 5.0, 1.0]] {
            let err = service.predict(features).unwrap_err();
            assert!(err.is_client_error());
        }

        assert_eq!(service.stats().unwrap().total_predictions, 0);
        assert!(!dir.path().join("predictions.csv").exists());
    }

    #[test]
    fn test_audit_failure_is_a_distinct_error() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        std::fs::create_dir_all(dir.path().join("predictions.csv")).unwrap();

        let err = service.predict(vec![5.0, 5.0, 1.0, 1.0]).unwrap_err();
        assert!(matches!(err, PredictError::Audit(_)));
        assert!(!err.is_client_error());
        assert_eq!(service.metrics().audit_failures(), 1);
    }
}
