//! Model lifecycle library
//!
//! This crate provides the core functionality for:
//! - Dataset change detection and loading
//! - Multi-candidate training with experiment tracking
//! - Best-model selection, registry promotion and local snapshots
//! - Startup model resolution with filesystem fallback
//! - Prediction serving with an audit trail and observability

pub mod artifact;
pub mod audit;
pub mod change_detector;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod observability;
pub mod pipeline;
pub mod predictor;
pub mod promotion;
pub mod registry;
pub mod resolver;
pub mod scoring;
pub mod snapshot;
pub mod trainer;

pub use artifact::{InputExample, ModelArtifact};
pub use audit::{AuditError, AuditLog, AuditStats, PredictionRecord};
pub use change_detector::{has_data_changed, ChangeCheck, ChangeDetector, ChangeStatus, DatasetFingerprint};
pub use classifier::{Classifier, ModelSpec};
pub use config::{HashCommitPolicy, LifecycleConfig, RegistryConfig, SelectionMetric};
pub use dataset::{Dataset, DatasetError, TrainTestSplit};
pub use observability::{ServiceMetrics, StructuredLogger};
pub use pipeline::{CandidateSummary, PipelineError, PipelineOutcome, RetrainPipeline};
pub use predictor::{PredictError, PredictionService};
pub use promotion::{select_best, Promotion, PromotionError, Registrar};
pub use registry::{ModelRegistry, RegisteredModelVersion, RegistryError};
pub use resolver::{LoadedModel, ModelResolver, ModelSource, ResolveError, ResolverState};
pub use trainer::{Trainer, TrainingCandidate, TrainingError};
