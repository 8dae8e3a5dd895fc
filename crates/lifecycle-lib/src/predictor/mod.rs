//! Prediction service
//!
//! Validates feature vectors, runs the resolved model and writes the audit
//! trail. HTTP framing lives in the server crate.

mod service;
mod validation;

pub use service::PredictionService;
pub use validation::validate_features;

use crate::audit::AuditError;

/// Error type for a single prediction request
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    /// Rejected before reaching the model; maps to a client error
    #[error("{0}")]
    InvalidInput(String),

    #[error("inference failed: {0}")]
    Inference(String),

    /// Prediction computed but the audit record could not be persisted
    #[error("failed to write audit record: {0}")]
    Audit(#[from] AuditError),
}

impl PredictError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, PredictError::InvalidInput(_))
    }
}
