use super::PredictError;

/// Check a feature vector before it reaches the model.
///
/// Requires exactly `expected` values, each finite and strictly positive.
pub fn validate_features(features: &[f64], expected: usize) -> Result<(), PredictError> {
    if features.len() != expected {
        return Err(PredictError::InvalidInput(format!(
            "expected {} features, got {}",
            expected,
            features.len()
        )));
    }

    for (idx, value) in features.iter().enumerate() {
        if !value.is_finite() {
            return Err(PredictError::InvalidInput(format!("feature {} is not a finite number", idx)));
        }
        if *value <= 0.0 {
            return Err(PredictError::InvalidInput(format!(
                "feature {} must be greater than 0, got {}",
                idx, value
            )));
        }
    }

    Ok(())
}
