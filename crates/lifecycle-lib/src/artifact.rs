//! Self-contained serialized model artifacts
//!
//! An artifact directory holds `model.json` (the fitted classifier plus the
//! feature column order it expects) and `input_example.json` (one row of
//! training input documenting the expected shape). The same two files are
//! uploaded to tracking runs and written to local snapshots.

use crate::classifier::{Classifier, ClassifierError};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model.json";
pub const INPUT_EXAMPLE_FILE: &str = "input_example.json";

/// Error type for artifact encoding and loading
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("artifact is inconsistent: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// First training row, stored next to the model as a shape example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputExample {
    pub columns: Vec<String>,
    pub data: Vec<Vec<f64>>,
}

impl InputExample {
    pub fn from_first_row(columns: &[String], x: &Array2<f64>) -> Self {
        let data = x
            .rows()
            .into_iter()
            .next()
            .map(|row| vec![row.to_vec()])
            .unwrap_or_default();
        Self {
            columns: columns.to_vec(),
            data,
        }
    }
}

/// A fitted classifier with everything needed to serve it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_type: String,
    /// Column order the classifier was fitted on
    pub feature_names: Vec<String>,
    pub classifier: Classifier,
    pub trained_at: DateTime<Utc>,
}

impl ModelArtifact {
    pub fn new(model_type: impl Into<String>, feature_names: Vec<String>, classifier: Classifier) -> Self {
        Self {
            model_type: model_type.into(),
            feature_names,
            classifier,
            trained_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode and check the classifier agrees with the recorded columns
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let artifact: Self = serde_json::from_slice(bytes)?;
        let fitted = artifact.classifier.n_features();
        if fitted != artifact.feature_names.len() {
            return Err(ArtifactError::Inconsistent(format!(
                "classifier expects {} features but {} columns are recorded",
                fitted,
                artifact.feature_names.len()
            )));
        }
        if artifact.classifier.classes().is_empty() {
            return Err(ArtifactError::Inconsistent("classifier has no classes".to_string()));
        }
        artifact.classifier.validate()?;
        Ok(artifact)
    }

    pub fn classes(&self) -> &[i64] {
        self.classifier.classes()
    }

    /// Predict one row given in [`feature_names`](Self::feature_names) order
    pub fn predict_one(&self, features: &[f64]) -> Result<i64, ArtifactError> {
        let frame = Array2::from_shape_vec((1, features.len()), features.to_vec())
            .map_err(|e| ArtifactError::Inconsistent(e.to_string()))?;
        let labels = self.classifier.predict(&frame)?;
        labels
            .into_iter()
            .next()
            .ok_or_else(|| ArtifactError::Inconsistent("model returned no prediction".to_string()))
    }
}

/// Write both artifact files into `dir`, creating it if needed
pub fn write_dir(dir: &Path, artifact: &ModelArtifact, example: &InputExample) -> Result<(), ArtifactError> {
    fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    write_file(&dir.join(MODEL_FILE), &artifact.to_bytes()?)?;
    write_file(&dir.join(INPUT_EXAMPLE_FILE), &serde_json::to_vec_pretty(example)?)?;
    Ok(())
}

/// Load the model file from an artifact directory
pub fn read_dir(dir: &Path) -> Result<ModelArtifact, ArtifactError> {
    let path = dir.join(MODEL_FILE);
    let bytes = fs::read(&path).map_err(|source| ArtifactError::Io { path, source })?;
    ModelArtifact::from_bytes(&bytes)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    fs::write(path, bytes).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::classifier::test_support::clustered_dataset;
    use crate::classifier::ModelSpec;

    pub fn feature_names() -> Vec<String> {
        ["sepal_length", "sepal_width", "petal_length", "petal_width"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Small fitted forest over the clustered fixture
    pub fn fitted_artifact() -> (ModelArtifact, InputExample) {
        let (x, y) = clustered_dataset();
        let mut classifier = ModelSpec::RandomForest {
            n_estimators: 5,
            max_depth: None,
            random_state: 42,
        }
        .build();
        classifier.fit(&x, &y).unwrap();
        let example = InputExample::from_first_row(&feature_names(), &x);
        (ModelArtifact::new("RandomForest", feature_names(), classifier), example)
    }
}
