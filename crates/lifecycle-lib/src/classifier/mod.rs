//! Candidate classifiers
//!
//! Every model type that can appear in a training roster lives here. Fitted
//! models serialize to plain JSON so a snapshot or registry artifact is
//! self-contained.

mod forest;
mod logistic;
mod tree;

pub use forest::RandomForest;
pub use logistic::LogisticRegression;
pub use tree::DecisionTree;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while fitting or applying a classifier
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("model has not been fitted")]
    NotFitted,

    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

/// Roster entry: a model type plus its hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSpec {
    LogisticRegression {
        #[serde(default = "default_max_iter")]
        max_iter: usize,
        #[serde(default = "default_learning_rate")]
        learning_rate: f64,
        #[serde(default = "default_alpha")]
        alpha: f64,
    },
    RandomForest {
        #[serde(default = "default_n_estimators")]
        n_estimators: usize,
        #[serde(default)]
        max_depth: Option<usize>,
        #[serde(default = "default_random_state")]
        random_state: u64,
    },
}

fn default_max_iter() -> usize {
    200
}

fn default_learning_rate() -> f64 {
    0.5
}

fn default_alpha() -> f64 {
    0.01
}

fn default_n_estimators() -> usize {
    100
}

fn default_random_state() -> u64 {
    42
}

impl ModelSpec {
    /// Roster used when none is configured
    pub fn default_roster() -> Vec<ModelSpec> {
        vec![
            ModelSpec::LogisticRegression {
                max_iter: default_max_iter(),
                learning_rate: default_learning_rate(),
                alpha: default_alpha(),
            },
            ModelSpec::RandomForest {
                n_estimators: default_n_estimators(),
                max_depth: None,
                random_state: default_random_state(),
            },
        ]
    }

    /// Model type name used for tracking runs and snapshot directories
    pub fn model_type(&self) -> &'static str {
        match self {
            ModelSpec::LogisticRegression { .. } => "LogisticRegression",
            ModelSpec::RandomForest { .. } => "RandomForest",
        }
    }

    /// Hyperparameters as tracking params, in a stable order
    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![("model_name".to_string(), self.model_type().to_string())];
        match self {
            ModelSpec::LogisticRegression {
                max_iter,
                learning_rate,
                alpha,
            } => {
                params.push(("max_iter".to_string(), max_iter.to_string()));
                params.push(("learning_rate".to_string(), learning_rate.to_string()));
                params.push(("alpha".to_string(), alpha.to_string()));
            }
            ModelSpec::RandomForest {
                n_estimators,
                max_depth,
                random_state,
            } => {
                params.push(("n_estimators".to_string(), n_estimators.to_string()));
                params.push((
                    "max_depth".to_string(),
                    max_depth.map_or_else(|| "None".to_string(), |d| d.to_string()),
                ));
                params.push(("random_state".to_string(), random_state.to_string()));
            }
        }
        params
    }

    /// Unfitted classifier configured from this spec
    pub fn build(&self) -> Classifier {
        match self {
            ModelSpec::LogisticRegression {
                max_iter,
                learning_rate,
                alpha,
            } => Classifier::LogisticRegression(
                LogisticRegression::new()
                    .with_max_iter(*max_iter)
                    .with_learning_rate(*learning_rate)
                    .with_alpha(*alpha),
            ),
            ModelSpec::RandomForest {
                n_estimators,
                max_depth,
                random_state,
            } => {
                let mut forest = RandomForest::new(*n_estimators).with_random_state(*random_state);
                if let Some(depth) = max_depth {
                    forest = forest.with_max_depth(*depth);
                }
                Classifier::RandomForest(forest)
            }
        }
    }
}

/// A fitted (or fittable) classifier of any roster type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classifier {
    LogisticRegression(LogisticRegression),
    RandomForest(RandomForest),
}

impl Classifier {
    pub fn fit(&mut self, x: &Array2<f64>, y: &[i64]) -> Result<(), ClassifierError> {
        check_training_input(x, y)?;
        match self {
            Classifier::LogisticRegression(model) => model.fit(x, y),
            Classifier::RandomForest(model) => model.fit(x, y),
        }
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<i64>, ClassifierError> {
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ClassifierError::NonFinite("features"));
        }
        match self {
            Classifier::LogisticRegression(model) => model.predict(x),
            Classifier::RandomForest(model) => model.predict(x),
        }
    }

    /// Labels seen during fitting, ascending
    pub fn classes(&self) -> &[i64] {
        match self {
            Classifier::LogisticRegression(model) => model.classes(),
            Classifier::RandomForest(model) => model.classes(),
        }
    }

    /// Check a fitted (usually just decoded) model is internally consistent
    pub fn validate(&self) -> Result<(), ClassifierError> {
        match self {
            Classifier::LogisticRegression(model) => model.validate(),
            Classifier::RandomForest(model) => model.validate(),
        }
    }

    /// Number of feature columns the model was fitted on
    pub fn n_features(&self) -> usize {
        match self {
            Classifier::LogisticRegression(model) => model.n_features(),
            Classifier::RandomForest(model) => model.n_features(),
        }
    }
}

fn check_training_input(x: &Array2<f64>, y: &[i64]) -> Result<(), ClassifierError> {
    if x.nrows() == 0 {
        return Err(ClassifierError::EmptyTrainingSet);
    }
    if x.nrows() != y.len() {
        return Err(ClassifierError::ShapeMismatch {
            expected: format!("{} labels", x.nrows()),
            actual: format!("{} labels", y.len()),
        });
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(ClassifierError::NonFinite("training features"));
    }
    Ok(())
}

/// Sorted distinct labels
pub(crate) fn unique_classes(y: &[i64]) -> Vec<i64> {
    let mut classes = y.to_vec();
    classes.sort_unstable();
    classes.dedup();
    classes
}

#[cfg(test)]
pub(crate) mod test_support {
    use ndarray::Array2;

    /// Three well separated clusters in four dimensions
    pub fn clustered_dataset() -> (Array2<f64>, Vec<i64>) {
        let centers = [[1.0, 1.0, 1.0, 1.0], [5.0, 5.0, 1.0, 1.0], [1.0, 5.0, 5.0, 5.0]];
        let offsets = [-0.3, -0.1, 0.0, 0.1, 0.3];
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for (label, center) in centers.iter().enumerate() {
            for (i, da) in offsets.iter().enumerate() {
                for db in offsets.iter().skip(i % 2) {
                    rows.extend(center.iter().enumerate().map(|(j, c)| {
                        if j % 2 == 0 {
                            c + da
                        } else {
                            c + db
                        }
                    }));
                    labels.push(label as i64);
                }
            }
        }
        let n = labels.len();
        (Array2::from_shape_vec((n, 4), rows).unwrap(), labels)
    }
}
