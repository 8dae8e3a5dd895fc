//! Multinomial logistic regression

use super::{unique_classes, ClassifierError};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Softmax regression trained with batch gradient descent and L2 penalty.
///
/// Features are standardized with the training mean and deviation, which are
/// kept with the model so prediction applies the same transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// Regularization strength (L2)
    pub alpha: f64,
    /// Maximum iterations
    pub max_iter: usize,
    /// Convergence tolerance on the gradient norm
    pub tol: f64,
    /// Learning rate
    pub learning_rate: f64,
    classes: Vec<i64>,
    /// Weights, one column per class
    coefficients: Option<Array2<f64>>,
    intercepts: Option<Array1<f64>>,
    feature_mean: Option<Array1<f64>>,
    feature_scale: Option<Array1<f64>>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl LogisticRegression {
    pub fn new() -> Self {
        Self {
            alpha: 0.01,
            max_iter: 200,
            tol: 1e-6,
            learning_rate: 0.5,
            classes: Vec::new(),
            coefficients: None,
            intercepts: None,
            feature_mean: None,
            feature_scale: None,
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn n_features(&self) -> usize {
        self.coefficients.as_ref().map_or(0, |w| w.nrows())
    }

    /// Check the fitted parameters agree with each other and with `classes`
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let (weights, bias, mean, scale) = match (
            &self.coefficients,
            &self.intercepts,
            &self.feature_mean,
            &self.feature_scale,
        ) {
            (Some(w), Some(b), Some(m), Some(s)) => (w, b, m, s),
            _ => return Err(ClassifierError::NotFitted),
        };
        if self.classes.is_empty() {
            return Err(ClassifierError::NotFitted);
        }
        if weights.ncols() != self.classes.len() || bias.len() != self.classes.len() {
            return Err(ClassifierError::ShapeMismatch {
                expected: format!("{} class columns", self.classes.len()),
                actual: format!("{} weight columns, {} intercepts", weights.ncols(), bias.len()),
            });
        }
        if mean.len() != weights.nrows() || scale.len() != weights.nrows() {
            return Err(ClassifierError::ShapeMismatch {
                expected: format!("{} feature statistics", weights.nrows()),
                actual: format!("{} means, {} scales", mean.len(), scale.len()),
            });
        }
        let finite = weights.iter().chain(bias).chain(mean).all(|v| v.is_finite());
        if !finite || scale.iter().any(|v| !v.is_finite() || *v == 0.0) {
            return Err(ClassifierError::NonFinite("model parameters"));
        }
        Ok(())
    }

    /// Row-wise softmax, stabilized by subtracting the row maximum
    fn softmax(mut logits: Array2<f64>) -> Array2<f64> {
        for mut row in logits.rows_mut() {
            let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row /= sum;
        }
        logits
    }

    fn standardize(&self, x: &Array2<f64>) -> Result<Array2<f64>, ClassifierError> {
        let (mean, scale) = match (&self.feature_mean, &self.feature_scale) {
            (Some(mean), Some(scale)) => (mean, scale),
            _ => return Err(ClassifierError::NotFitted),
        };
        if x.ncols() != mean.len() {
            return Err(ClassifierError::ShapeMismatch {
                expected: format!("{} features", mean.len()),
                actual: format!("{} features", x.ncols()),
            });
        }
        Ok((x - mean) / scale)
    }

    /// Fit the model using gradient descent
    pub fn fit(&mut self, x: &Array2<f64>, y: &[i64]) -> Result<(), ClassifierError> {
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(ClassifierError::InvalidParameter(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }

        let n_samples = x.nrows() as f64;
        let n_features = x.ncols();
        let classes = unique_classes(y);
        let n_classes = classes.len();

        let mean = x.mean_axis(Axis(0)).ok_or(ClassifierError::EmptyTrainingSet)?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-12 { s } else { 1.0 });
        let xs = (x - &mean) / &scale;

        let mut targets = Array2::<f64>::zeros((x.nrows(), n_classes));
        for (row, label) in y.iter().enumerate() {
            // classes is sorted and built from y, so the label is always present
            if let Ok(col) = classes.binary_search(label) {
                targets[[row, col]] = 1.0;
            }
        }

        let mut weights = Array2::<f64>::zeros((n_features, n_classes));
        let mut bias = Array1::<f64>::zeros(n_classes);

        for _ in 0..self.max_iter {
            let probabilities = Self::softmax(xs.dot(&weights) + &bias);
            let errors = probabilities - &targets;

            let grad_w = xs.t().dot(&errors) / n_samples + &weights * self.alpha;
            let grad_b = errors.sum_axis(Axis(0)) / n_samples;

            let grad_norm = grad_w
                .iter()
                .chain(grad_b.iter())
                .map(|g| g * g)
                .sum::<f64>()
                .sqrt();
            if grad_norm < self.tol {
                break;
            }

            weights.scaled_add(-self.learning_rate, &grad_w);
            bias.scaled_add(-self.learning_rate, &grad_b);
        }

        if weights.iter().chain(bias.iter()).any(|v| !v.is_finite()) {
            return Err(ClassifierError::NonFinite("fitted coefficients"));
        }

        self.classes = classes;
        self.coefficients = Some(weights);
        self.intercepts = Some(bias);
        self.feature_mean = Some(mean);
        self.feature_scale = Some(scale);
        Ok(())
    }

    /// Class probabilities, one column per entry of [`classes`](Self::classes)
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>, ClassifierError> {
        let (weights, bias) = match (&self.coefficients, &self.intercepts) {
            (Some(w), Some(b)) => (w, b),
            _ => return Err(ClassifierError::NotFitted),
        };
        let xs = self.standardize(x)?;
        Ok(Self::softmax(xs.dot(weights) + bias))
    }

    /// Most probable label per row; ties go to the smaller label
    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<i64>, ClassifierError> {
        let proba = self.predict_proba(x)?;
        Ok(proba
            .rows()
            .into_iter()
            .map(|row| {
                let mut best = 0;
                for (idx, p) in row.iter().enumerate() {
                    if *p > row[best] {
                        best = idx;
                    }
                }
                self.classes[best]
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_binary_separation() {
        let x = array![[1.0, 1.0], [1.5, 1.2], [1.2, 0.8], [6.0, 5.0], [5.5, 6.2], [6.3, 5.8]];
        let y = vec![0, 0, 0, 1, 1, 1];

        let mut model = LogisticRegression::new();
        model.fit(&x, &y).unwrap();

        assert_eq!(model.predict(&x).unwrap(), y);
        assert_eq!(model.predict(&array![[1.1, 1.0], [6.1, 6.0]]).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [2.0, 2.0], [3.0, 1.0]];
        let y = vec![2, 5, 7, 5];

        let mut model = LogisticRegression::new().with_max_iter(50);
        model.fit(&x, &y).unwrap();

        let proba = model.predict_proba(&x).unwrap();
        assert_eq!(proba.ncols(), 3);
        for row in proba.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert_eq!(model.classes(), &[2, 5, 7]);
    }

    #[test]
    fn test_constant_feature_does_not_produce_nan() {
        let x = array![[1.0, 3.0], [1.0, 4.0], [1.0, 9.0], [1.0, 10.0]];
        let y = vec![0, 0, 1, 1];

        let mut model = LogisticRegression::new();
        model.fit(&x, &y).unwrap();
        assert_eq!(model.predict(&x).unwrap(), y);
    }

    #[test]
    fn test_predict_before_fit() {
        let model = LogisticRegression::new();
        assert!(matches!(
            model.predict(&array![[1.0]]),
            Err(ClassifierError::NotFitted)
        ));
    }

    #[test]
    fn test_validate_catches_truncated_classes() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 1.0]];
        let mut model = LogisticRegression::new().with_max_iter(20);
        assert!(matches!(model.validate(), Err(ClassifierError::NotFitted)));

        model.fit(&x, &[0, 1, 2]).unwrap();
        model.validate().unwrap();

        model.classes.pop();
        assert!(matches!(
            model.validate(),
            Err(ClassifierError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_predict_wrong_width() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let mut model = LogisticRegression::new();
        model.fit(&x, &[0, 1]).unwrap();
        assert!(matches!(
            model.predict(&array![[1.0, 2.0, 3.0]]),
            Err(ClassifierError::ShapeMismatch { .. })
        ));
    }
}
