//! Random forest classifier

use super::tree::DecisionTree;
use super::{unique_classes, ClassifierError};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Bagged ensemble of Gini trees with sqrt(n_features) sampled per split.
///
/// Tree `i` is seeded with `random_state + i`, so a fit is reproducible
/// regardless of how rayon schedules the trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub random_state: u64,
    trees: Vec<DecisionTree>,
    classes: Vec<i64>,
    n_features: usize,
}

impl Default for RandomForest {
    fn default() -> Self {
        Self::new(100)
    }
}

impl RandomForest {
    pub fn new(n_estimators: usize) -> Self {
        Self {
            n_estimators,
            max_depth: None,
            random_state: 42,
            trees: Vec::new(),
            classes: Vec::new(),
            n_features: 0,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &[i64]) -> Result<(), ClassifierError> {
        if self.n_estimators == 0 {
            return Err(ClassifierError::InvalidParameter(
                "n_estimators must be at least 1".to_string(),
            ));
        }

        let n_samples = x.nrows();
        let n_features = x.ncols();
        let max_features = ((n_features as f64).sqrt().ceil() as usize).max(1);

        let classes = unique_classes(y);
        let encoded: Vec<usize> = y
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or(0))
            .collect();

        let base_seed = self.random_state;
        let max_depth = self.max_depth;

        let trees = (0..self.n_estimators)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(base_seed.wrapping_add(tree_idx as u64));
                let sample: Vec<usize> = (0..n_samples)
                    .map(|_| rng.gen_range(0..n_samples))
                    .collect();

                let mut tree = DecisionTree::new().with_max_features(max_features);
                if let Some(depth) = max_depth {
                    tree = tree.with_max_depth(depth);
                }
                tree.fit_indices(x, &encoded, &classes, &sample, &mut rng)?;
                Ok(tree)
            })
            .collect::<Result<Vec<_>, ClassifierError>>()?;

        self.trees = trees;
        self.classes = classes;
        self.n_features = n_features;
        Ok(())
    }

    /// Check every tree against the shared label table and feature count
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.trees.is_empty() || self.classes.is_empty() {
            return Err(ClassifierError::NotFitted);
        }
        self.trees
            .iter()
            .try_for_each(|tree| tree.validate(&self.classes, self.n_features))
    }

    /// Majority vote over all trees; ties go to the smaller label
    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<i64>, ClassifierError> {
        if self.trees.is_empty() {
            return Err(ClassifierError::NotFitted);
        }
        if x.ncols() != self.n_features {
            return Err(ClassifierError::ShapeMismatch {
                expected: format!("{} features", self.n_features),
                actual: format!("{} features", x.ncols()),
            });
        }

        x.rows()
            .into_iter()
            .map(|row| {
                let mut votes = vec![0usize; self.classes.len()];
                for tree in &self.trees {
                    let label = tree.predict_row(row)?;
                    if let Ok(idx) = self.classes.binary_search(&label) {
                        votes[idx] += 1;
                    }
                }
                let mut best = 0;
                for (idx, &count) in votes.iter().enumerate() {
                    if count > votes[best] {
                        best = idx;
                    }
                }
                Ok(self.classes[best])
            })
            .collect()
    }
}
