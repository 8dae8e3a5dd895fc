//! CART decision tree (Gini impurity), the base learner of the random forest

use super::ClassifierError;
use ndarray::{Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Decision tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        class: i64,
        n_samples: usize,
    },
    Split {
        feature_idx: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

/// Classification tree over class indices into a shared label table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    root: Option<TreeNode>,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features sampled per split; all when `None`
    pub max_features: Option<usize>,
}

impl Default for DecisionTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed training data shared by every recursive call
struct FitContext<'a> {
    x: &'a Array2<f64>,
    y: &'a [usize],
    classes: &'a [i64],
}

impl DecisionTree {
    pub fn new() -> Self {
        Self {
            root: None,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_max_features(mut self, n: usize) -> Self {
        self.max_features = Some(n.max(1));
        self
    }

    /// Fit on the rows named by `indices`.
    ///
    /// `y` holds positions into `classes` rather than raw labels so impurity
    /// counts can live in a flat vector.
    pub fn fit_indices<R: Rng>(
        &mut self,
        x: &Array2<f64>,
        y: &[usize],
        classes: &[i64],
        indices: &[usize],
        rng: &mut R,
    ) -> Result<(), ClassifierError> {
        if indices.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        let ctx = FitContext { x, y, classes };
        self.root = Some(self.build(&ctx, indices.to_vec(), 0, rng));
        Ok(())
    }

    fn build<R: Rng>(
        &self,
        ctx: &FitContext<'_>,
        indices: Vec<usize>,
        depth: usize,
        rng: &mut R,
    ) -> TreeNode {
        let counts = class_counts(ctx, &indices);
        let leaf = TreeNode::Leaf {
            class: ctx.classes[majority(&counts)],
            n_samples: indices.len(),
        };

        let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
        let depth_reached = self.max_depth.is_some_and(|d| depth >= d);
        if pure || depth_reached || indices.len() < self.min_samples_split {
            return leaf;
        }

        let parent_impurity = gini(&counts, indices.len());
        let Some((feature_idx, threshold)) = self.best_split(ctx, &indices, parent_impurity, rng)
        else {
            return leaf;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| ctx.x[[i, feature_idx]] <= threshold);

        TreeNode::Split {
            feature_idx,
            threshold,
            left: Box::new(self.build(ctx, left, depth + 1, rng)),
            right: Box::new(self.build(ctx, right, depth + 1, rng)),
        }
    }

    fn best_split<R: Rng>(
        &self,
        ctx: &FitContext<'_>,
        indices: &[usize],
        parent_impurity: f64,
        rng: &mut R,
    ) -> Option<(usize, f64)> {
        let n_features = ctx.x.ncols();
        let features: Vec<usize> = match self.max_features {
            Some(m) if m < n_features => rand::seq::index::sample(rng, n_features, m).into_vec(),
            _ => (0..n_features).collect(),
        };

        let n = indices.len();
        let total = class_counts(ctx, indices);
        let mut best: Option<(usize, f64, f64)> = None;

        for feature in features {
            let mut sorted = indices.to_vec();
            sorted.sort_by(|&a, &b| ctx.x[[a, feature]].total_cmp(&ctx.x[[b, feature]]));

            let mut left = vec![0usize; total.len()];
            let mut right = total.clone();

            for pos in 0..n - 1 {
                let class = ctx.y[sorted[pos]];
                left[class] += 1;
                right[class] -= 1;

                let value = ctx.x[[sorted[pos], feature]];
                let next = ctx.x[[sorted[pos + 1], feature]];
                if value == next {
                    continue;
                }

                let n_left = pos + 1;
                let n_right = n - n_left;
                if n_left < self.min_samples_leaf || n_right < self.min_samples_leaf {
                    continue;
                }

                let impurity = (n_left as f64 * gini(&left, n_left)
                    + n_right as f64 * gini(&right, n_right))
                    / n as f64;

                if best.map_or(true, |(_, _, b)| impurity < b - 1e-12) {
                    best = Some((feature, (value + next) / 2.0, impurity));
                }
            }
        }

        best.filter(|&(_, _, impurity)| impurity < parent_impurity - 1e-12)
            .map(|(feature, threshold, _)| (feature, threshold))
    }

    /// Predict the label of one feature row
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> Result<i64, ClassifierError> {
        let mut node = self.root.as_ref().ok_or(ClassifierError::NotFitted)?;
        loop {
            match node {
                TreeNode::Leaf { class, .. } => return Ok(*class),
                TreeNode::Split {
                    feature_idx,
                    threshold,
                    left,
                    right,
                } => {
                    let value = row.get(*feature_idx).ok_or_else(|| {
                        ClassifierError::ShapeMismatch {
                            expected: format!("at least {} features", feature_idx + 1),
                            actual: format!("{} features", row.len()),
                        }
                    })?;
                    node = if *value <= *threshold { left } else { right };
                }
            }
        }
    }

    /// Check every leaf label is in `classes` and every split reads a column
    /// below `n_features`
    pub fn validate(&self, classes: &[i64], n_features: usize) -> Result<(), ClassifierError> {
        let mut stack = vec![self.root.as_ref().ok_or(ClassifierError::NotFitted)?];
        while let Some(node) = stack.pop() {
            match node {
                TreeNode::Leaf { class, .. } => {
                    if classes.binary_search(class).is_err() {
                        return Err(ClassifierError::ShapeMismatch {
                            expected: format!("a label in {:?}", classes),
                            actual: format!("leaf label {}", class),
                        });
                    }
                }
                TreeNode::Split {
                    feature_idx,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature_idx >= n_features {
                        return Err(ClassifierError::ShapeMismatch {
                            expected: format!("{} features", n_features),
                            actual: format!("split on feature {}", feature_idx),
                        });
                    }
                    if threshold.is_nan() {
                        return Err(ClassifierError::NonFinite("split threshold"));
                    }
                    stack.push(left);
                    stack.push(right);
                }
            }
        }
        Ok(())
    }

    /// Depth of the fitted tree (a lone leaf has depth 0)
    pub fn depth(&self) -> usize {
        fn walk(node: &TreeNode) -> usize {
            match node {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Split { left, right, .. } => 1 + walk(left).max(walk(right)),
            }
        }
        self.root.as_ref().map_or(0, walk)
    }
}

fn class_counts(ctx: &FitContext<'_>, indices: &[usize]) -> Vec<usize> {
    let mut counts = vec![0usize; ctx.classes.len()];
    for &i in indices {
        counts[ctx.y[i]] += 1;
    }
    counts
}

/// Index of the most frequent class; the lowest index wins ties
fn majority(counts: &[usize]) -> usize {
    let mut best = 0;
    for (idx, &count) in counts.iter().enumerate() {
        if count > counts[best] {
            best = idx;
        }
    }
    best
}

fn gini(counts: &[usize], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / n;
            p * p
        })
        .sum::<f64>()
}
