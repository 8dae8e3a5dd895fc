//! Held-out evaluation metrics

use std::collections::BTreeMap;

/// Fraction of predictions equal to the true label. Empty input scores 0.
pub fn accuracy(y_true: &[i64], y_pred: &[i64]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true
        .iter()
        .zip(y_pred)
        .filter(|(actual, predicted)| actual == predicted)
        .count();
    correct as f64 / y_true.len() as f64
}

/// Per-class F1 averaged with weights equal to each class's support in `y_true`.
///
/// Classes that only appear in `y_pred` have zero support and do not
/// contribute; a class with no true or predicted positives scores 0.
pub fn weighted_f1(y_true: &[i64], y_pred: &[i64]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }

    #[derive(Default)]
    struct Counts {
        tp: usize,
        fp: usize,
        fn_: usize,
        support: usize,
    }

    let mut per_class: BTreeMap<i64, Counts> = BTreeMap::new();
    for (&actual, &predicted) in y_true.iter().zip(y_pred) {
        per_class.entry(actual).or_default().support += 1;
        if actual == predicted {
            per_class.entry(actual).or_default().tp += 1;
        } else {
            per_class.entry(actual).or_default().fn_ += 1;
            per_class.entry(predicted).or_default().fp += 1;
        }
    }

    let total = y_true.len() as f64;
    per_class
        .values()
        .filter(|c| c.support > 0)
        .map(|c| {
            let denominator = 2 * c.tp + c.fp + c.fn_;
            let f1 = if denominator == 0 {
                0.0
            } else {
                2.0 * c.tp as f64 / denominator as f64
            };
            f1 * c.support as f64 / total
        })
        .sum()
}
