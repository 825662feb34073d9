//! Thresholded multi-label classification metrics, macro-averaged over labels.

use crate::error::{TrainingError, TrainingResult};
use std::collections::BTreeMap;

/// Probability at or above which a label counts as predicted.
const THRESHOLD: f32 = 0.5;

#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    tp: u64,
    fp: u64,
    fn_: u64,
}

/// Streaming F1, precision and recall.
///
/// A label whose denominator is zero (no predicted or no actual positives)
/// scores 0 for that statistic.
#[derive(Debug, Clone)]
pub struct MultilabelMetrics {
    counts: Vec<Counts>,
}

impl MultilabelMetrics {
    #[must_use]
    pub fn new(num_labels: usize) -> Self {
        Self { counts: vec![Counts::default(); num_labels] }
    }

    /// Accumulate a batch of probabilities against binary targets.
    pub fn update(&mut self, probs: &[Vec<f32>], targets: &[Vec<f32>]) -> TrainingResult<()> {
        if probs.len() != targets.len() {
            return Err(TrainingError::Trainer(format!(
                "metric batch mismatch: {} predictions, {} targets",
                probs.len(),
                targets.len()
            )));
        }
        let width = self.counts.len();
        for (p, t) in probs.iter().zip(targets) {
            if p.len() != width || t.len() != width {
                return Err(TrainingError::Trainer(format!(
                    "metric expects {width} labels, got {} predictions and {} targets",
                    p.len(),
                    t.len()
                )));
            }
            for ((counts, &prob), &target) in self.counts.iter_mut().zip(p).zip(t) {
                match (prob >= THRESHOLD, target >= 0.5) {
                    (true, true) => counts.tp += 1,
                    (true, false) => counts.fp += 1,
                    (false, true) => counts.fn_ += 1,
                    (false, false) => {}
                }
            }
        }
        Ok(())
    }

    /// `{prefix}f1`, `{prefix}precision`, `{prefix}recall`.
    #[must_use]
    pub fn compute(&self, prefix: &str) -> BTreeMap<String, f64> {
        let n = self.counts.len().max(1) as f64;
        let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
        for c in &self.counts {
            precision += ratio(c.tp, c.tp + c.fp);
            recall += ratio(c.tp, c.tp + c.fn_);
            f1 += ratio(2 * c.tp, 2 * c.tp + c.fp + c.fn_);
        }
        BTreeMap::from([
            (format!("{prefix}f1"), f1 / n),
            (format!("{prefix}precision"), precision / n),
            (format!("{prefix}recall"), recall / n),
        ])
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(100.0) > 0.999);
        assert!(sigmoid(-100.0) >= 0.0);
    }

    #[test]
    fn test_perfect_predictions() {
        let mut metrics = MultilabelMetrics::new(2);
        metrics.update(&[vec![0.9, 0.1], vec![0.2, 0.8]], &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let scores = metrics.compute("val_");
        assert_eq!(scores["val_f1"], 1.0);
        assert_eq!(scores["val_precision"], 1.0);
        assert_eq!(scores["val_recall"], 1.0);
    }

    #[test]
    fn test_macro_average() {
        let mut metrics = MultilabelMetrics::new(2);
        // label 0: tp=1 fp=1 -> p=0.5 r=1 f1=2/3; label 1: fn=1 -> all 0
        metrics.update(&[vec![0.7, 0.1], vec![0.6, 0.2]], &[vec![1.0, 1.0], vec![0.0, 0.0]]).unwrap();
        let scores = metrics.compute("");
        assert!((scores["precision"] - 0.25).abs() < 1e-12);
        assert!((scores["recall"] - 0.5).abs() < 1e-12);
        assert!((scores["f1"] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut metrics = MultilabelMetrics::new(1);
        metrics.update(&[vec![0.5]], &[vec![1.0]]).unwrap();
        assert_eq!(metrics.compute("")["recall"], 1.0);

        let mut metrics = MultilabelMetrics::new(1);
        metrics.update(&[vec![0.4999]], &[vec![1.0]]).unwrap();
        assert_eq!(metrics.compute("")["recall"], 0.0);
    }

    #[test]
    fn test_width_mismatch_is_an_error() {
        let mut metrics = MultilabelMetrics::new(3);
        assert!(metrics.update(&[vec![0.5, 0.5]], &[vec![1.0, 0.0]]).is_err());
        assert!(metrics.update(&[vec![0.5, 0.5, 0.5]], &[]).is_err());
    }
}
