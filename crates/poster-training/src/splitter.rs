//! Multi-label iterative stratification.
//!
//! [`IterativeStratifier`] partitions sample indices into folds whose per-tag
//! positive rates track the full dataset. It is greedy and label-driven: the
//! rarest remaining tag is placed first, each of its samples going to the fold
//! that still wants that tag most. Unlabelled samples fill the folds' remaining
//! size targets last.
//!
//! [`stratify_subsets`] composes two calls into a train/valid/test split.

use crate::annotations::AnnotationTable;
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Allowed distance between the fraction sum and 1.0.
pub const FRACTION_TOLERANCE: f64 = 1e-6;

/// Greedy label-by-label stratified splitter.
#[derive(Debug, Clone)]
pub struct IterativeStratifier {
    fractions: Vec<f64>,
    seed: u64,
}

impl IterativeStratifier {
    /// Fractions must be finite, non-negative and sum to 1.0 within [`FRACTION_TOLERANCE`].
    pub fn new(fractions: Vec<f64>, seed: u64) -> TrainingResult<Self> {
        if fractions.is_empty() {
            return Err(TrainingError::Split("at least one target fraction is required".to_string()));
        }
        if let Some(bad) = fractions.iter().find(|f| !f.is_finite() || **f < 0.0) {
            return Err(TrainingError::Split(format!("target fraction {bad} must be finite and >= 0")));
        }
        let sum: f64 = fractions.iter().sum();
        if (sum - 1.0).abs() > FRACTION_TOLERANCE {
            return Err(TrainingError::Split(format!("target fractions sum to {sum}, expected 1.0")));
        }
        let fractions = fractions.into_iter().map(|f| f / sum).collect();
        Ok(Self { fractions, seed })
    }

    /// Partition `0..samples.len()` into one ascending index set per fraction.
    ///
    /// `samples` is only checked for length; identity is positional.
    pub fn split<S, L: AsRef<[u8]>>(&self, samples: &[S], labels: &[L]) -> TrainingResult<Vec<Vec<usize>>> {
        if samples.len() != labels.len() {
            return Err(TrainingError::Split(format!(
                "{} samples but {} label vectors",
                samples.len(),
                labels.len()
            )));
        }
        let width = label_width(labels)?;
        let folds = self.assign(labels, width);
        debug!(
            samples = samples.len(),
            labels = width,
            sizes = ?folds.iter().map(Vec::len).collect::<Vec<_>>(),
            "iterative stratification finished"
        );
        Ok(folds)
    }

    fn assign<L: AsRef<[u8]>>(&self, labels: &[L], width: usize) -> Vec<Vec<usize>> {
        let n = labels.len();
        let k = self.fractions.len();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let eligible: Vec<usize> = (0..k).filter(|&f| self.fractions[f] > 0.0).collect();

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut rng);

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); width];
        for &i in &order {
            for (l, &v) in labels[i].as_ref().iter().enumerate() {
                if v == 1 {
                    members[l].push(i);
                }
            }
        }

        let mut remaining: Vec<usize> = members.iter().map(Vec::len).collect();
        let mut total_demand = apportion(n, &self.fractions);
        let mut label_demand: Vec<Vec<i64>> = self
            .fractions
            .iter()
            .map(|&f| remaining.iter().map(|&c| (f * c as f64).round() as i64).collect())
            .collect();

        let mut assigned = vec![false; n];
        let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];

        while let Some(label) = next_label(&remaining, &label_demand) {
            for &sample in &members[label] {
                if assigned[sample] {
                    continue;
                }
                let fold = pick_fold(&eligible, |f| (label_demand[f][label], total_demand[f]), &mut rng);
                assigned[sample] = true;
                folds[fold].push(sample);
                total_demand[fold] -= 1;
                for (l, &v) in labels[sample].as_ref().iter().enumerate() {
                    if v == 1 {
                        label_demand[fold][l] -= 1;
                        remaining[l] -= 1;
                    }
                }
            }
        }

        for &sample in &order {
            if assigned[sample] {
                continue;
            }
            let fold = pick_fold(&eligible, |f| (total_demand[f], 0), &mut rng);
            assigned[sample] = true;
            folds[fold].push(sample);
            total_demand[fold] -= 1;
        }

        for fold in &mut folds {
            fold.sort_unstable();
        }
        folds
    }
}

fn label_width<L: AsRef<[u8]>>(labels: &[L]) -> TrainingResult<usize> {
    let Some(first) = labels.first() else {
        return Ok(0);
    };
    let width = first.as_ref().len();
    if width == 0 {
        return Err(TrainingError::Split("label vectors must have at least one column".to_string()));
    }
    for (idx, row) in labels.iter().enumerate() {
        let row = row.as_ref();
        if row.len() != width {
            return Err(TrainingError::Split(format!(
                "label vector {idx} has width {}, expected {width}",
                row.len()
            )));
        }
        if row.iter().any(|&v| v > 1) {
            return Err(TrainingError::Split(format!("label vector {idx} is not binary")));
        }
    }
    Ok(width)
}

/// Largest-remainder apportionment of `n` items; zero fractions get nothing.
fn apportion(n: usize, fractions: &[f64]) -> Vec<i64> {
    let exact: Vec<f64> = fractions.iter().map(|f| f * n as f64).collect();
    let mut sizes: Vec<i64> = exact.iter().map(|e| e.floor() as i64).collect();
    let mut leftover = n as i64 - sizes.iter().sum::<i64>();

    let mut by_remainder: Vec<usize> = (0..fractions.len()).filter(|&f| fractions[f] > 0.0).collect();
    by_remainder.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    let mut cursor = 0;
    while leftover > 0 && !by_remainder.is_empty() {
        sizes[by_remainder[cursor % by_remainder.len()]] += 1;
        leftover -= 1;
        cursor += 1;
    }
    sizes
}

/// Label with the fewest unassigned positives; ties on outstanding demand, then index.
fn next_label(remaining: &[usize], label_demand: &[Vec<i64>]) -> Option<usize> {
    (0..remaining.len())
        .filter(|&l| remaining[l] > 0)
        .min_by_key(|&l| {
            let demand: i64 = label_demand.iter().map(|fold| fold[l].max(0)).sum();
            (remaining[l], demand, l)
        })
}

fn pick_fold(eligible: &[usize], key: impl Fn(usize) -> (i64, i64), rng: &mut StdRng) -> usize {
    let best = eligible.iter().map(|&f| key(f)).max().unwrap_or_default();
    let tied: Vec<usize> = eligible.iter().copied().filter(|&f| key(f) == best).collect();
    match tied.len() {
        0 => 0,
        1 => tied[0],
        len => tied[rng.gen_range(0..len)],
    }
}

/// One of the three persisted subsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subset {
    Train,
    Valid,
    Test,
}

impl Subset {
    pub const ALL: [Subset; 3] = [Subset::Train, Subset::Valid, Subset::Test];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for Subset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three disjoint tables produced by [`stratify_subsets`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subsets {
    pub train: AnnotationTable,
    pub valid: AnnotationTable,
    pub test: AnnotationTable,
}

impl Subsets {
    #[must_use]
    pub fn get(&self, subset: Subset) -> &AnnotationTable {
        match subset {
            Subset::Train => &self.train,
            Subset::Valid => &self.valid,
            Subset::Test => &self.test,
        }
    }

    /// Image name to subset.
    #[must_use]
    pub fn assignment(&self) -> BTreeMap<String, Subset> {
        Subset::ALL
            .iter()
            .flat_map(|&s| self.get(s).records().iter().map(move |r| (r.image_name.clone(), s)))
            .collect()
    }
}

/// Split into train / valid / test.
///
/// The first stage separates `train_fraction` of the rows from the rest; the
/// rest is then halved into test and valid. The halving is fixed, not configured.
pub fn stratify_subsets(table: &AnnotationTable, train_fraction: f64, seed: u64) -> TrainingResult<Subsets> {
    if !(train_fraction > 0.0 && train_fraction < 1.0) {
        return Err(TrainingError::Split(format!("train fraction {train_fraction} must be in (0, 1)")));
    }

    let first = IterativeStratifier::new(vec![1.0 - train_fraction, train_fraction], seed)?
        .split(&table.image_names(), &table.label_rows())?;
    let [rest_idx, train_idx]: [Vec<usize>; 2] = first
        .try_into()
        .map_err(|_| TrainingError::Split("first stage must yield two folds".to_string()))?;
    let rest = table.select(&rest_idx);

    let second = IterativeStratifier::new(vec![0.5, 0.5], seed)?.split(&rest.image_names(), &rest.label_rows())?;
    let [test_idx, valid_idx]: [Vec<usize>; 2] = second
        .try_into()
        .map_err(|_| TrainingError::Split("second stage must yield two folds".to_string()))?;

    let subsets = Subsets { train: table.select(&train_idx), valid: rest.select(&valid_idx), test: rest.select(&test_idx) };
    info!(
        train = subsets.train.len(),
        valid = subsets.valid.len(),
        test = subsets.test.len(),
        "Stratifying dataset is completed"
    );
    Ok(subsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationRecord;
    use std::collections::HashSet;

    fn synthetic_labels(n: usize, width: usize, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..width).map(|l| u8::from(rng.gen_bool(0.1 + 0.15 * l as f64))).collect())
            .collect()
    }

    fn assert_partition(folds: &[Vec<usize>], n: usize) {
        let mut seen = HashSet::new();
        for fold in folds {
            for &i in fold {
                assert!(i < n, "index {i} out of range");
                assert!(seen.insert(i), "index {i} assigned twice");
            }
        }
        assert_eq!(seen.len(), n);
    }

    fn table_from(labels: &[Vec<u8>]) -> AnnotationTable {
        let width = labels.first().map_or(0, Vec::len);
        let tags = (0..width).map(|l| format!("tag_{l}")).collect();
        let records = labels
            .iter()
            .enumerate()
            .map(|(i, l)| AnnotationRecord { image_name: format!("img_{i}"), labels: l.clone() })
            .collect();
        AnnotationTable::new(tags, records).unwrap()
    }

    #[test]
    fn test_split_is_a_partition() {
        let labels = synthetic_labels(500, 6, 7);
        let ids: Vec<usize> = (0..labels.len()).collect();
        let folds = IterativeStratifier::new(vec![0.2, 0.8], 42).unwrap().split(&ids, &labels).unwrap();
        assert_eq!(folds.len(), 2);
        assert_partition(&folds, labels.len());
        for fold in &folds {
            assert!(fold.windows(2).all(|w| w[0] < w[1]), "fold indices must be ascending");
        }
    }

    #[test]
    fn test_split_is_deterministic() {
        let labels = synthetic_labels(300, 4, 3);
        let ids: Vec<usize> = (0..labels.len()).collect();
        let splitter = IterativeStratifier::new(vec![0.3, 0.7], 99).unwrap();
        assert_eq!(splitter.split(&ids, &labels).unwrap(), splitter.split(&ids, &labels).unwrap());
    }

    #[test]
    fn test_single_tag_balance() {
        let labels: Vec<Vec<u8>> = (0..200).map(|i| vec![u8::from(i % 2 == 0)]).collect();
        let ids: Vec<usize> = (0..labels.len()).collect();
        let folds = IterativeStratifier::new(vec![0.8, 0.2], 42).unwrap().split(&ids, &labels).unwrap();

        assert_eq!(folds[0].len(), 160);
        assert_eq!(folds[1].len(), 40);
        for fold in &folds {
            let positives = fold.iter().filter(|&&i| labels[i][0] == 1).count();
            let rate = positives as f64 / fold.len() as f64;
            assert!((rate - 0.5).abs() <= 0.05, "positive rate {rate} drifted from 0.5");
        }
    }

    #[test]
    fn test_multi_tag_rates_track_population() {
        let labels = synthetic_labels(2000, 5, 11);
        let ids: Vec<usize> = (0..labels.len()).collect();
        let folds = IterativeStratifier::new(vec![0.2, 0.8], 1).unwrap().split(&ids, &labels).unwrap();

        for l in 0..5 {
            let overall = labels.iter().filter(|row| row[l] == 1).count() as f64 / labels.len() as f64;
            for fold in &folds {
                let rate = fold.iter().filter(|&&i| labels[i][l] == 1).count() as f64 / fold.len() as f64;
                assert!((rate - overall).abs() <= 0.05, "tag {l}: fold rate {rate} vs overall {overall}");
            }
        }
    }

    #[test]
    fn test_all_zero_labels_still_partition_by_size() {
        let labels = vec![vec![0u8, 0, 0]; 1000];
        let ids: Vec<usize> = (0..labels.len()).collect();
        let folds = IterativeStratifier::new(vec![0.8, 0.2], 5).unwrap().split(&ids, &labels).unwrap();
        assert_partition(&folds, 1000);
        assert_eq!(folds[0].len(), 800);
        assert_eq!(folds[1].len(), 200);
    }

    #[test]
    fn test_zero_fraction_yields_empty_fold() {
        let labels = synthetic_labels(100, 3, 2);
        let ids: Vec<usize> = (0..labels.len()).collect();
        let folds = IterativeStratifier::new(vec![0.0, 1.0], 8).unwrap().split(&ids, &labels).unwrap();
        assert!(folds[0].is_empty());
        assert_eq!(folds[1].len(), 100);
    }

    #[test]
    fn test_three_way_split_partitions() {
        let labels = synthetic_labels(333, 4, 21);
        let ids: Vec<usize> = (0..labels.len()).collect();
        let folds = IterativeStratifier::new(vec![0.5, 0.25, 0.25], 4).unwrap().split(&ids, &labels).unwrap();
        assert_eq!(folds.len(), 3);
        assert_partition(&folds, labels.len());
    }

    #[test]
    fn test_empty_input_gives_empty_folds() {
        let labels: Vec<Vec<u8>> = Vec::new();
        let ids: Vec<usize> = Vec::new();
        let folds = IterativeStratifier::new(vec![0.5, 0.5], 0).unwrap().split(&ids, &labels).unwrap();
        assert_eq!(folds, vec![Vec::<usize>::new(), Vec::new()]);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert!(IterativeStratifier::new(vec![0.5, 0.4], 0).is_err());
        assert!(IterativeStratifier::new(vec![-0.5, 1.5], 0).is_err());
        assert!(IterativeStratifier::new(vec![], 0).is_err());
        assert!(IterativeStratifier::new(vec![f64::NAN, 1.0], 0).is_err());

        let splitter = IterativeStratifier::new(vec![0.5, 0.5], 0).unwrap();
        let ids = [0, 1, 2];
        assert!(splitter.split(&ids, &[vec![1u8], vec![0]]).is_err());
        assert!(splitter.split(&ids, &[vec![1u8, 0], vec![0], vec![1, 1]]).is_err());
        assert!(splitter.split(&ids, &[vec![2u8], vec![0], vec![1]]).is_err());
    }

    #[test]
    fn test_apportion_sums_exactly() {
        assert_eq!(apportion(10, &[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0]), vec![4, 3, 3]);
        assert_eq!(apportion(7, &[0.0, 1.0]), vec![0, 7]);
        assert_eq!(apportion(0, &[0.5, 0.5]), vec![0, 0]);
    }

    #[test]
    fn test_next_label_prefers_rarest_then_least_demand() {
        assert_eq!(next_label(&[4, 2, 3], &[vec![1, 1, 1], vec![1, 1, 1]]), Some(1));

        // labels 1 and 2 tie on remaining count; label 2 has less outstanding demand
        let demand = vec![vec![2, 1, 1, 0], vec![2, 1, 0, 0]];
        assert_eq!(next_label(&[4, 2, 2, 0], &demand), Some(2));
    }

    #[test]
    fn test_next_label_clamps_negative_demand() {
        // label 0 sums to -1 unclamped but 2 clamped, so label 1 (demand 1) wins
        let demand = vec![vec![-3, 1], vec![2, 0]];
        assert_eq!(next_label(&[2, 2], &demand), Some(1));
    }

    #[test]
    fn test_next_label_full_tie_takes_lowest_index() {
        let demand = vec![vec![1, 1, 1], vec![1, 1, 1]];
        assert_eq!(next_label(&[0, 3, 3], &demand), Some(1));
        assert_eq!(next_label(&[0, 0], &[vec![0, 0]]), None);
    }

    #[test]
    fn test_pick_fold_orders_label_then_total_demand() {
        let mut rng = StdRng::seed_from_u64(0);
        let total = [1_i64, 9];

        let label = [2_i64, 1];
        assert_eq!(pick_fold(&[0, 1], |f| (label[f], total[f]), &mut rng), 0);

        let label = [1_i64, 1];
        assert_eq!(pick_fold(&[0, 1], |f| (label[f], total[f]), &mut rng), 1);

        // an ineligible fold is never chosen, however much it wants the sample
        let label = [5_i64, 0];
        assert_eq!(pick_fold(&[1], |f| (label[f], total[f]), &mut rng), 1);
    }

    #[test]
    fn test_pick_fold_full_tie_is_seeded() {
        let draw = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..32).map(|_| pick_fold(&[0, 2], |_| (1, 1), &mut rng)).collect::<Vec<_>>()
        };
        let picks = draw(7);
        assert_eq!(picks, draw(7));
        assert!(picks.contains(&0) && picks.contains(&2));
        assert!(!picks.contains(&1));
    }

    #[test]
    fn test_label_column_order_breaks_full_ties() {
        // two tags, two positives each, sharing sample 0: tied on count and demand
        let mut forward: Vec<Vec<u8>> = vec![vec![1, 1], vec![1, 0], vec![0, 1]];
        forward.resize(10, vec![0, 0]);
        let swapped: Vec<Vec<u8>> = forward.iter().map(|row| vec![row[1], row[0]]).collect();
        let ids: Vec<usize> = (0..10).collect();

        let mut differing = 0;
        for seed in 0..32 {
            let splitter = IterativeStratifier::new(vec![0.6, 0.4], seed).unwrap();
            let a = splitter.split(&ids, &forward).unwrap();
            assert_eq!(a, splitter.split(&ids, &forward).unwrap());
            let b = splitter.split(&ids, &swapped).unwrap();

            for (folds, labels) in [(&a, &forward), (&b, &swapped)] {
                assert_eq!(folds.iter().map(Vec::len).collect::<Vec<_>>(), vec![6, 4]);
                for tag in 0..2 {
                    for fold in folds {
                        assert_eq!(fold.iter().filter(|&&i| labels[i][tag] == 1).count(), 1);
                    }
                }
            }
            if a != b {
                differing += 1;
            }
        }
        assert!(differing > 0, "column order never changed the assignment");
    }

    #[test]
    fn test_two_stage_sizes() {
        let table = table_from(&synthetic_labels(1000, 5, 17));
        let subsets = stratify_subsets(&table, 0.8, 42).unwrap();

        assert!((subsets.train.len() as i64 - 800).abs() <= 20, "train size {}", subsets.train.len());
        assert!((subsets.valid.len() as i64 - 100).abs() <= 15, "valid size {}", subsets.valid.len());
        assert!((subsets.test.len() as i64 - 100).abs() <= 15, "test size {}", subsets.test.len());
        assert_eq!(subsets.train.len() + subsets.valid.len() + subsets.test.len(), 1000);

        let assignment = subsets.assignment();
        assert_eq!(assignment.len(), 1000, "subsets must be pairwise disjoint and exhaustive");
        assert_eq!(subsets.train.tags(), table.tags());
    }

    #[test]
    fn test_two_stage_rejects_out_of_range_fraction() {
        let table = table_from(&synthetic_labels(10, 2, 1));
        assert!(stratify_subsets(&table, 0.0, 1).is_err());
        assert!(stratify_subsets(&table, 1.0, 1).is_err());
    }

    #[test]
    fn test_different_seeds_change_assignment() {
        let table = table_from(&synthetic_labels(400, 3, 5));
        let a = stratify_subsets(&table, 0.8, 1).unwrap();
        let b = stratify_subsets(&table, 0.8, 2).unwrap();
        assert_ne!(a.assignment(), b.assignment());
    }
}
