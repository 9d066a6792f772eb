//! In-memory datasets and train/validation splitting.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use hs_types::{config_error, HsResult, TrainingError};

/// Row-major features with one label (and optionally one weight) per row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<f64>,
    #[serde(default)]
    pub sample_weight: Option<Vec<f64>>,
}

impl Dataset {
    pub fn new(features: Vec<Vec<f64>>, labels: Vec<f64>) -> HsResult<Self> {
        if features.len() != labels.len() {
            return Err(TrainingError::Data {
                message: format!(
                    "{} feature rows but {} labels",
                    features.len(),
                    labels.len()
                ),
            }
            .into());
        }
        Ok(Self {
            features,
            labels,
            sample_weight: None,
        })
    }

    pub fn with_sample_weight(mut self, weights: Vec<f64>) -> HsResult<Self> {
        if weights.len() != self.labels.len() {
            return Err(TrainingError::Data {
                message: format!("{} weights for {} rows", weights.len(), self.labels.len()),
            }
            .into());
        }
        self.sample_weight = Some(weights);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rows at `indices`, in that order. Out-of-range indices are skipped.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let rows: Vec<usize> = indices.iter().copied().filter(|&i| i < self.len()).collect();
        Self {
            features: rows.iter().map(|&i| self.features[i].clone()).collect(),
            labels: rows.iter().map(|&i| self.labels[i]).collect(),
            sample_weight: self
                .sample_weight
                .as_ref()
                .map(|w| rows.iter().map(|&i| w[i]).collect()),
        }
    }

    /// The first `n` rows.
    pub fn head(&self, n: usize) -> Self {
        let indices: Vec<usize> = (0..n.min(self.len())).collect();
        self.subset(&indices)
    }
}

/// Train and validation row indices.
pub type SplitIndices = (Vec<usize>, Vec<usize>);

fn rng_for(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

/// Row indices grouped by label value, in order of the label's bit pattern.
fn by_class(labels: &[f64]) -> BTreeMap<u64, Vec<usize>> {
    let mut classes: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        classes.entry(label.to_bits()).or_default().push(i);
    }
    classes
}

/// Shuffled train/validation split holding out `valid_split` of the rows.
///
/// When `stratified`, the fraction is applied within each label class so both
/// sides keep the class proportions. Both index lists come back sorted.
pub fn train_valid_split(
    labels: &[f64],
    valid_split: f64,
    stratified: bool,
    seed: Option<u64>,
) -> HsResult<SplitIndices> {
    if !(valid_split > 0.0 && valid_split < 1.0) {
        return Err(config_error!("valid_split must be in (0, 1), got {valid_split}"));
    }
    let mut rng = rng_for(seed);

    let groups: Vec<Vec<usize>> = if stratified {
        by_class(labels).into_values().collect()
    } else {
        vec![(0..labels.len()).collect()]
    };

    let mut train = Vec::with_capacity(labels.len());
    let mut valid = Vec::new();
    for mut group in groups {
        group.shuffle(&mut rng);
        let n_valid = ((group.len() as f64) * valid_split).ceil() as usize;
        let n_valid = n_valid.min(group.len());
        valid.extend_from_slice(&group[..n_valid]);
        train.extend_from_slice(&group[n_valid..]);
    }
    train.sort_unstable();
    valid.sort_unstable();
    Ok((train, valid))
}

/// Shuffled K-fold split. Every row lands in exactly one validation fold.
///
/// Fold sizes differ by at most one. When `stratified`, each class is dealt
/// round-robin across the folds.
pub fn kfold_split(
    labels: &[f64],
    n_folds: usize,
    stratified: bool,
    seed: Option<u64>,
) -> HsResult<Vec<SplitIndices>> {
    if n_folds < 2 {
        return Err(config_error!("cv_n_folds must be at least 2, got {n_folds}"));
    }
    if n_folds > labels.len() {
        return Err(config_error!(
            "cv_n_folds ({n_folds}) exceeds the number of rows ({})",
            labels.len()
        ));
    }
    let mut rng = rng_for(seed);
    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); n_folds];

    if stratified {
        // each class continues dealing where the previous one stopped
        let mut offset = 0;
        for mut group in by_class(labels).into_values() {
            group.shuffle(&mut rng);
            let group_len = group.len();
            for (i, row) in group.into_iter().enumerate() {
                folds[(offset + i) % n_folds].push(row);
            }
            offset = (offset + group_len) % n_folds;
        }
    } else {
        let mut rows: Vec<usize> = (0..labels.len()).collect();
        rows.shuffle(&mut rng);
        let base = rows.len() / n_folds;
        let extra = rows.len() % n_folds;
        let mut start = 0;
        for (k, fold) in folds.iter_mut().enumerate() {
            let size = base + usize::from(k < extra);
            fold.extend_from_slice(&rows[start..start + size]);
            start += size;
        }
    }

    Ok(folds
        .iter()
        .map(|valid| {
            let mut valid = valid.clone();
            valid.sort_unstable();
            let train: Vec<usize> = (0..labels.len())
                .filter(|i| valid.binary_search(i).is_err())
                .collect();
            (train, valid)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<f64> {
        // 12 zeros, 8 ones
        (0..20).map(|i| if i < 12 { 0.0 } else { 1.0 }).collect()
    }

    #[test]
    fn dataset_rejects_mismatched_lengths() {
        assert!(Dataset::new(vec![vec![1.0]], vec![]).is_err());
        let ds = Dataset::new(vec![vec![1.0], vec![2.0]], vec![0.0, 1.0]).unwrap();
        assert!(ds.clone().with_sample_weight(vec![1.0]).is_err());
    }

    #[test]
    fn subset_keeps_weights_aligned() {
        let ds = Dataset::new(vec![vec![0.0], vec![1.0], vec![2.0]], vec![0.0, 1.0, 0.0])
            .unwrap()
            .with_sample_weight(vec![0.1, 0.2, 0.3])
            .unwrap();
        let sub = ds.subset(&[2, 0, 7]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.features, vec![vec![2.0], vec![0.0]]);
        assert_eq!(sub.sample_weight, Some(vec![0.3, 0.1]));
        assert_eq!(ds.head(10).len(), 3);
    }

    #[test]
    fn random_split_partitions_rows() {
        let (train, valid) = train_valid_split(&labels(), 0.2, false, Some(1)).unwrap();
        assert_eq!(valid.len(), 4);
        assert_eq!(train.len(), 16);
        let mut all: Vec<usize> = train.iter().chain(&valid).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn stratified_split_keeps_class_balance() {
        let labels = labels();
        let (_, valid) = train_valid_split(&labels, 0.25, true, Some(7)).unwrap();
        let ones = valid.iter().filter(|&&i| labels[i] == 1.0).count();
        assert_eq!(valid.len(), 5);
        assert_eq!(ones, 2);
    }

    #[test]
    fn seeded_split_is_reproducible() {
        let a = train_valid_split(&labels(), 0.3, false, Some(42)).unwrap();
        let b = train_valid_split(&labels(), 0.3, false, Some(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_split_fraction() {
        assert!(train_valid_split(&labels(), 0.0, false, None).is_err());
        assert!(train_valid_split(&labels(), 1.0, false, None).is_err());
    }

    #[test]
    fn kfold_covers_every_row_once() {
        for stratified in [false, true] {
            let folds = kfold_split(&labels(), 3, stratified, Some(5)).unwrap();
            assert_eq!(folds.len(), 3);
            let mut seen: Vec<usize> = folds.iter().flat_map(|(_, v)| v.clone()).collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..20).collect::<Vec<_>>());
            for (train, valid) in &folds {
                assert_eq!(train.len() + valid.len(), 20);
                assert!((6..=7).contains(&valid.len()), "fold size {}", valid.len());
            }
        }
    }

    #[test]
    fn stratified_kfold_never_leaves_a_fold_empty() {
        for (labels, n_folds) in [
            (vec![0.0, 0.0, 1.0], 3),
            (vec![0.0, 0.0, 1.0, 1.0], 4),
            (vec![0.0, 0.0, 0.0, 1.0, 2.0, 2.0, 2.0], 3),
        ] {
            let folds = kfold_split(&labels, n_folds, true, Some(0)).unwrap();
            let sizes: Vec<usize> = folds.iter().map(|(_, v)| v.len()).collect();
            let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
            assert!(*min > 0, "empty fold in {sizes:?}");
            assert!(max - min <= 1, "unbalanced folds {sizes:?}");
            assert_eq!(sizes.iter().sum::<usize>(), labels.len());
        }
    }

    #[test]
    fn kfold_rejects_bad_fold_counts() {
        assert!(kfold_split(&labels(), 1, false, None).is_err());
        assert!(kfold_split(&[0.0, 1.0], 3, false, None).is_err());
    }
}
