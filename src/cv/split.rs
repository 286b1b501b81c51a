// Index splitting: one random train/test split per repetition, and K-fold
// partitions for inner penalty selection.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Train/test partition of the sample indices for one repetition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldSplit {
    pub fold: usize,
    pub seed: u64,
    /// Sorted ascending.
    pub train: Vec<usize>,
    /// Sorted ascending.
    pub test: Vec<usize>,
}

/// SplitMix64 finalizer. Spreads consecutive repetition indices across the
/// whole seed space.
pub fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed of repetition `fold`: depends only on the base seed and the index.
pub fn fold_seed(base_seed: u64, fold: usize) -> u64 {
    base_seed ^ splitmix64(fold as u64)
}

/// Shuffle `0..n` with `seed` and hold out `round(n * test_fraction)` rows,
/// at least one and at most `n - 1`. Needs `n >= 2`.
pub fn random_split(n: usize, test_fraction: f32, fold: usize, seed: u64) -> FoldSplit {
    let mut idx: Vec<usize> = (0..n).collect();
    idx.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_test = ((n as f32 * test_fraction).round() as usize).clamp(1, n.saturating_sub(1).max(1));
    let mut test = idx.split_off(n - n_test.min(n));
    let mut train = idx;
    train.sort_unstable();
    test.sort_unstable();
    FoldSplit { fold, seed, train, test }
}

/// Shuffled K-fold partition. The first `n % k` folds get one extra row.
#[derive(Debug, Clone)]
pub struct KFold {
    n_splits: usize,
    seed: u64,
}

impl KFold {
    pub fn new(n_splits: usize, seed: u64) -> Self {
        KFold { n_splits, seed }
    }

    /// `(train, test)` index pairs, positions into `0..n_samples`.
    pub fn split(&self, n_samples: usize) -> Vec<(Vec<usize>, Vec<usize>)> {
        let k = self.n_splits.clamp(1, n_samples.max(1));
        let mut indices: Vec<usize> = (0..n_samples).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(self.seed));

        let fold_size = n_samples / k;
        let remainder = n_samples % k;
        let mut folds = Vec::with_capacity(k);
        let mut start = 0;
        for i in 0..k {
            let end = start + fold_size + usize::from(i < remainder);
            let test = indices[start..end].to_vec();
            let mut train = Vec::with_capacity(n_samples - test.len());
            train.extend_from_slice(&indices[..start]);
            train.extend_from_slice(&indices[end..]);
            folds.push((train, test));
            start = end;
        }
        folds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fold_seeds_differ_and_repeat() {
        assert_eq!(fold_seed(42, 3), fold_seed(42, 3));
        assert_ne!(fold_seed(42, 0), fold_seed(42, 1));
        assert_ne!(fold_seed(42, 0), fold_seed(43, 0));
    }

    #[test]
    fn twenty_percent_of_a_hundred() {
        let split = random_split(100, 0.2, 0, 7);
        assert_eq!(split.test.len(), 20);
        assert_eq!(split.train.len(), 80);
        assert_eq!(split, random_split(100, 0.2, 0, 7));
    }

    #[test]
    fn kfold_spreads_the_remainder() {
        let sizes: Vec<usize> = KFold::new(4, 0).split(17).iter().map(|(_, t)| t.len()).collect();
        assert_eq!(sizes, vec![5, 4, 4, 4]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn random_split_partitions_indices(n in 2usize..300, frac in 0.01f32..0.99, seed in any::<u64>()) {
            let split = random_split(n, frac, 0, seed);
            prop_assert!(!split.test.is_empty());
            prop_assert!(!split.train.is_empty());
            let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
            all.sort_unstable();
            prop_assert_eq!(all, (0..n).collect::<Vec<_>>());
        }

        #[test]
        fn kfold_tests_cover_each_index_once(n in 1usize..200, k in 1usize..12, seed in any::<u64>()) {
            let folds = KFold::new(k, seed).split(n);
            let mut counts = vec![0usize; n];
            for (train, test) in &folds {
                prop_assert_eq!(train.len() + test.len(), n);
                for &i in test {
                    counts[i] += 1;
                    prop_assert!(!train.contains(&i));
                }
            }
            prop_assert!(counts.iter().all(|&c| c == 1));
        }
    }
}
