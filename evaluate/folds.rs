//! # Stratified Fold Assignment
//!
//! Partitions record indices into `n_folds` disjoint test folds whose class
//! composition tracks the composition of the whole dataset. The stratification
//! key is deliberately separate from the fitting target: the cohort workflow
//! balances folds on the original cohort label while fitting a collapsed
//! binary or severity label.
//!
//! Assignment is a pure function of `(strata, n_folds, seed)`: members of each
//! stratum are shuffled with a seeded generator and dealt round-robin into the
//! folds, with the dealing position carried over from one stratum to the next
//! so that total fold sizes never differ by more than one record.

use crate::harness::EvaluationError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::BTreeMap;

/// The fold membership of every record in a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoldAssignment {
    fold_of: Vec<usize>,
    n_folds: usize,
}

/// Train and test indices for a single cross-validation iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSplit {
    pub fold: usize,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl FoldAssignment {
    /// Builds a stratified, seeded assignment of `strata.len()` records into `n_folds` folds.
    ///
    /// Fails with a configuration error when `n_folds < 2` or when some stratum has
    /// fewer members than there are folds, since a fold could then miss that stratum.
    pub fn stratified(
        strata: &[usize],
        n_folds: usize,
        seed: u64,
    ) -> Result<Self, EvaluationError> {
        if n_folds < 2 {
            return Err(EvaluationError::TooFewFolds(n_folds));
        }
        if strata.is_empty() {
            return Err(EvaluationError::EmptyDataset);
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (index, &stratum) in strata.iter().enumerate() {
            groups.entry(stratum).or_default().push(index);
        }

        if let Some((&stratum, members)) = groups.iter().min_by_key(|(_, members)| members.len()) {
            if members.len() < n_folds {
                return Err(EvaluationError::FoldCountExceedsStratum {
                    n_folds,
                    stratum,
                    count: members.len(),
                });
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut fold_of = vec![0; strata.len()];
        let mut next_fold = 0;
        for members in groups.values_mut() {
            members.shuffle(&mut rng);
            for &index in members.iter() {
                fold_of[index] = next_fold;
                next_fold = (next_fold + 1) % n_folds;
            }
        }

        log::debug!(
            "Assigned {} records to {} folds across {} strata",
            strata.len(),
            n_folds,
            groups.len()
        );

        Ok(Self { fold_of, n_folds })
    }

    pub fn n_folds(&self) -> usize {
        self.n_folds
    }

    /// Number of records covered by the assignment.
    pub fn len(&self) -> usize {
        self.fold_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fold_of.is_empty()
    }

    /// The test fold that holds record `index`.
    pub fn fold_of(&self, index: usize) -> usize {
        self.fold_of[index]
    }

    /// Record indices held out in `fold`, in ascending order.
    pub fn test_indices(&self, fold: usize) -> Vec<usize> {
        self.indices_where(|assigned| assigned == fold)
    }

    /// Record indices used for fitting in `fold`, in ascending order.
    pub fn train_indices(&self, fold: usize) -> Vec<usize> {
        self.indices_where(|assigned| assigned != fold)
    }

    pub fn split(&self, fold: usize) -> FoldSplit {
        FoldSplit {
            fold,
            train: self.train_indices(fold),
            test: self.test_indices(fold),
        }
    }

    pub fn fold_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_folds];
        for &fold in &self.fold_of {
            sizes[fold] += 1;
        }
        sizes
    }

    fn indices_where(&self, keep: impl Fn(usize) -> bool) -> Vec<usize> {
        self.fold_of
            .iter()
            .enumerate()
            .filter(|&(_, &fold)| keep(fold))
            .map(|(index, _)| index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn balanced_strata(n: usize, classes: usize) -> Vec<usize> {
        (0..n).map(|i| i % classes).collect()
    }

    #[test]
    fn test_folds_partition_every_index_exactly_once() {
        let strata = vec![0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 2, 0, 1, 2, 2];
        let assignment = FoldAssignment::stratified(&strata, 3, 11).unwrap();

        let mut seen = HashSet::new();
        for fold in 0..assignment.n_folds() {
            for index in assignment.test_indices(fold) {
                assert!(seen.insert(index), "index {index} appeared in two test folds");
            }
        }
        assert_eq!(seen.len(), strata.len());

        for fold in 0..assignment.n_folds() {
            let split = assignment.split(fold);
            assert_eq!(split.train.len() + split.test.len(), strata.len());
            assert!(split.train.iter().all(|i| !split.test.contains(i)));
        }
    }

    #[test]
    fn test_balanced_classes_give_equal_fold_sizes() {
        let strata = balanced_strata(200, 2);
        let assignment = FoldAssignment::stratified(&strata, 10, 0).unwrap();
        assert_eq!(assignment.fold_sizes(), vec![20; 10]);

        for fold in 0..10 {
            let positives = assignment
                .test_indices(fold)
                .iter()
                .filter(|&&i| strata[i] == 1)
                .count();
            assert_eq!(positives, 10);
        }
    }

    #[test]
    fn test_fold_sizes_differ_by_at_most_one() {
        let strata: Vec<usize> = (0..103)
            .map(|i| if i < 31 { 0 } else if i < 70 { 1 } else { 2 })
            .collect();
        let assignment = FoldAssignment::stratified(&strata, 7, 3).unwrap();
        let sizes = assignment.fold_sizes();
        let min = *sizes.iter().min().unwrap();
        let max = *sizes.iter().max().unwrap();
        assert!(max - min <= 1, "unbalanced fold sizes {sizes:?}");
        assert_eq!(sizes.iter().sum::<usize>(), 103);
    }

    #[test]
    fn test_every_stratum_is_represented_in_every_fold() {
        let strata: Vec<usize> = (0..60).map(|i| if i < 10 { 0 } else { 1 + i % 2 }).collect();
        let assignment = FoldAssignment::stratified(&strata, 10, 5).unwrap();
        for fold in 0..10 {
            let present: HashSet<usize> = assignment
                .test_indices(fold)
                .iter()
                .map(|&i| strata[i])
                .collect();
            assert_eq!(present.len(), 3, "fold {fold} is missing a stratum");
        }
    }

    #[test]
    fn test_assignment_is_deterministic_for_a_seed() {
        let strata = balanced_strata(90, 3);
        let first = FoldAssignment::stratified(&strata, 5, 42).unwrap();
        let second = FoldAssignment::stratified(&strata, 5, 42).unwrap();
        let other = FoldAssignment::stratified(&strata, 5, 43).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn test_rejects_fewer_than_two_folds() {
        let err = FoldAssignment::stratified(&[0, 1, 0, 1], 1, 0).unwrap_err();
        assert!(matches!(err, EvaluationError::TooFewFolds(1)));
    }

    #[test]
    fn test_rejects_fold_count_above_smallest_stratum() {
        let strata = vec![0, 0, 0, 0, 0, 1, 1];
        let err = FoldAssignment::stratified(&strata, 3, 0).unwrap_err();
        match err {
            EvaluationError::FoldCountExceedsStratum {
                n_folds,
                stratum,
                count,
            } => {
                assert_eq!(n_folds, 3);
                assert_eq!(stratum, 1);
                assert_eq!(count, 2);
            }
            other => panic!("Expected FoldCountExceedsStratum, got {other:?}"),
        }
    }
}
