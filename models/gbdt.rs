//! # Second-Order Gradient Boosted Trees
//!
//! An additive ensemble of regression trees fitted to the first and second
//! derivatives of the loss at the current margin, in the style of xgboost's
//! `gbtree` booster with the exact greedy split finder.
//!
//! Objectives:
//! - two classes: binary logistic on a single margin, with an optional
//!   `scale_pos_weight` multiplying the gradient and hessian of positive records;
//! - more classes: softmax over one margin per class, one tree per class per round.
//!
//! For a node with gradient sum `G` and hessian sum `H` the optimal weight is
//! `-T(G) / (H + lambda)` where `T` soft-thresholds by `alpha`, and a split is kept
//! when `0.5 * (S_L + S_R - S_parent) - gamma` is positive with `S = T(G)^2 / (H + lambda)`.

use super::{
    Classifier, FittedModel, ModelError, check_feature_count, sigmoid, validate_training_set,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Lower bound on per-record hessians so that leaves never divide by zero.
const MIN_HESSIAN: f64 = 1e-16;
/// Loss reduction below which a split is treated as no improvement.
const MIN_SPLIT_GAIN: f64 = 1e-6;

/// Weighting of positive records in the binary objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalePosWeight {
    Fixed(f64),
    /// Negatives over positives in the training partition.
    Balanced,
}

impl Default for ScalePosWeight {
    fn default() -> Self {
        ScalePosWeight::Fixed(1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    pub num_rounds: usize,
    /// Shrinkage applied to every leaf weight.
    pub eta: f64,
    pub max_depth: usize,
    /// Fraction of training records sampled (without replacement) for each round.
    pub subsample: f64,
    pub min_child_weight: f64,
    pub reg_lambda: f64,
    pub reg_alpha: f64,
    /// Minimum loss reduction required to make a split.
    pub gamma: f64,
    /// Seed for row subsampling; the run seed is written here before fitting.
    #[serde(skip)]
    pub seed: u64,
    pub scale_pos_weight: ScalePosWeight,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            num_rounds: 40,
            eta: 0.05,
            max_depth: 6,
            subsample: 0.5,
            min_child_weight: 1.0,
            reg_lambda: 1.0,
            reg_alpha: 0.0,
            gamma: 0.0,
            seed: 0,
            scale_pos_weight: ScalePosWeight::default(),
        }
    }
}

impl BoostingParams {
    fn validate(&self) -> Result<(), ModelError> {
        let invalid =
            |name: &'static str, reason: String| Err(ModelError::InvalidParameter { name, reason });
        if self.num_rounds == 0 {
            return invalid("num_rounds", "must be at least 1".to_string());
        }
        if !(self.eta > 0.0 && self.eta <= 1.0) {
            return invalid("eta", format!("must lie in (0, 1], got {}", self.eta));
        }
        if self.max_depth == 0 {
            return invalid("max_depth", "must be at least 1".to_string());
        }
        if !(self.subsample > 0.0 && self.subsample <= 1.0) {
            return invalid("subsample", format!("must lie in (0, 1], got {}", self.subsample));
        }
        for (name, value) in [
            ("min_child_weight", self.min_child_weight),
            ("reg_lambda", self.reg_lambda),
            ("reg_alpha", self.reg_alpha),
            ("gamma", self.gamma),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return invalid(name, format!("must be a non-negative finite number, got {value}"));
            }
        }
        if let ScalePosWeight::Fixed(weight) = self.scale_pos_weight {
            if !(weight > 0.0 && weight.is_finite()) {
                return invalid(
                    "scale_pos_weight",
                    format!("must be a positive finite number, got {weight}"),
                );
            }
        }
        Ok(())
    }

    fn positive_weight(&self, y: &[usize]) -> f64 {
        match self.scale_pos_weight {
            ScalePosWeight::Fixed(weight) => weight,
            ScalePosWeight::Balanced => {
                let positives = y.iter().filter(|&&label| label == 1).count();
                if positives == 0 {
                    1.0
                } else {
                    (y.len() - positives) as f64 / positives as f64
                }
            }
        }
    }
}

pub struct GradientBoostedTrees {
    params: BoostingParams,
}

impl GradientBoostedTrees {
    pub fn new(params: BoostingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &BoostingParams {
        &self.params
    }

    /// Fits and returns the concrete ensemble, which also exposes staged predictions.
    pub fn fit_ensemble(
        &self,
        x: ArrayView2<f64>,
        y: &[usize],
        n_classes: usize,
    ) -> Result<BoostedEnsemble, ModelError> {
        validate_training_set(x, y, n_classes)?;
        self.params.validate()?;

        let n_rows = x.nrows();
        let n_groups = output_groups(n_classes);
        let positive_weight = if n_classes == 2 { self.params.positive_weight(y) } else { 1.0 };
        if n_classes == 2 {
            log::debug!("Binary logistic objective with positive weight {positive_weight:.4}");
        }

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let mut margins = Array2::<f64>::zeros((n_rows, n_groups));
        let mut gradients = Array2::<f64>::zeros((n_rows, n_groups));
        let mut hessians = Array2::<f64>::zeros((n_rows, n_groups));
        let mut rounds = Vec::with_capacity(self.params.num_rounds);

        for round in 0..self.params.num_rounds {
            let sampled = self.sample_rows(n_rows, &mut rng);

            if n_classes == 2 {
                for (row, &label) in y.iter().enumerate() {
                    let p = sigmoid(margins[[row, 0]]);
                    let weight = if label == 1 { positive_weight } else { 1.0 };
                    gradients[[row, 0]] = (p - f64::from(u8::from(label == 1))) * weight;
                    hessians[[row, 0]] = (p * (1.0 - p)).max(MIN_HESSIAN) * weight;
                }
            } else {
                for (row, &label) in y.iter().enumerate() {
                    let probabilities = softmax(margins.row(row));
                    for (class, &p) in probabilities.iter().enumerate() {
                        gradients[[row, class]] = p - f64::from(u8::from(label == class));
                        hessians[[row, class]] = (2.0 * p * (1.0 - p)).max(MIN_HESSIAN);
                    }
                }
            }

            let mut trees = Vec::with_capacity(n_groups);
            for group in 0..n_groups {
                let builder = TreeBuilder {
                    x,
                    gradients: gradients.column(group),
                    hessians: hessians.column(group),
                    params: &self.params,
                    nodes: Vec::new(),
                };
                let tree = builder.build(sampled.clone());
                for (row, margin) in margins.column_mut(group).iter_mut().enumerate() {
                    *margin += tree.predict_row(x.row(row));
                }
                trees.push(tree);
            }

            log::debug!(
                "[Boosting] round {}: {} sampled rows, {} nodes",
                round + 1,
                sampled.len(),
                trees.iter().map(|tree| tree.nodes.len()).sum::<usize>()
            );
            rounds.push(trees);
        }

        Ok(BoostedEnsemble {
            rounds,
            n_classes,
            n_features: x.ncols(),
        })
    }

    /// Bernoulli row sampling; an empty draw falls back to every row.
    fn sample_rows(&self, n_rows: usize, rng: &mut StdRng) -> Vec<usize> {
        if self.params.subsample >= 1.0 {
            return (0..n_rows).collect();
        }
        let sampled: Vec<usize> = (0..n_rows)
            .filter(|_| rng.gen_bool(self.params.subsample))
            .collect();
        if sampled.is_empty() {
            (0..n_rows).collect()
        } else {
            sampled
        }
    }
}

impl Classifier for GradientBoostedTrees {
    fn name(&self) -> &'static str {
        "boosted_trees"
    }

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: &[usize],
        n_classes: usize,
    ) -> Result<Box<dyn FittedModel>, ModelError> {
        Ok(Box::new(self.fit_ensemble(x, y, n_classes)?))
    }
}

fn output_groups(n_classes: usize) -> usize {
    if n_classes == 2 { 1 } else { n_classes }
}

fn softmax(margins: ArrayView1<f64>) -> Array1<f64> {
    let max = margins.iter().fold(f64::NEG_INFINITY, |acc, &m| acc.max(m));
    let exp = margins.mapv(|m| (m - max).exp());
    let total = exp.sum();
    exp / total
}

fn soft_threshold(sum: f64, alpha: f64) -> f64 {
    if sum > alpha {
        sum - alpha
    } else if sum < -alpha {
        sum + alpha
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut index = 0;
        loop {
            match self.nodes[index] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => index = if row[feature] < threshold { left } else { right },
            }
        }
    }

    fn count_splits(&self, counts: &mut Array1<f64>) {
        for node in &self.nodes {
            if let Node::Split { feature, .. } = node {
                counts[*feature] += 1.0;
            }
        }
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Grows one tree; `x` outlives the round while the gradient columns are rebuilt every round.
struct TreeBuilder<'x, 'r> {
    x: ArrayView2<'x, f64>,
    gradients: ArrayView1<'r, f64>,
    hessians: ArrayView1<'r, f64>,
    params: &'r BoostingParams,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_, '_> {
    fn build(mut self, rows: Vec<usize>) -> RegressionTree {
        self.grow(rows, 0);
        RegressionTree { nodes: self.nodes }
    }

    fn score(&self, gradient: f64, hessian: f64) -> f64 {
        soft_threshold(gradient, self.params.reg_alpha).powi(2) / (hessian + self.params.reg_lambda)
    }

    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let gradient: f64 = rows.iter().map(|&r| self.gradients[r]).sum();
        let hessian: f64 = rows.iter().map(|&r| self.hessians[r]).sum();
        let value = -soft_threshold(gradient, self.params.reg_alpha)
            / (hessian + self.params.reg_lambda)
            * self.params.eta;

        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { value });
        if depth >= self.params.max_depth {
            return id;
        }

        let Some(split) = self.best_split(&rows, gradient, hessian) else {
            return id;
        };
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| self.x[[r, split.feature]] < split.threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return id;
        }

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        id
    }

    /// Exact greedy search over every distinct value boundary of every feature.
    fn best_split(&self, rows: &[usize], gradient: f64, hessian: f64) -> Option<SplitCandidate> {
        let parent_score = self.score(gradient, hessian);
        let min_child_weight = self.params.min_child_weight;
        let mut best: Option<SplitCandidate> = None;
        let mut sorted = rows.to_vec();

        for feature in 0..self.x.ncols() {
            let column = self.x.column(feature);
            sorted.sort_by(|&a, &b| column[a].total_cmp(&column[b]));

            let mut left_gradient = 0.0;
            let mut left_hessian = 0.0;
            for window in sorted.windows(2) {
                let (current, next) = (window[0], window[1]);
                left_gradient += self.gradients[current];
                left_hessian += self.hessians[current];
                if column[current] == column[next] {
                    continue;
                }
                let right_hessian = hessian - left_hessian;
                if left_hessian < min_child_weight || right_hessian < min_child_weight {
                    continue;
                }
                let gain = 0.5
                    * (self.score(left_gradient, left_hessian)
                        + self.score(gradient - left_gradient, right_hessian)
                        - parent_score)
                    - self.params.gamma;
                if gain > MIN_SPLIT_GAIN && best.as_ref().is_none_or(|b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: 0.5 * (column[current] + column[next]),
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// A fitted ensemble: for every boosting round, one tree per output margin.
#[derive(Debug, Clone, PartialEq)]
pub struct BoostedEnsemble {
    rounds: Vec<Vec<RegressionTree>>,
    n_classes: usize,
    n_features: usize,
}

impl BoostedEnsemble {
    pub fn n_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Class scores using only the first `rounds` boosting rounds.
    pub fn predict_scores_at(
        &self,
        x: ArrayView2<f64>,
        rounds: usize,
    ) -> Result<Array2<f64>, ModelError> {
        check_feature_count(self.n_features, x)?;
        let mut margins = Array2::zeros((x.nrows(), output_groups(self.n_classes)));
        for trees in self.rounds.iter().take(rounds) {
            self.add_round(trees, x, &mut margins);
        }
        Ok(self.transform(&margins))
    }

    /// Class scores after each boosting round in turn, computed incrementally.
    pub fn staged_scores<'s, 'x>(
        &'s self,
        x: ArrayView2<'x, f64>,
    ) -> Result<impl Iterator<Item = Array2<f64>>, ModelError> {
        check_feature_count(self.n_features, x)?;
        let mut margins = Array2::zeros((x.nrows(), output_groups(self.n_classes)));
        Ok(self.rounds.iter().map(move |trees| {
            self.add_round(trees, x, &mut margins);
            self.transform(&margins)
        }))
    }

    /// Number of splits made on each feature across all trees.
    pub fn split_counts(&self) -> Array1<f64> {
        let mut counts = Array1::zeros(self.n_features);
        for tree in self.rounds.iter().flatten() {
            tree.count_splits(&mut counts);
        }
        counts
    }

    fn add_round(&self, trees: &[RegressionTree], x: ArrayView2<f64>, margins: &mut Array2<f64>) {
        for (group, tree) in trees.iter().enumerate() {
            for (row, margin) in margins.column_mut(group).iter_mut().enumerate() {
                *margin += tree.predict_row(x.row(row));
            }
        }
    }

    fn transform(&self, margins: &Array2<f64>) -> Array2<f64> {
        if self.n_classes == 2 {
            let mut scores = Array2::zeros((margins.nrows(), 2));
            for (row, &margin) in margins.column(0).iter().enumerate() {
                let p = sigmoid(margin);
                scores[[row, 0]] = 1.0 - p;
                scores[[row, 1]] = p;
            }
            return scores;
        }
        let mut scores = Array2::zeros(margins.raw_dim());
        for (mut out, row) in scores.rows_mut().into_iter().zip(margins.rows()) {
            out.assign(&softmax(row));
        }
        scores
    }
}

impl FittedModel for BoostedEnsemble {
    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn predict_scores(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        self.predict_scores_at(x, self.n_rounds())
    }

    fn feature_importance(&self) -> Option<Array1<f64>> {
        Some(self.split_counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn informative_and_noise(n: usize, seed: u64) -> (Array2<f64>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Array2::zeros((n, 2));
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let label = i % 2;
            x[[i, 0]] = label as f64 * 2.0 + rng.gen_range(-0.8..0.8);
            x[[i, 1]] = rng.gen_range(-1.0..1.0);
            y.push(label);
        }
        (x, y)
    }

    fn stumps(num_rounds: usize) -> BoostingParams {
        BoostingParams {
            num_rounds,
            eta: 0.3,
            max_depth: 1,
            subsample: 1.0,
            ..BoostingParams::default()
        }
    }

    #[test]
    fn test_binary_ensemble_learns_informative_feature() {
        let (x, y) = informative_and_noise(120, 7);
        let ensemble = GradientBoostedTrees::new(stumps(20))
            .fit_ensemble(x.view(), &y, 2)
            .unwrap();
        let scores = ensemble.predict_scores(x.view()).unwrap();
        let correct = y
            .iter()
            .enumerate()
            .filter(|&(i, &label)| usize::from(scores[[i, 1]] >= 0.5) == label)
            .count();
        assert!(correct >= 115, "only {correct} of 120 records classified correctly");

        let counts = ensemble.feature_importance().unwrap();
        assert_eq!(counts.len(), 2);
        assert!(counts[0] > counts[1], "split counts {counts:?}");
        assert_abs_diff_eq!(counts.sum(), 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_staged_scores_end_at_full_prediction() {
        let (x, y) = informative_and_noise(60, 8);
        let ensemble = GradientBoostedTrees::new(BoostingParams {
            num_rounds: 5,
            ..BoostingParams::default()
        })
        .fit_ensemble(x.view(), &y, 2)
        .unwrap();

        let staged: Vec<Array2<f64>> = ensemble.staged_scores(x.view()).unwrap().collect();
        assert_eq!(staged.len(), 5);
        let full = ensemble.predict_scores(x.view()).unwrap();
        for (a, b) in staged[4].iter().zip(full.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        let third = ensemble.predict_scores_at(x.view(), 3).unwrap();
        for (a, b) in staged[2].iter().zip(third.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }

        let untrained = ensemble.predict_scores_at(x.view(), 0).unwrap();
        assert!(untrained.iter().all(|&p| p == 0.5));
    }

    #[test]
    fn test_same_seed_gives_identical_ensembles() {
        let (x, y) = informative_and_noise(80, 9);
        let params = BoostingParams {
            num_rounds: 8,
            seed: 42,
            ..BoostingParams::default()
        };
        let first = GradientBoostedTrees::new(params.clone())
            .fit_ensemble(x.view(), &y, 2)
            .unwrap();
        let second = GradientBoostedTrees::new(params)
            .fit_ensemble(x.view(), &y, 2)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_softmax_objective_scores_sum_to_one() {
        let mut x = Array2::zeros((90, 1));
        let mut y = Vec::new();
        for i in 0..90 {
            let class = i % 3;
            x[[i, 0]] = class as f64 + 0.01 * (i / 3) as f64;
            y.push(class);
        }
        let ensemble = GradientBoostedTrees::new(BoostingParams {
            max_depth: 2,
            ..stumps(10)
        })
        .fit_ensemble(x.view(), &y, 3)
        .unwrap();
        let scores = ensemble.predict_scores(x.view()).unwrap();
        assert_eq!(scores.shape(), &[90, 3]);
        for (row, &label) in scores.rows().into_iter().zip(&y) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
            let argmax = (0..3)
                .max_by(|&a, &b| row[a].total_cmp(&row[b]))
                .unwrap();
            assert_eq!(argmax, label);
        }
    }

    #[test]
    fn test_subsampled_rounds_fit_two_and_three_classes() {
        let x = array![
            [0.1, 1.0],
            [0.2, 0.9],
            [0.3, 1.1],
            [1.1, 0.2],
            [1.2, 0.1],
            [1.3, 0.3],
            [2.1, -0.8],
            [2.2, -1.0],
            [2.3, -0.9],
        ];
        let params = BoostingParams {
            num_rounds: 4,
            max_depth: 2,
            subsample: 0.5,
            min_child_weight: 0.0,
            seed: 3,
            ..BoostingParams::default()
        };
        for (y, n_classes) in [
            (vec![0, 0, 0, 0, 1, 1, 1, 1, 1], 2),
            (vec![0, 0, 0, 1, 1, 1, 2, 2, 2], 3),
        ] {
            let ensemble = GradientBoostedTrees::new(params.clone())
                .fit_ensemble(x.view(), &y, n_classes)
                .unwrap();
            assert_eq!(ensemble.n_rounds(), 4);
            assert_eq!(ensemble.n_classes(), n_classes);

            let scores = ensemble.predict_scores(x.view()).unwrap();
            assert_eq!(scores.shape(), &[9, n_classes]);
            for row in scores.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
            }
            let staged: Vec<Array2<f64>> = ensemble.staged_scores(x.view()).unwrap().collect();
            assert_eq!(staged.len(), 4);
        }
    }

    #[test]
    fn test_min_child_weight_blocks_all_splits() {
        let (x, y) = informative_and_noise(40, 10);
        let ensemble = GradientBoostedTrees::new(BoostingParams {
            min_child_weight: 1e6,
            ..stumps(3)
        })
        .fit_ensemble(x.view(), &y, 2)
        .unwrap();
        assert_eq!(ensemble.split_counts(), Array1::<f64>::zeros(2));
    }

    #[test]
    fn test_balanced_weighting_lifts_minority_scores() {
        let x = Array2::<f64>::ones((100, 1));
        let y: Vec<usize> = (0..100).map(|i| usize::from(i < 10)).collect();
        let fit = |scale_pos_weight| {
            GradientBoostedTrees::new(BoostingParams {
                scale_pos_weight,
                ..stumps(10)
            })
            .fit_ensemble(x.view(), &y, 2)
            .unwrap()
            .predict_scores(array![[1.0]].view())
            .unwrap()[[0, 1]]
        };
        let unweighted = fit(ScalePosWeight::Fixed(1.0));
        let balanced = fit(ScalePosWeight::Balanced);
        assert!(unweighted < 0.5);
        assert!(balanced > unweighted);
        assert_abs_diff_eq!(balanced, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_invalid_parameters_are_rejected() {
        let (x, y) = informative_and_noise(10, 11);
        let err = GradientBoostedTrees::new(BoostingParams {
            subsample: 0.0,
            ..BoostingParams::default()
        })
        .fit_ensemble(x.view(), &y, 2)
        .unwrap_err();
        assert!(matches!(err, ModelError::InvalidParameter { name: "subsample", .. }));
    }

    #[test]
    fn test_params_round_trip_through_toml() {
        let params = BoostingParams {
            scale_pos_weight: ScalePosWeight::Balanced,
            ..BoostingParams::default()
        };
        let text = toml::to_string(&params).unwrap();
        let parsed: BoostingParams = toml::from_str(&text).unwrap();
        assert_eq!(parsed, params);
    }
}
