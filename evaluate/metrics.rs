//! # Classification Metrics
//!
//! The fixed metric bundle reported for every fold and partition: accuracy,
//! ROC AUC, precision, recall, F1, Matthews correlation coefficient and the
//! full confusion matrix.
//!
//! - Undefined per-class precision, recall or F1 (an empty denominator) counts
//!   as 0 in a macro average and as 0 for the positive class in binary mode.
//!   The value is never NaN.
//! - AUC is computed from continuous scores before thresholding. It is the only
//!   metric that can be undefined for a partition, and callers receive the
//!   reason as a `MetricError` so they can decide whether to record or abort.

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Probability floor used when taking logarithms of predicted scores.
const LOG_LOSS_EPSILON: f64 = 1e-15;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("class {class} has no records in this partition, so its ROC curve is undefined")]
    MissingClass { class: usize },
    #[error("{labels} labels were supplied for {scores} scored records")]
    LengthMismatch { labels: usize, scores: usize },
    #[error("label {label} is outside the {n_classes} known classes")]
    LabelOutOfRange { label: usize, n_classes: usize },
    #[error("cannot compute metrics for an empty partition")]
    EmptyPartition,
}

/// The metrics carried by every `MetricBundle`, in reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Accuracy,
    Auc,
    Recall,
    Precision,
    F1Score,
    MatthewsCorrcoef,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Accuracy,
        Metric::Auc,
        Metric::Recall,
        Metric::Precision,
        Metric::F1Score,
        Metric::MatthewsCorrcoef,
    ];

    /// Stable column name used in exported tables.
    pub fn name(self) -> &'static str {
        match self {
            Metric::Accuracy => "accuracy",
            Metric::Auc => "auc",
            Metric::Recall => "recall",
            Metric::Precision => "precision",
            Metric::F1Score => "f1_score",
            Metric::MatthewsCorrcoef => "matthews_corrcoef",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How per-class precision, recall and F1 are reduced to a single number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Averaging {
    /// Binary for two classes, macro otherwise.
    #[default]
    Auto,
    /// Scores of the positive class (label 1) only.
    Binary,
    /// Unweighted mean over all classes.
    Macro,
}

impl Averaging {
    pub fn resolve(self, n_classes: usize) -> Averaging {
        match self {
            Averaging::Auto if n_classes == 2 => Averaging::Binary,
            Averaging::Auto => Averaging::Macro,
            other => other,
        }
    }
}

impl FromStr for Averaging {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Averaging::Auto),
            "binary" => Ok(Averaging::Binary),
            "macro" => Ok(Averaging::Macro),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Averaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Averaging::Auto => "auto",
            Averaging::Binary => "binary",
            Averaging::Macro => "macro",
        })
    }
}

/// A `k x k` confusion matrix. Rows are true labels, columns are predicted labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    counts: Array2<usize>,
}

impl ConfusionMatrix {
    /// Tallies `(actual, predicted)` pairs. All `n_classes` rows and columns are present,
    /// zero-filled when a class is never observed.
    pub fn from_labels(
        actual: &[usize],
        predicted: &[usize],
        n_classes: usize,
    ) -> Result<Self, MetricError> {
        if actual.len() != predicted.len() {
            return Err(MetricError::LengthMismatch {
                labels: actual.len(),
                scores: predicted.len(),
            });
        }
        let mut counts = Array2::zeros((n_classes, n_classes));
        for (&truth, &guess) in actual.iter().zip(predicted) {
            for label in [truth, guess] {
                if label >= n_classes {
                    return Err(MetricError::LabelOutOfRange { label, n_classes });
                }
            }
            counts[[truth, guess]] += 1;
        }
        Ok(Self { counts })
    }

    pub fn n_classes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn counts(&self) -> &Array2<usize> {
        &self.counts
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[[actual, predicted]]
    }

    pub fn total(&self) -> usize {
        self.counts.sum()
    }

    /// Number of records whose true label is `class`.
    pub fn support(&self, class: usize) -> usize {
        self.counts.row(class).sum()
    }

    /// Number of records predicted as `class`.
    pub fn predicted(&self, class: usize) -> usize {
        self.counts.column(class).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: usize = (0..self.n_classes()).map(|c| self.counts[[c, c]]).sum();
        correct as f64 / total as f64
    }

    /// `None` when nothing was predicted as `class`.
    pub fn precision(&self, class: usize) -> Option<f64> {
        let predicted = self.predicted(class);
        (predicted > 0).then(|| self.counts[[class, class]] as f64 / predicted as f64)
    }

    /// `None` when `class` has no true records.
    pub fn recall(&self, class: usize) -> Option<f64> {
        let support = self.support(class);
        (support > 0).then(|| self.counts[[class, class]] as f64 / support as f64)
    }

    /// `2 tp / (2 tp + fp + fn)`, `None` when the class never occurs in truth or prediction.
    pub fn f1(&self, class: usize) -> Option<f64> {
        let tp = self.counts[[class, class]];
        let denominator = self.support(class) + self.predicted(class);
        (denominator > 0).then(|| 2.0 * tp as f64 / denominator as f64)
    }

    /// Multi-class Matthews correlation coefficient (Gorodkin's `R_K`), which reduces to
    /// the usual binary MCC for two classes. Returns 0 when either marginal is constant.
    pub fn matthews_corrcoef(&self) -> f64 {
        let k = self.n_classes();
        let total = self.total() as f64;
        let correct: f64 = (0..k).map(|c| self.counts[[c, c]] as f64).sum();
        let true_counts: Vec<f64> = (0..k).map(|c| self.support(c) as f64).collect();
        let pred_counts: Vec<f64> = (0..k).map(|c| self.predicted(c) as f64).collect();

        let cov_true_pred =
            correct * total - true_counts.iter().zip(&pred_counts).map(|(t, p)| t * p).sum::<f64>();
        let cov_pred_pred = total * total - pred_counts.iter().map(|p| p * p).sum::<f64>();
        let cov_true_true = total * total - true_counts.iter().map(|t| t * t).sum::<f64>();

        let denominator = (cov_true_true * cov_pred_pred).sqrt();
        if denominator == 0.0 {
            0.0
        } else {
            cov_true_pred / denominator
        }
    }

    /// Reduces a per-class statistic with the given averaging rule. Undefined
    /// per-class values contribute 0.
    pub fn averaged(
        &self,
        averaging: Averaging,
        per_class: impl Fn(&Self, usize) -> Option<f64>,
    ) -> f64 {
        let k = self.n_classes();
        match averaging.resolve(k) {
            Averaging::Binary => per_class(self, 1).unwrap_or(0.0),
            _ => (0..k).map(|c| per_class(self, c).unwrap_or(0.0)).sum::<f64>() / k as f64,
        }
    }
}

/// The full set of metrics for one partition (train or test) of one fold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricBundle {
    pub n_records: usize,
    pub accuracy: f64,
    /// `None` when AUC was undefined for this partition.
    pub auc: Option<f64>,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub mcc: f64,
    pub confusion: ConfusionMatrix,
}

impl MetricBundle {
    /// Scores one partition. `scores` holds one column per class; `auc` is computed by
    /// the caller from the same scores so that the undefined-metric policy stays in
    /// one place.
    pub fn compute(
        labels: &[usize],
        scores: ArrayView2<f64>,
        threshold: f64,
        averaging: Averaging,
        auc: Option<f64>,
    ) -> Result<Self, MetricError> {
        if labels.is_empty() {
            return Err(MetricError::EmptyPartition);
        }
        if labels.len() != scores.nrows() {
            return Err(MetricError::LengthMismatch {
                labels: labels.len(),
                scores: scores.nrows(),
            });
        }
        let n_classes = scores.ncols();
        let predicted = hard_predictions(scores, threshold);
        let confusion = ConfusionMatrix::from_labels(labels, &predicted, n_classes)?;

        Ok(Self {
            n_records: labels.len(),
            accuracy: confusion.accuracy(),
            auc,
            precision: confusion.averaged(averaging, ConfusionMatrix::precision),
            recall: confusion.averaged(averaging, ConfusionMatrix::recall),
            f1_score: confusion.averaged(averaging, ConfusionMatrix::f1),
            mcc: confusion.matthews_corrcoef(),
            confusion,
        })
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Accuracy => Some(self.accuracy),
            Metric::Auc => self.auc,
            Metric::Recall => Some(self.recall),
            Metric::Precision => Some(self.precision),
            Metric::F1Score => Some(self.f1_score),
            Metric::MatthewsCorrcoef => Some(self.mcc),
        }
    }
}

/// Converts per-class scores to hard labels. With two columns the positive score is
/// compared against `threshold` (ties go to the positive class); otherwise the first
/// column holding the maximum score wins and `threshold` is unused.
pub fn hard_predictions(scores: ArrayView2<f64>, threshold: f64) -> Vec<usize> {
    if scores.ncols() == 2 {
        return scores
            .column(1)
            .iter()
            .map(|&p| usize::from(p >= threshold))
            .collect();
    }
    scores
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (class, &score)| {
                    if score > best.1 { (class, score) } else { best }
                })
                .0
        })
        .collect()
}

/// Area under the ROC curve via the Mann-Whitney rank statistic, with tied scores
/// sharing their average rank.
pub fn roc_auc(scores: ArrayView1<f64>, positive: &[bool]) -> Result<f64, MetricError> {
    if scores.len() != positive.len() {
        return Err(MetricError::LengthMismatch {
            labels: positive.len(),
            scores: scores.len(),
        });
    }
    let n_positive = positive.iter().filter(|&&p| p).count();
    let n_negative = positive.len() - n_positive;
    if n_positive == 0 {
        return Err(MetricError::MissingClass { class: 1 });
    }
    if n_negative == 0 {
        return Err(MetricError::MissingClass { class: 0 });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        let average_rank = (start + end) as f64 / 2.0 + 1.0;
        let tied_positives = order[start..=end].iter().filter(|&&i| positive[i]).count();
        positive_rank_sum += average_rank * tied_positives as f64;
        start = end + 1;
    }

    let n_pos = n_positive as f64;
    let n_neg = n_negative as f64;
    Ok((positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// AUC for a partition: positive-class AUC with two classes, one-vs-rest macro
/// average otherwise. Every class must be present in `labels`.
pub fn partition_auc(labels: &[usize], scores: ArrayView2<f64>) -> Result<f64, MetricError> {
    if labels.len() != scores.nrows() {
        return Err(MetricError::LengthMismatch {
            labels: labels.len(),
            scores: scores.nrows(),
        });
    }
    let n_classes = scores.ncols();
    if let Some(class) = (0..n_classes).find(|&c| !labels.contains(&c)) {
        return Err(MetricError::MissingClass { class });
    }

    if n_classes == 2 {
        let positive: Vec<bool> = labels.iter().map(|&l| l == 1).collect();
        return roc_auc(scores.column(1), &positive);
    }

    let mut total = 0.0;
    for class in 0..n_classes {
        let positive: Vec<bool> = labels.iter().map(|&l| l == class).collect();
        total += roc_auc(scores.column(class), &positive)?;
    }
    Ok(total / n_classes as f64)
}

/// Mean negative log-likelihood of the true labels under the predicted scores.
pub fn log_loss(labels: &[usize], scores: ArrayView2<f64>) -> Result<f64, MetricError> {
    if labels.is_empty() {
        return Err(MetricError::EmptyPartition);
    }
    if labels.len() != scores.nrows() {
        return Err(MetricError::LengthMismatch {
            labels: labels.len(),
            scores: scores.nrows(),
        });
    }
    let mut total = 0.0;
    for (row, &label) in labels.iter().enumerate() {
        if label >= scores.ncols() {
            return Err(MetricError::LabelOutOfRange {
                label,
                n_classes: scores.ncols(),
            });
        }
        let p = scores[[row, label]].clamp(LOG_LOSS_EPSILON, 1.0 - LOG_LOSS_EPSILON);
        total -= p.ln();
    }
    Ok(total / labels.len() as f64)
}
