//! # Cross-Fold Aggregation
//!
//! Reduces per-fold results to the durable summary: population mean and standard
//! deviation of every metric, separately for the train and test partitions, and
//! the per-feature importance ranking.
//!
//! Undefined values (an AUC that could not be computed for a fold) are excluded
//! from the statistics and counted, so a reader can tell a mean over ten folds
//! from a mean over seven.

use crate::harness::FoldResult;
use crate::metrics::{Metric, MetricBundle};
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;
use std::cmp::Ordering;

/// Population statistics of one metric over the folds where it was defined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub n_defined: usize,
    pub n_omitted: usize,
}

impl MetricStats {
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        let mut defined = Vec::new();
        let mut n_omitted = 0;
        for value in values {
            match value {
                Some(v) => defined.push(v),
                None => n_omitted += 1,
            }
        }
        let (mean, std_dev) = population_mean_std(&defined)
            .map_or((None, None), |(mean, std)| (Some(mean), Some(std)));
        Self {
            mean,
            std_dev,
            n_defined: defined.len(),
            n_omitted,
        }
    }
}

/// Mean and population (divide by `n`) standard deviation; `None` for an empty slice.
pub fn population_mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub metric: Metric,
    pub train: MetricStats,
    pub test: MetricStats,
}

/// One summary row per metric, in `Metric::ALL` order.
pub fn summarize_metrics(folds: &[FoldResult]) -> Vec<MetricSummary> {
    Metric::ALL
        .iter()
        .map(|&metric| MetricSummary {
            metric,
            train: partition_stats(folds, metric, |fold| &fold.train),
            test: partition_stats(folds, metric, |fold| &fold.test),
        })
        .collect()
}

fn partition_stats(
    folds: &[FoldResult],
    metric: Metric,
    pick: impl Fn(&FoldResult) -> &MetricBundle,
) -> MetricStats {
    MetricStats::from_values(folds.iter().map(|fold| pick(fold).value(metric)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportanceRow {
    pub feature: String,
    pub mean: f64,
    pub std_dev: f64,
    /// Folds in which the feature received a non-zero importance.
    pub nonzero_folds: usize,
}

/// Feature importance accumulated over all folds, sorted by descending mean.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportanceTable {
    pub n_folds: usize,
    pub rows: Vec<ImportanceRow>,
}

impl ImportanceTable {
    /// Builds the ranking from per-fold importance vectors, one per fold.
    ///
    /// Every known feature starts at zero, so a feature a model never used still
    /// appears with mean 0. The mean divides the accumulated total by the number of
    /// folds. Returns `None` when no fold reported importances.
    pub fn accumulate(feature_names: &[String], per_fold: &[Option<&Array1<f64>>]) -> Option<Self> {
        if per_fold.iter().all(Option::is_none) {
            return None;
        }
        let n_folds = per_fold.len();
        let mut values = Array2::<f64>::zeros((n_folds, feature_names.len()));
        for (fold, importance) in per_fold.iter().enumerate() {
            if let Some(importance) = importance {
                values.row_mut(fold).assign(importance);
            }
        }

        let mut rows: Vec<ImportanceRow> = feature_names
            .iter()
            .zip(values.axis_iter(Axis(1)))
            .map(|(feature, column)| {
                let column = column.to_vec();
                let (mean, std_dev) = population_mean_std(&column).unwrap_or((0.0, 0.0));
                ImportanceRow {
                    feature: feature.clone(),
                    mean,
                    std_dev,
                    nonzero_folds: column.iter().filter(|&&v| v != 0.0).count(),
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            b.mean
                .partial_cmp(&a.mean)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.feature.cmp(&b.feature))
        });

        Some(Self { n_folds, rows })
    }

    /// The `n` highest-ranked features.
    pub fn top(&self, n: usize) -> &[ImportanceRow] {
        &self.rows[..n.min(self.rows.len())]
    }

    pub fn get(&self, feature: &str) -> Option<&ImportanceRow> {
        self.rows.iter().find(|row| row.feature == feature)
    }
}
