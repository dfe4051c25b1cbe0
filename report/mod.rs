//! # Result Reporting
//!
//! Renders a `CrossValidationResult` as markdown tables for the terminal and
//! exports the same numbers as CSV files for downstream plotting.
//!
//! Undefined values are shown as `n/a` in markdown and left as empty cells in
//! CSV, never as zero.

use crate::curve::BoostingCurve;
use crate::harness::{CrossValidationResult, FoldResult, Partition};
use crate::metrics::{Metric, MetricBundle};
use crate::summary::{ImportanceTable, MetricStats};
use itertools::Itertools;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SUMMARY_FILE: &str = "performance_summary.csv";
pub const FOLD_METRICS_FILE: &str = "fold_metrics.csv";
pub const CONFUSION_FILE: &str = "confusion_matrices.csv";
pub const IMPORTANCE_FILE: &str = "feature_importance.csv";
pub const CURVE_FILE: &str = "boosting_curve.csv";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write CSV report: {0}")]
    CsvError(#[from] csv::Error),
}

fn markdown_value(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.5}"))
}

fn csv_value(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| v.to_string())
}

fn markdown_table(header: &[String], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!("| {} |", header.iter().join(" | ")));
    lines.push(format!("|{}|", header.iter().map(|_| "---").join("|")));
    for row in rows {
        lines.push(format!("| {} |", row.iter().join(" | ")));
    }
    lines.join("\n")
}

fn fold_label(partition: Partition, fold: usize) -> String {
    match partition {
        Partition::Train => format!("train_cv{fold}"),
        Partition::Test => format!("valid_cv{fold}"),
    }
}

/// Metric name by train/test mean and population standard deviation.
pub fn render_summary(result: &CrossValidationResult) -> String {
    let header = ["metric", "train mean", "train stddev", "test mean", "test stddev", "omitted"]
        .map(String::from);
    let rows: Vec<Vec<String>> = result
        .summary
        .iter()
        .map(|row| {
            vec![
                row.metric.name().to_string(),
                markdown_value(row.train.mean),
                markdown_value(row.train.std_dev),
                markdown_value(row.test.mean),
                markdown_value(row.test.std_dev),
                (row.train.n_omitted + row.test.n_omitted).to_string(),
            ]
        })
        .collect();
    markdown_table(&header, &rows)
}

/// One row per fold for the given partition, followed by `mean` and `stddev` rows.
pub fn render_fold_table(result: &CrossValidationResult, partition: Partition) -> String {
    let header: Vec<String> = std::iter::once("fold".to_string())
        .chain(Metric::ALL.iter().map(|metric| metric.name().to_string()))
        .collect();

    let mut rows: Vec<Vec<String>> = result
        .folds
        .iter()
        .map(|fold| {
            let bundle = fold.partition(partition);
            std::iter::once(format!("cv{}", fold.fold))
                .chain(Metric::ALL.iter().map(|&metric| markdown_value(bundle.value(metric))))
                .collect()
        })
        .collect();

    let stats: Vec<MetricStats> = Metric::ALL
        .iter()
        .filter_map(|&metric| result.summary_for(metric))
        .map(|row| match partition {
            Partition::Train => row.train,
            Partition::Test => row.test,
        })
        .collect();
    rows.push(
        std::iter::once("mean".to_string())
            .chain(stats.iter().map(|s| markdown_value(s.mean)))
            .collect(),
    );
    rows.push(
        std::iter::once("stddev".to_string())
            .chain(stats.iter().map(|s| markdown_value(s.std_dev)))
            .collect(),
    );
    markdown_table(&header, &rows)
}

fn render_confusion(title: &str, bundle: &MetricBundle) -> String {
    let counts = bundle.confusion.counts();
    let header: Vec<String> = std::iter::once(title.to_string())
        .chain((0..counts.ncols()).map(|j| format!("pred{j}")))
        .collect();
    let rows: Vec<Vec<String>> = counts
        .rows()
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            std::iter::once(format!("label{i}"))
                .chain(row.iter().map(|count| count.to_string()))
                .collect()
        })
        .collect();
    markdown_table(&header, &rows)
}

/// Train and validation confusion matrices of every fold; rows are true labels.
pub fn render_confusion_matrices(result: &CrossValidationResult) -> String {
    result
        .folds
        .iter()
        .flat_map(|fold| {
            [Partition::Train, Partition::Test].map(|partition| {
                render_confusion(&fold_label(partition, fold.fold), fold.partition(partition))
            })
        })
        .join("\n\n")
}

/// The `top_n` most important features.
pub fn render_importance(table: &ImportanceTable, top_n: usize) -> String {
    let header = ["rank", "feature", "mean", "stddev", "nonzero folds"].map(String::from);
    let rows: Vec<Vec<String>> = table
        .top(top_n)
        .iter()
        .enumerate()
        .map(|(rank, row)| {
            vec![
                (rank + 1).to_string(),
                row.feature.clone(),
                format!("{:.5}", row.mean),
                format!("{:.5}", row.std_dev),
                format!("{}/{}", row.nonzero_folds, table.n_folds),
            ]
        })
        .collect();
    markdown_table(&header, &rows)
}

/// All sections of the evaluation report.
pub fn render_report(result: &CrossValidationResult, top_features: usize) -> String {
    let mut sections = vec![
        format!(
            "## Cross-validation summary ({}, {} folds, {} classes)\n\n{}",
            result.classifier,
            result.folds.len(),
            result.n_classes,
            render_summary(result)
        ),
        format!("## Train folds\n\n{}", render_fold_table(result, Partition::Train)),
        format!("## Validation folds\n\n{}", render_fold_table(result, Partition::Test)),
        format!("## Confusion matrices\n\n{}", render_confusion_matrices(result)),
    ];
    if let Some(table) = &result.importance {
        sections.push(format!(
            "## Feature importance (top {})\n\n{}",
            top_features.min(table.rows.len()),
            render_importance(table, top_features)
        ));
    }
    let omissions: Vec<String> = result
        .omissions()
        .map(|o| {
            let label = fold_label(o.partition, o.fold);
            format!("- {label} {} undefined: {}", o.metric, o.reason)
        })
        .collect();
    if !omissions.is_empty() {
        sections.push(format!("## Undefined metrics\n\n{}", omissions.join("\n")));
    }
    sections.join("\n\n")
}

/// Per-round mean and standard deviation of the test metrics.
pub fn render_curve(curve: &BoostingCurve) -> String {
    let header = [
        "round",
        "test auc",
        "test auc stddev",
        "test logloss",
        "test error",
        "train auc",
    ]
    .map(String::from);
    let rows: Vec<Vec<String>> = curve
        .rounds
        .iter()
        .map(|stats| {
            vec![
                stats.round.to_string(),
                markdown_value(stats.test.auc.mean),
                markdown_value(stats.test.auc.std_dev),
                markdown_value(stats.test.log_loss.mean),
                markdown_value(stats.test.error.mean),
                markdown_value(stats.train.auc.mean),
            ]
        })
        .collect();
    markdown_table(&header, &rows)
}

fn prepare_output_dir(dir: &Path) -> Result<(), ReportError> {
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Writes the summary, per-fold metrics, confusion matrices and (when present)
/// importance ranking into `dir`, returning the files written.
pub fn export_results(
    result: &CrossValidationResult,
    dir: &Path,
) -> Result<Vec<PathBuf>, ReportError> {
    prepare_output_dir(dir)?;
    let mut written = Vec::with_capacity(4);

    let path = dir.join(SUMMARY_FILE);
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record([
        "metric",
        "train_mean",
        "train_std",
        "train_defined",
        "train_omitted",
        "test_mean",
        "test_std",
        "test_defined",
        "test_omitted",
    ])?;
    for row in &result.summary {
        writer.write_record([
            row.metric.name().to_string(),
            csv_value(row.train.mean),
            csv_value(row.train.std_dev),
            row.train.n_defined.to_string(),
            row.train.n_omitted.to_string(),
            csv_value(row.test.mean),
            csv_value(row.test.std_dev),
            row.test.n_defined.to_string(),
            row.test.n_omitted.to_string(),
        ])?;
    }
    writer.flush()?;
    written.push(path);

    let path = dir.join(FOLD_METRICS_FILE);
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(
        ["fold", "partition", "n_records"]
            .into_iter()
            .chain(Metric::ALL.iter().map(|metric| metric.name())),
    )?;
    for fold in &result.folds {
        for partition in [Partition::Train, Partition::Test] {
            writer.write_record(fold_metric_record(fold, partition))?;
        }
    }
    writer.flush()?;
    written.push(path);

    let path = dir.join(CONFUSION_FILE);
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["fold", "partition", "actual", "predicted", "count"])?;
    for fold in &result.folds {
        for partition in [Partition::Train, Partition::Test] {
            let counts = fold.partition(partition).confusion.counts();
            for ((actual, predicted), count) in counts.indexed_iter() {
                writer.write_record([
                    fold.fold.to_string(),
                    partition.to_string(),
                    actual.to_string(),
                    predicted.to_string(),
                    count.to_string(),
                ])?;
            }
        }
    }
    writer.flush()?;
    written.push(path);

    if let Some(table) = &result.importance {
        let path = dir.join(IMPORTANCE_FILE);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["rank", "feature", "mean", "std_dev", "nonzero_folds"])?;
        for (rank, row) in table.rows.iter().enumerate() {
            writer.write_record([
                (rank + 1).to_string(),
                row.feature.clone(),
                row.mean.to_string(),
                row.std_dev.to_string(),
                row.nonzero_folds.to_string(),
            ])?;
        }
        writer.flush()?;
        written.push(path);
    }

    log::info!("Wrote {} report files to '{}'", written.len(), dir.display());
    Ok(written)
}

fn fold_metric_record(fold: &FoldResult, partition: Partition) -> Vec<String> {
    let bundle = fold.partition(partition);
    [
        fold.fold.to_string(),
        partition.to_string(),
        bundle.n_records.to_string(),
    ]
    .into_iter()
    .chain(Metric::ALL.iter().map(|&metric| csv_value(bundle.value(metric))))
    .collect()
}

/// Writes the per-round curve statistics into `dir`.
pub fn export_curve(curve: &BoostingCurve, dir: &Path) -> Result<PathBuf, ReportError> {
    prepare_output_dir(dir)?;
    let path = dir.join(CURVE_FILE);
    let mut writer = csv::Writer::from_path(&path)?;

    let mut header = vec!["round".to_string()];
    for partition in ["train", "test"] {
        for metric in ["auc", "logloss", "error"] {
            header.push(format!("{partition}_{metric}_mean"));
            header.push(format!("{partition}_{metric}_std"));
        }
    }
    writer.write_record(&header)?;

    for stats in &curve.rounds {
        let mut record = vec![stats.round.to_string()];
        for point in [&stats.train, &stats.test] {
            for metric in [&point.auc, &point.log_loss, &point.error] {
                record.push(csv_value(metric.mean));
                record.push(csv_value(metric.std_dev));
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{EvaluationData, EvaluationSettings, evaluate};
    use crate::models::{BoostingParams, GradientBoostedTrees, LogisticParams, LogisticRegression};
    use crate::progress::NoopFoldObserver;
    use ndarray::Array2;
    use tempfile::tempdir;

    fn small_data() -> EvaluationData {
        let n = 40;
        let mut x = Array2::zeros((n, 2));
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let label = i % 2;
            x[[i, 0]] = label as f64 + 0.05 * (i % 5) as f64;
            x[[i, 1]] = (i % 3) as f64;
            y.push(label);
        }
        EvaluationData::new(x, vec!["BCORP1".into(), "KAT2A".into()], y.clone(), y).unwrap()
    }

    fn settings() -> EvaluationSettings {
        EvaluationSettings {
            n_folds: 4,
            ..EvaluationSettings::default()
        }
    }

    #[test]
    fn test_markdown_report_sections() {
        let result = evaluate(
            &small_data(),
            &LogisticRegression::new(LogisticParams::default()),
            &settings(),
            &NoopFoldObserver,
        )
        .unwrap();
        let report = render_report(&result, 10);
        let header = "| metric | train mean | train stddev | test mean | test stddev | omitted |";
        assert!(report.contains(header));
        assert!(report.contains("| matthews_corrcoef |"));
        assert!(report.contains("| train_cv0 | pred0 | pred1 |"));
        assert!(report.contains("| valid_cv3 | pred0 | pred1 |"));
        assert!(report.contains("| label1 |"));
        assert!(report.contains("| stddev |"));
        assert!(!report.contains("Feature importance"));

        let folds = render_fold_table(&result, Partition::Test);
        // header, separator, four folds, mean and stddev
        assert_eq!(folds.lines().count(), 8);
    }

    #[test]
    fn test_csv_export_writes_every_table() {
        let mut result = evaluate(
            &small_data(),
            &GradientBoostedTrees::new(BoostingParams {
                num_rounds: 3,
                ..BoostingParams::default()
            }),
            &settings(),
            &NoopFoldObserver,
        )
        .unwrap();
        result.folds[0].test.auc = None;

        let dir = tempdir().unwrap();
        let written = export_results(&result, dir.path()).unwrap();
        assert_eq!(written.len(), 4);

        let folds = fs::read_to_string(dir.path().join(FOLD_METRICS_FILE)).unwrap();
        let lines: Vec<&str> = folds.lines().collect();
        assert_eq!(
            lines[0],
            "fold,partition,n_records,accuracy,auc,recall,precision,f1_score,matthews_corrcoef"
        );
        assert_eq!(lines.len(), 1 + 4 * 2);
        let undefined: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(undefined[1], "test");
        assert_eq!(undefined[4], "");

        let confusion = fs::read_to_string(dir.path().join(CONFUSION_FILE)).unwrap();
        assert_eq!(confusion.lines().count(), 1 + 4 * 2 * 4);

        let importance = fs::read_to_string(dir.path().join(IMPORTANCE_FILE)).unwrap();
        assert!(importance.starts_with("rank,feature,mean,std_dev,nonzero_folds"));
        assert_eq!(importance.lines().count(), 3);
    }
}
