//! # Cross-Validated Classifier Evaluation
//!
//! `evaluate` fits one model per stratified fold and scores it on both its
//! training and held-out partitions. The flow is:
//!
//! 1. validate the settings and the data (fatal, before any fold work);
//! 2. compute the fold assignment once from the stratification labels and seed;
//! 3. evaluate each fold independently, each returning its own `FoldResult`;
//! 4. aggregate the ordered fold results into the summary and importance table.
//!
//! Folds share no mutable state, so step 3 may run on the rayon pool without
//! changing any result.

use ahash::AHashSet;
use crate::folds::{FoldAssignment, FoldSplit};
use crate::metrics::{Averaging, Metric, MetricBundle, MetricError, partition_auc};
use crate::models::{Classifier, FittedModel, ModelError};
use crate::progress::FoldObserver;
use crate::summary::{ImportanceTable, MetricStats, MetricSummary, summarize_metrics};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The broad category of an evaluation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The inputs are malformed: shapes disagree or values are not finite.
    Data,
    /// The run settings are invalid for this dataset.
    Config,
    /// A fold lacks a class that a metric requires.
    InsufficientData,
    /// The model failed to fit or to score a fold.
    Model,
}

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("The feature matrix has {rows} rows but the target has {labels} labels.")]
    TargetLengthMismatch { rows: usize, labels: usize },
    #[error("The feature matrix has {rows} rows but the stratification vector has {labels} labels.")]
    StratifyLengthMismatch { rows: usize, labels: usize },
    #[error("The feature matrix has {columns} columns but {names} feature names were supplied.")]
    FeatureNameMismatch { columns: usize, names: usize },
    #[error("Feature name '{0}' appears more than once.")]
    DuplicateFeatureName(String),
    #[error("Feature '{feature}' has a missing or non-finite value in record {row}.")]
    NonFiniteFeature { row: usize, feature: String },
    #[error("The dataset contains no records.")]
    EmptyDataset,
    #[error("The target must contain at least two classes, but only {found} was found.")]
    TooFewClasses { found: usize },
    #[error("Fold {fold} ({partition}) could not be scored: {source}")]
    Metric {
        fold: usize,
        partition: Partition,
        source: MetricError,
    },

    #[error("At least two folds are required, but {0} was requested.")]
    TooFewFolds(usize),
    #[error(
        "Cannot build {n_folds} stratified folds: stratum {stratum} has only {count} records."
    )]
    FoldCountExceedsStratum {
        n_folds: usize,
        stratum: usize,
        count: usize,
    },
    #[error("The decision threshold must lie in [0, 1], got {0}.")]
    ThresholdOutOfRange(f64),
    #[error("Unknown averaging mode '{0}'. Expected one of: auto, binary, macro.")]
    UnknownAveraging(String),
    #[error("Binary averaging was requested for a target with {n_classes} classes.")]
    BinaryAveragingForMulticlass { n_classes: usize },

    #[error("Fold {fold} ({partition}): {metric} is undefined: {source}")]
    InsufficientData {
        fold: usize,
        partition: Partition,
        metric: Metric,
        source: MetricError,
    },

    #[error("The model failed on fold {fold}: {source}")]
    Model { fold: usize, source: ModelError },
    #[error("The model reported {found} feature importances for fold {fold}, expected {expected}.")]
    ImportanceLength {
        fold: usize,
        expected: usize,
        found: usize,
    },
    #[error(
        "The model returned scores of shape {rows}x{columns} for fold {fold}, expected {expected_rows}x{expected_columns}."
    )]
    ScoreShape {
        fold: usize,
        rows: usize,
        columns: usize,
        expected_rows: usize,
        expected_columns: usize,
    },
}

impl EvaluationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TargetLengthMismatch { .. }
            | Self::StratifyLengthMismatch { .. }
            | Self::FeatureNameMismatch { .. }
            | Self::DuplicateFeatureName(_)
            | Self::NonFiniteFeature { .. }
            | Self::EmptyDataset
            | Self::TooFewClasses { .. }
            | Self::Metric { .. } => ErrorKind::Data,
            Self::TooFewFolds(_)
            | Self::FoldCountExceedsStratum { .. }
            | Self::ThresholdOutOfRange(_)
            | Self::UnknownAveraging(_)
            | Self::BinaryAveragingForMulticlass { .. } => ErrorKind::Config,
            Self::InsufficientData { .. } => ErrorKind::InsufficientData,
            Self::Model { .. } | Self::ImportanceLength { .. } | Self::ScoreShape { .. } => {
                ErrorKind::Model
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Test,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Train => write!(f, "train"),
            Partition::Test => write!(f, "test"),
        }
    }
}

/// A validated, immutable dataset ready for cross-validation.
#[derive(Debug, Clone)]
pub struct EvaluationData {
    features: Array2<f64>,
    feature_names: Vec<String>,
    target: Vec<usize>,
    stratify: Vec<usize>,
    n_classes: usize,
}

impl EvaluationData {
    /// Checks shapes, feature names and finiteness. The number of classes is one
    /// more than the largest target label, so classes absent from the data still
    /// get a row and column in every confusion matrix.
    pub fn new(
        features: Array2<f64>,
        feature_names: Vec<String>,
        target: Vec<usize>,
        stratify: Vec<usize>,
    ) -> Result<Self, EvaluationError> {
        let rows = features.nrows();
        if rows == 0 {
            return Err(EvaluationError::EmptyDataset);
        }
        if target.len() != rows {
            return Err(EvaluationError::TargetLengthMismatch {
                rows,
                labels: target.len(),
            });
        }
        if stratify.len() != rows {
            return Err(EvaluationError::StratifyLengthMismatch {
                rows,
                labels: stratify.len(),
            });
        }
        if feature_names.len() != features.ncols() {
            return Err(EvaluationError::FeatureNameMismatch {
                columns: features.ncols(),
                names: feature_names.len(),
            });
        }
        let mut seen = AHashSet::with_capacity(feature_names.len());
        for name in &feature_names {
            if !seen.insert(name.as_str()) {
                return Err(EvaluationError::DuplicateFeatureName(name.clone()));
            }
        }
        for ((row, column), value) in features.indexed_iter() {
            if !value.is_finite() {
                return Err(EvaluationError::NonFiniteFeature {
                    row,
                    feature: feature_names[column].clone(),
                });
            }
        }

        let n_classes = target.iter().max().map_or(0, |&max| max + 1);
        if n_classes < 2 {
            return Err(EvaluationError::TooFewClasses { found: n_classes });
        }

        Ok(Self {
            features,
            feature_names,
            target,
            stratify,
            n_classes,
        })
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn target(&self) -> &[usize] {
        &self.target
    }

    pub fn stratify(&self) -> &[usize] {
        &self.stratify
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn n_records(&self) -> usize {
        self.target.len()
    }

    /// Feature rows and target labels for the given record indices.
    pub(crate) fn subset(&self, indices: &[usize]) -> (Array2<f64>, Vec<usize>) {
        let x = self.features.select(Axis(0), indices);
        let y = indices.iter().map(|&i| self.target[i]).collect();
        (x, y)
    }
}

/// What to do when a metric cannot be computed for a fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedMetricPolicy {
    /// Record the metric as undefined, exclude it from the aggregate and count it.
    #[default]
    Record,
    /// Abort the run with an insufficient-data error.
    Abort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSettings {
    pub n_folds: usize,
    pub seed: u64,
    /// Decision threshold on the positive-class score; unused for more than two classes.
    pub threshold: f64,
    pub averaging: Averaging,
    pub undefined_metrics: UndefinedMetricPolicy,
    /// Evaluate folds on the rayon thread pool.
    pub parallel: bool,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            n_folds: 10,
            seed: 0,
            threshold: 0.5,
            averaging: Averaging::Auto,
            undefined_metrics: UndefinedMetricPolicy::Record,
            parallel: false,
        }
    }
}

impl EvaluationSettings {
    /// Validates settings that do not depend on fold composition and resolves the
    /// averaging mode for `n_classes`.
    pub fn validate(&self, n_classes: usize) -> Result<Averaging, EvaluationError> {
        if self.n_folds < 2 {
            return Err(EvaluationError::TooFewFolds(self.n_folds));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(EvaluationError::ThresholdOutOfRange(self.threshold));
        }
        if self.averaging == Averaging::Binary && n_classes > 2 {
            return Err(EvaluationError::BinaryAveragingForMulticlass { n_classes });
        }
        Ok(self.averaging.resolve(n_classes))
    }
}

/// A metric that was left undefined for one partition of one fold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricOmission {
    pub fold: usize,
    pub partition: Partition,
    pub metric: Metric,
    pub reason: String,
}

/// Everything measured on a single fold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoldResult {
    pub fold: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub test_indices: Vec<usize>,
    pub train: MetricBundle,
    pub test: MetricBundle,
    /// Per-feature importance, aligned with the dataset's feature names.
    pub importance: Option<Array1<f64>>,
    pub omissions: Vec<MetricOmission>,
}

impl FoldResult {
    pub fn partition(&self, partition: Partition) -> &MetricBundle {
        match partition {
            Partition::Train => &self.train,
            Partition::Test => &self.test,
        }
    }
}

/// The durable output of a cross-validation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossValidationResult {
    pub classifier: String,
    pub n_classes: usize,
    pub feature_names: Vec<String>,
    pub assignment: FoldAssignment,
    pub folds: Vec<FoldResult>,
    pub summary: Vec<MetricSummary>,
    pub importance: Option<ImportanceTable>,
}

impl CrossValidationResult {
    pub fn summary_for(&self, metric: Metric) -> Option<&MetricSummary> {
        self.summary.iter().find(|row| row.metric == metric)
    }

    /// Test-partition statistics for `metric`.
    pub fn test_stats(&self, metric: Metric) -> Option<MetricStats> {
        self.summary_for(metric).map(|row| row.test)
    }

    pub fn omissions(&self) -> impl Iterator<Item = &MetricOmission> {
        self.folds.iter().flat_map(|fold| fold.omissions.iter())
    }
}

/// Runs stratified k-fold cross-validation of `classifier` on `data`.
///
/// Configuration and data errors are reported before any model is fitted. A
/// model failure on any fold aborts the run, as does an undefined metric under
/// `UndefinedMetricPolicy::Abort`.
pub fn evaluate<C>(
    data: &EvaluationData,
    classifier: &C,
    settings: &EvaluationSettings,
    observer: &dyn FoldObserver,
) -> Result<CrossValidationResult, EvaluationError>
where
    C: Classifier + ?Sized,
{
    let averaging = settings.validate(data.n_classes())?;
    let assignment = FoldAssignment::stratified(data.stratify(), settings.n_folds, settings.seed)?;

    log::info!(
        "Evaluating {} on {} records, {} features, {} classes with {} stratified folds (seed {}).",
        classifier.name(),
        data.n_records(),
        data.feature_names().len(),
        data.n_classes(),
        settings.n_folds,
        settings.seed
    );
    observer.on_start(settings.n_folds);

    let run_fold = |fold: usize| {
        let result = evaluate_fold(data, classifier, settings, averaging, assignment.split(fold));
        observer.on_fold_finished(fold);
        result
    };
    let folds: Vec<FoldResult> = if settings.parallel {
        (0..settings.n_folds)
            .into_par_iter()
            .map(run_fold)
            .collect::<Result<_, _>>()?
    } else {
        (0..settings.n_folds).map(run_fold).collect::<Result<_, _>>()?
    };
    observer.on_finish();

    let summary = summarize_metrics(&folds);
    let per_fold_importance: Vec<Option<&Array1<f64>>> =
        folds.iter().map(|fold| fold.importance.as_ref()).collect();
    let importance = ImportanceTable::accumulate(data.feature_names(), &per_fold_importance);

    let n_omitted = folds.iter().map(|fold| fold.omissions.len()).sum::<usize>();
    if n_omitted > 0 {
        log::warn!(
            "{n_omitted} per-fold metric values were undefined and excluded from the summary."
        );
    }

    Ok(CrossValidationResult {
        classifier: classifier.name().to_string(),
        n_classes: data.n_classes(),
        feature_names: data.feature_names().to_vec(),
        assignment,
        folds,
        summary,
        importance,
    })
}

fn evaluate_fold<C>(
    data: &EvaluationData,
    classifier: &C,
    settings: &EvaluationSettings,
    averaging: Averaging,
    split: FoldSplit,
) -> Result<FoldResult, EvaluationError>
where
    C: Classifier + ?Sized,
{
    let fold = split.fold;
    let (x_train, y_train) = data.subset(&split.train);
    let (x_test, y_test) = data.subset(&split.test);
    log::debug!(
        "Fold {fold}: {} training and {} held-out records",
        y_train.len(),
        y_test.len()
    );

    let model = classifier
        .fit(x_train.view(), &y_train, data.n_classes())
        .map_err(|source| EvaluationError::Model { fold, source })?;
    let train_scores = predict_checked(model.as_ref(), x_train.view(), fold, data.n_classes())?;
    let test_scores = predict_checked(model.as_ref(), x_test.view(), fold, data.n_classes())?;

    let mut omissions = Vec::new();
    let (train_auc, test_auc) = if auc_defined(
        fold,
        &y_train,
        &y_test,
        data.n_classes(),
        settings.undefined_metrics,
        &mut omissions,
    )? {
        (
            Some(scored_auc(fold, Partition::Train, &y_train, train_scores.view())?),
            Some(scored_auc(fold, Partition::Test, &y_test, test_scores.view())?),
        )
    } else {
        (None, None)
    };

    let bundle = |partition, labels: &[usize], scores: ArrayView2<f64>, auc| {
        MetricBundle::compute(labels, scores, settings.threshold, averaging, auc).map_err(|source| {
            EvaluationError::Metric {
                fold,
                partition,
                source,
            }
        })
    };
    let train = bundle(Partition::Train, &y_train, train_scores.view(), train_auc)?;
    let test = bundle(Partition::Test, &y_test, test_scores.view(), test_auc)?;

    let importance = match model.feature_importance() {
        Some(values) if values.len() != data.feature_names().len() => {
            return Err(EvaluationError::ImportanceLength {
                fold,
                expected: data.feature_names().len(),
                found: values.len(),
            });
        }
        other => other,
    };

    log::debug!(
        "Fold {fold}: test accuracy {:.4}, test AUC {}",
        test.accuracy,
        test.auc.map_or_else(|| "undefined".to_string(), |auc| format!("{auc:.4}"))
    );

    Ok(FoldResult {
        fold,
        n_train: y_train.len(),
        n_test: y_test.len(),
        test_indices: split.test,
        train,
        test,
        importance,
        omissions,
    })
}

fn predict_checked(
    model: &dyn FittedModel,
    x: ArrayView2<f64>,
    fold: usize,
    n_classes: usize,
) -> Result<Array2<f64>, EvaluationError> {
    let scores = model
        .predict_scores(x)
        .map_err(|source| EvaluationError::Model { fold, source })?;
    if scores.nrows() != x.nrows()
        || scores.ncols() != n_classes
        || model.n_classes() != n_classes
    {
        return Err(EvaluationError::ScoreShape {
            fold,
            rows: scores.nrows(),
            columns: scores.ncols(),
            expected_rows: x.nrows(),
            expected_columns: n_classes,
        });
    }
    Ok(scores)
}

/// Whether AUC can be reported for a fold.
///
/// A fold is only AUC-complete when every class appears in both partitions: a
/// class missing from training leaves the model unable to rank it, so neither
/// partition's AUC is reported. A class missing only from the test partition
/// omits the train AUC as well, so both partitions of a fold always report AUC
/// together or not at all. Under `Record` the two undefined values become
/// omissions; under `Abort` the gap is returned as an error.
pub(crate) fn auc_defined(
    fold: usize,
    train_labels: &[usize],
    test_labels: &[usize],
    n_classes: usize,
    policy: UndefinedMetricPolicy,
    omissions: &mut Vec<MetricOmission>,
) -> Result<bool, EvaluationError> {
    let missing_from = |labels: &[usize]| (0..n_classes).find(|class| !labels.contains(class));
    let train_gap = missing_from(train_labels).map(|class| (Partition::Train, class));
    let test_gap = missing_from(test_labels).map(|class| (Partition::Test, class));

    let Some((gap_partition, class)) = train_gap.or(test_gap) else {
        return Ok(true);
    };
    if policy == UndefinedMetricPolicy::Abort {
        return Err(EvaluationError::InsufficientData {
            fold,
            partition: gap_partition,
            metric: Metric::Auc,
            source: MetricError::MissingClass { class },
        });
    }
    log::warn!(
        "Fold {fold}: class {class} is absent from the {gap_partition} partition; \
         AUC is undefined for this fold."
    );
    for partition in [Partition::Train, Partition::Test] {
        omissions.push(MetricOmission {
            fold,
            partition,
            metric: Metric::Auc,
            reason: format!("class {class} absent from the {gap_partition} partition"),
        });
    }
    Ok(false)
}

pub(crate) fn scored_auc(
    fold: usize,
    partition: Partition,
    labels: &[usize],
    scores: ArrayView2<f64>,
) -> Result<f64, EvaluationError> {
    partition_auc(labels, scores).map_err(|source| EvaluationError::Metric {
        fold,
        partition,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopFoldObserver;
    use ndarray::array;
    use std::sync::Mutex;

    /// Scores every record by its first feature, squashed to [0, 1].
    struct FirstFeatureScorer;

    struct FirstFeatureModel {
        n_classes: usize,
    }

    impl FittedModel for FirstFeatureModel {
        fn n_classes(&self) -> usize {
            self.n_classes
        }

        fn predict_scores(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
            let mut scores = Array2::zeros((x.nrows(), 2));
            for (row, &value) in x.column(0).iter().enumerate() {
                let p = 1.0 / (1.0 + (-value).exp());
                scores[[row, 0]] = 1.0 - p;
                scores[[row, 1]] = p;
            }
            Ok(scores)
        }
    }

    impl Classifier for FirstFeatureScorer {
        fn name(&self) -> &'static str {
            "first_feature"
        }

        fn fit(
            &self,
            x: ArrayView2<f64>,
            y: &[usize],
            n_classes: usize,
        ) -> Result<Box<dyn FittedModel>, ModelError> {
            crate::models::validate_training_set(x, y, n_classes)?;
            Ok(Box::new(FirstFeatureModel { n_classes }))
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        finished: Mutex<Vec<usize>>,
    }

    impl RecordingObserver {
        fn finished_folds(&self) -> Vec<usize> {
            let mut folds = self.finished.lock().unwrap().clone();
            folds.sort_unstable();
            folds
        }
    }

    impl FoldObserver for RecordingObserver {
        fn on_fold_finished(&self, fold: usize) {
            self.finished.lock().unwrap().push(fold);
        }
    }

    fn toy_data(n: usize) -> EvaluationData {
        let mut x = Array2::zeros((n, 2));
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let label = i % 2;
            x[[i, 0]] = if label == 1 { 1.0 } else { -1.0 } + (i as f64) * 1e-3;
            x[[i, 1]] = (i % 7) as f64;
            y.push(label);
        }
        EvaluationData::new(x, vec!["a".into(), "b".into()], y.clone(), y).unwrap()
    }

    #[test]
    fn test_data_validation_errors_are_data_kind() {
        let x = array![[1.0, f64::NAN], [0.0, 1.0]];
        let err = EvaluationData::new(x, vec!["a".into(), "b".into()], vec![0, 1], vec![0, 1])
            .unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::NonFiniteFeature { row: 0, ref feature } if feature == "b"
        ));
        assert_eq!(err.kind(), ErrorKind::Data);

        let err = EvaluationData::new(array![[1.0], [2.0]], vec!["a".into()], vec![0], vec![0, 1])
            .unwrap_err();
        assert!(matches!(err, EvaluationError::TargetLengthMismatch { rows: 2, labels: 1 }));

        let err = EvaluationData::new(
            array![[1.0, 2.0]],
            vec!["a".into(), "a".into()],
            vec![1],
            vec![0],
        )
        .unwrap_err();
        assert!(matches!(err, EvaluationError::DuplicateFeatureName(ref name) if name == "a"));

        let err =
            EvaluationData::new(array![[1.0], [2.0]], vec!["a".into()], vec![0, 0], vec![0, 1])
                .unwrap_err();
        assert!(matches!(err, EvaluationError::TooFewClasses { found: 1 }));
    }

    #[test]
    fn test_settings_errors_are_config_kind_and_fail_fast() {
        let data = toy_data(20);
        let observer = RecordingObserver::default();
        for settings in [
            EvaluationSettings {
                n_folds: 1,
                ..EvaluationSettings::default()
            },
            EvaluationSettings {
                threshold: 1.5,
                ..EvaluationSettings::default()
            },
            EvaluationSettings {
                n_folds: 11,
                ..EvaluationSettings::default()
            },
        ] {
            let err = evaluate(&data, &FirstFeatureScorer, &settings, &observer).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "{err}");
        }
        assert!(observer.finished_folds().is_empty());
    }

    #[test]
    fn test_binary_averaging_rejected_for_three_classes() {
        let settings = EvaluationSettings {
            averaging: Averaging::Binary,
            ..EvaluationSettings::default()
        };
        assert!(matches!(
            settings.validate(3),
            Err(EvaluationError::BinaryAveragingForMulticlass { n_classes: 3 })
        ));
        assert_eq!(settings.validate(2).unwrap(), Averaging::Binary);
    }

    #[test]
    fn test_every_fold_reports_to_the_observer() {
        let data = toy_data(40);
        let observer = RecordingObserver::default();
        let settings = EvaluationSettings {
            n_folds: 4,
            ..EvaluationSettings::default()
        };
        let result = evaluate(&data, &FirstFeatureScorer, &settings, &observer).unwrap();
        assert_eq!(observer.finished_folds(), vec![0, 1, 2, 3]);

        let parallel = RecordingObserver::default();
        let settings = EvaluationSettings {
            parallel: true,
            ..settings
        };
        evaluate(&data, &FirstFeatureScorer, &settings, &parallel).unwrap();
        assert_eq!(parallel.finished_folds(), vec![0, 1, 2, 3]);
        assert_eq!(result.folds.len(), 4);
        assert_eq!(result.classifier, "first_feature");
        assert!(result.importance.is_none());
        for fold in &result.folds {
            assert_eq!(fold.test.accuracy, 1.0);
            assert_eq!(fold.test.auc, Some(1.0));
            assert_eq!(fold.n_train + fold.n_test, 40);
        }
    }

    #[test]
    fn test_missing_training_class_leaves_auc_undefined() {
        let record = UndefinedMetricPolicy::Record;
        let mut omissions = Vec::new();
        let defined = auc_defined(3, &[0, 0, 0], &[0, 1], 2, record, &mut omissions).unwrap();
        assert!(!defined);
        assert_eq!(omissions.len(), 2);
        assert!(omissions.iter().all(|o| o.fold == 3 && o.metric == Metric::Auc));

        let abort = UndefinedMetricPolicy::Abort;
        let err = auc_defined(3, &[0, 0, 0], &[0, 1], 2, abort, &mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
        assert!(matches!(
            err,
            EvaluationError::InsufficientData {
                fold: 3,
                partition: Partition::Train,
                metric: Metric::Auc,
                ..
            }
        ));

        let mut none = Vec::new();
        assert!(auc_defined(0, &[0, 1, 2], &[2, 1, 0], 3, abort, &mut none).unwrap());
        assert!(none.is_empty());
    }

    #[test]
    fn test_missing_test_class_omits_auc_of_both_partitions() {
        let mut omissions = Vec::new();
        let record = UndefinedMetricPolicy::Record;
        let defined = auc_defined(1, &[0, 1, 2, 1], &[0, 1], 3, record, &mut omissions).unwrap();
        assert!(!defined);
        let partitions: Vec<Partition> = omissions.iter().map(|o| o.partition).collect();
        assert_eq!(partitions, vec![Partition::Train, Partition::Test]);
        assert!(omissions.iter().all(|o| o.reason == "class 2 absent from the test partition"));

        let abort = UndefinedMetricPolicy::Abort;
        let err = auc_defined(1, &[0, 1, 2, 1], &[0, 1], 3, abort, &mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::InsufficientData {
                fold: 1,
                partition: Partition::Test,
                ..
            }
        ));
    }

    #[test]
    fn test_serial_and_parallel_runs_agree() {
        let data = toy_data(60);
        let sequential = evaluate(
            &data,
            &FirstFeatureScorer,
            &EvaluationSettings {
                n_folds: 5,
                seed: 9,
                ..EvaluationSettings::default()
            },
            &NoopFoldObserver,
        )
        .unwrap();
        let parallel = evaluate(
            &data,
            &FirstFeatureScorer,
            &EvaluationSettings {
                n_folds: 5,
                seed: 9,
                parallel: true,
                ..EvaluationSettings::default()
            },
            &NoopFoldObserver,
        )
        .unwrap();
        assert_eq!(sequential, parallel);
    }
}
