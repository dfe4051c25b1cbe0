//! Held-out performance of a boosted ensemble as a function of the number of
//! boosting rounds, cross-validated on the same stratified folds as `evaluate`.

use crate::folds::FoldAssignment;
use crate::harness::{
    EvaluationData, EvaluationError, EvaluationSettings, Partition, auc_defined, scored_auc,
};
use crate::metrics::{Averaging, MetricBundle, log_loss};
use crate::models::{BoostingParams, Classifier, GradientBoostedTrees};
use crate::progress::FoldObserver;
use crate::summary::MetricStats;
use ndarray::Array2;
use rayon::prelude::*;
use serde::Serialize;

/// Cross-fold statistics for one partition at one boosting round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurvePoint {
    pub auc: MetricStats,
    pub log_loss: MetricStats,
    /// Misclassification rate at the configured threshold.
    pub error: MetricStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoundStats {
    /// One-based round number.
    pub round: usize,
    pub train: CurvePoint,
    pub test: CurvePoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoostingCurve {
    pub rounds: Vec<RoundStats>,
}

impl BoostingCurve {
    /// The round with the highest mean test AUC; the earliest wins a tie.
    pub fn best_round(&self) -> Option<&RoundStats> {
        let mut best: Option<(&RoundStats, f64)> = None;
        for stats in &self.rounds {
            if let Some(mean) = stats.test.auc.mean {
                if best.is_none_or(|(_, best_mean)| mean > best_mean) {
                    best = Some((stats, mean));
                }
            }
        }
        best.map(|(stats, _)| stats)
    }
}

/// Per-round values of one partition of one fold.
#[derive(Default)]
struct FoldTrace {
    auc: Vec<Option<f64>>,
    log_loss: Vec<f64>,
    error: Vec<f64>,
}

struct PartitionScorer<'a> {
    fold: usize,
    partition: Partition,
    labels: &'a [usize],
    auc_defined: bool,
    threshold: f64,
    averaging: Averaging,
}

impl PartitionScorer<'_> {
    fn record(&self, trace: &mut FoldTrace, scores: &Array2<f64>) -> Result<(), EvaluationError> {
        let metric_error = |source| EvaluationError::Metric {
            fold: self.fold,
            partition: self.partition,
            source,
        };
        trace.auc.push(if self.auc_defined {
            Some(scored_auc(self.fold, self.partition, self.labels, scores.view())?)
        } else {
            None
        });
        trace
            .log_loss
            .push(log_loss(self.labels, scores.view()).map_err(metric_error)?);
        let bundle = MetricBundle::compute(
            self.labels,
            scores.view(),
            self.threshold,
            self.averaging,
            None,
        )
        .map_err(metric_error)?;
        trace.error.push(1.0 - bundle.accuracy);
        Ok(())
    }
}

/// Fits one ensemble per fold and scores its staged predictions after every round.
///
/// AUC follows the same undefined-metric policy as `evaluate`; the per-round
/// statistics exclude folds where it is undefined. As with `evaluate`, the
/// settings' seed only drives the fold assignment; row subsampling is seeded by
/// `params.seed`.
pub fn boosting_curve(
    data: &EvaluationData,
    params: &BoostingParams,
    settings: &EvaluationSettings,
    observer: &dyn FoldObserver,
) -> Result<BoostingCurve, EvaluationError> {
    let averaging = settings.validate(data.n_classes())?;
    let assignment = FoldAssignment::stratified(data.stratify(), settings.n_folds, settings.seed)?;
    let booster = GradientBoostedTrees::new(params.clone());
    log::info!(
        "Tracing {} rounds of {} over {} folds.",
        booster.params().num_rounds,
        booster.name(),
        settings.n_folds
    );
    observer.on_start(settings.n_folds);

    let trace_fold = |fold: usize| -> Result<[FoldTrace; 2], EvaluationError> {
        let split = assignment.split(fold);
        let (x_train, y_train) = data.subset(&split.train);
        let (x_test, y_test) = data.subset(&split.test);
        let ensemble = booster
            .fit_ensemble(x_train.view(), &y_train, data.n_classes())
            .map_err(|source| EvaluationError::Model { fold, source })?;

        // the class gap does not change between rounds, so the omission is decided once per fold
        let defined = auc_defined(
            fold,
            &y_train,
            &y_test,
            data.n_classes(),
            settings.undefined_metrics,
            &mut Vec::new(),
        )?;
        let scorer = |partition, labels| PartitionScorer {
            fold,
            partition,
            labels,
            auc_defined: defined,
            threshold: settings.threshold,
            averaging,
        };
        let train_scorer = scorer(Partition::Train, y_train.as_slice());
        let test_scorer = scorer(Partition::Test, y_test.as_slice());

        let model_error = |source| EvaluationError::Model { fold, source };
        let train_stages = ensemble.staged_scores(x_train.view()).map_err(model_error)?;
        let test_stages = ensemble.staged_scores(x_test.view()).map_err(model_error)?;

        let mut traces = [FoldTrace::default(), FoldTrace::default()];
        for (train_scores, test_scores) in train_stages.zip(test_stages) {
            train_scorer.record(&mut traces[0], &train_scores)?;
            test_scorer.record(&mut traces[1], &test_scores)?;
        }
        observer.on_fold_finished(fold);
        Ok(traces)
    };

    let traces: Vec<[FoldTrace; 2]> = if settings.parallel {
        (0..settings.n_folds)
            .into_par_iter()
            .map(trace_fold)
            .collect::<Result<_, _>>()?
    } else {
        (0..settings.n_folds).map(trace_fold).collect::<Result<_, _>>()?
    };
    observer.on_finish();

    let point = |round: usize, side: usize| CurvePoint {
        auc: MetricStats::from_values(traces.iter().map(|t| t[side].auc[round])),
        log_loss: MetricStats::from_values(traces.iter().map(|t| Some(t[side].log_loss[round]))),
        error: MetricStats::from_values(traces.iter().map(|t| Some(t[side].error[round]))),
    };
    let rounds = (0..booster.params().num_rounds)
        .map(|round| RoundStats {
            round: round + 1,
            train: point(round, 0),
            test: point(round, 1),
        })
        .collect();

    Ok(BoostingCurve { rounds })
}
