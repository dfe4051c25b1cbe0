//! # Classifier Capabilities
//!
//! The evaluator treats model fitting as an opaque capability: a `Classifier`
//! turns a training partition into a `FittedModel`, and a fitted model turns a
//! feature matrix into one score column per class. Feature importances are an
//! optional capability; models without them return `None`.
//!
//! Two families are provided, matching the analyses this crate was built for:
//! penalised logistic regression and second-order gradient boosted trees.

pub mod gbdt;
pub mod logistic;

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gbdt::{BoostedEnsemble, BoostingParams, GradientBoostedTrees, ScalePosWeight};
pub use logistic::{FittedLogistic, LogisticParams, LogisticRegression};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Cannot fit a model on an empty training partition.")]
    EmptyTrainingSet,
    #[error("The feature matrix has {rows} rows but {labels} labels were supplied.")]
    LabelCountMismatch { rows: usize, labels: usize },
    #[error("Label {label} is outside the {n_classes} classes the model was asked to fit.")]
    LabelOutOfRange { label: usize, n_classes: usize },
    #[error("At least two classes are required, but only {0} was requested.")]
    TooFewClasses(usize),
    #[error("The model was fitted on {expected} features but received {found}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("Invalid model parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("The Newton system could not be solved: {0}")]
    LinearSolve(#[from] ndarray_linalg::error::LinalgError),
    #[error("Model fitting produced non-finite coefficients after {iterations} iterations.")]
    NonFiniteCoefficients { iterations: usize },
}

/// A model fitted on one training partition.
pub trait FittedModel: Send {
    fn n_classes(&self) -> usize;

    /// One row per record and one column per class; each row sums to one.
    fn predict_scores(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError>;

    /// Non-negative contribution score per feature, when the model family has one.
    fn feature_importance(&self) -> Option<Array1<f64>> {
        None
    }
}

/// The fitting capability handed to the evaluator.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: &[usize],
        n_classes: usize,
    ) -> Result<Box<dyn FittedModel>, ModelError>;
}

/// Serializable choice of model family and its hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Logistic(LogisticParams),
    Boosted(BoostingParams),
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelSpec::Boosted(BoostingParams::default())
    }
}

impl ModelSpec {
    /// Propagates the run seed into families with internal randomness.
    pub fn with_seed(self, seed: u64) -> Self {
        match self {
            ModelSpec::Boosted(params) => ModelSpec::Boosted(BoostingParams { seed, ..params }),
            other => other,
        }
    }

    pub fn build(&self) -> Box<dyn Classifier> {
        match self {
            ModelSpec::Logistic(params) => Box::new(LogisticRegression::new(params.clone())),
            ModelSpec::Boosted(params) => Box::new(GradientBoostedTrees::new(params.clone())),
        }
    }
}

/// Shape and label checks shared by every model family.
pub(crate) fn validate_training_set(
    x: ArrayView2<f64>,
    y: &[usize],
    n_classes: usize,
) -> Result<(), ModelError> {
    if n_classes < 2 {
        return Err(ModelError::TooFewClasses(n_classes));
    }
    if x.nrows() == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    if x.nrows() != y.len() {
        return Err(ModelError::LabelCountMismatch {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    if let Some(&label) = y.iter().find(|&&label| label >= n_classes) {
        return Err(ModelError::LabelOutOfRange { label, n_classes });
    }
    Ok(())
}

pub(crate) fn check_feature_count(expected: usize, x: ArrayView2<f64>) -> Result<(), ModelError> {
    if x.ncols() != expected {
        return Err(ModelError::FeatureCountMismatch {
            expected,
            found: x.ncols(),
        });
    }
    Ok(())
}

pub(crate) fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp())
}
