//! # Penalised Logistic Regression
//!
//! Maximises the L2-penalised Bernoulli log-likelihood
//!
//! ```text
//! sum_i log p(y_i | x_i) - ||w||^2 / (2 C)
//! ```
//!
//! by Newton-Raphson, which for the logit link is the same iteration as IRLS.
//! The intercept is left unpenalised. Each step solves `H d = g` with the
//! penalised Hessian `X' W X + I_w / C`.
//!
//! More than two classes are handled one-vs-rest: one binary model per class,
//! with the per-class probabilities renormalised to sum to one. A one-vs-rest
//! target with no positives (or no negatives) in the training partition cannot
//! be fitted by Newton's method because the intercept diverges, so it becomes a
//! constant model at the clamped observed prevalence.

use super::{
    Classifier, FittedModel, ModelError, check_feature_count, sigmoid, validate_training_set,
};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

/// Probabilities are kept this far away from 0 and 1 to keep the IRLS weights positive.
const PROBABILITY_FLOOR: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticParams {
    /// Inverse regularisation strength; smaller values penalise more.
    pub c: f64,
    pub max_iterations: usize,
    /// Convergence threshold on the largest absolute Newton step.
    pub tolerance: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

pub struct LogisticRegression {
    params: LogisticParams,
}

impl LogisticRegression {
    pub fn new(params: LogisticParams) -> Self {
        Self { params }
    }

    /// Fits and returns the concrete model type.
    pub fn fit_logistic(
        &self,
        x: ArrayView2<f64>,
        y: &[usize],
        n_classes: usize,
    ) -> Result<FittedLogistic, ModelError> {
        validate_training_set(x, y, n_classes)?;
        if !(self.params.c > 0.0 && self.params.c.is_finite()) {
            return Err(ModelError::InvalidParameter {
                name: "c",
                reason: format!("must be a positive finite number, got {}", self.params.c),
            });
        }
        if self.params.max_iterations == 0 {
            return Err(ModelError::InvalidParameter {
                name: "max_iterations",
                reason: "must be at least 1".to_string(),
            });
        }

        let design = with_intercept(x);
        let targets: Vec<usize> = if n_classes == 2 { vec![1] } else { (0..n_classes).collect() };

        let mut coefficients = Array2::zeros((targets.len(), design.ncols()));
        for (row, &class) in targets.iter().enumerate() {
            let indicator =
                Array1::from_iter(y.iter().map(|&label| f64::from(u8::from(label == class))));
            let beta = self.newton(&design, &indicator)?;
            coefficients.row_mut(row).assign(&beta);
        }

        Ok(FittedLogistic {
            coefficients,
            n_classes,
        })
    }

    fn newton(
        &self,
        design: &Array2<f64>,
        target: &Array1<f64>,
    ) -> Result<Array1<f64>, ModelError> {
        let n = target.len() as f64;
        let positives = target.sum();
        let mut beta = Array1::<f64>::zeros(design.ncols());

        if positives == 0.0 || positives == n {
            let prevalence = (positives / n).clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
            beta[0] = (prevalence / (1.0 - prevalence)).ln();
            log::debug!(
                "Single-class target; using a constant model at prevalence {prevalence:.3e}"
            );
            return Ok(beta);
        }

        let lambda = 1.0 / self.params.c;
        for iteration in 1..=self.params.max_iterations {
            let mu = design
                .dot(&beta)
                .mapv(|eta| sigmoid(eta).clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR));
            let weights = mu.mapv(|p| p * (1.0 - p));

            let mut gradient = design.t().dot(&(&mu - target));
            gradient
                .slice_mut(s![1..])
                .scaled_add(lambda, &beta.slice(s![1..]));

            let weighted_design = design * &weights.view().insert_axis(Axis(1));
            let mut hessian = design.t().dot(&weighted_design);
            for j in 1..hessian.nrows() {
                hessian[[j, j]] += lambda;
            }

            let step = hessian.solve_into(gradient)?;
            beta -= &step;

            if beta.iter().any(|b| !b.is_finite()) {
                return Err(ModelError::NonFiniteCoefficients {
                    iterations: iteration,
                });
            }

            let max_step = step.iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
            log::debug!("[Newton] iteration {iteration}: max |step| = {max_step:.3e}");
            if max_step < self.params.tolerance {
                return Ok(beta);
            }
        }

        log::warn!(
            "Logistic regression did not converge within {} iterations; using the last iterate.",
            self.params.max_iterations
        );
        Ok(beta)
    }
}

impl Classifier for LogisticRegression {
    fn name(&self) -> &'static str {
        "logistic_regression"
    }

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: &[usize],
        n_classes: usize,
    ) -> Result<Box<dyn FittedModel>, ModelError> {
        Ok(Box::new(self.fit_logistic(x, y, n_classes)?))
    }
}

/// A fitted logistic model: one coefficient row `[intercept, w_1, ..., w_p]` per
/// binary sub-model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedLogistic {
    coefficients: Array2<f64>,
    n_classes: usize,
}

impl FittedLogistic {
    pub fn coefficients(&self) -> &Array2<f64> {
        &self.coefficients
    }

    fn n_features(&self) -> usize {
        self.coefficients.ncols() - 1
    }
}

impl FittedModel for FittedLogistic {
    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn predict_scores(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        check_feature_count(self.n_features(), x)?;
        let design = with_intercept(x);
        let probabilities = design.dot(&self.coefficients.t()).mapv(sigmoid);

        if self.n_classes == 2 {
            let mut scores = Array2::zeros((x.nrows(), 2));
            scores.column_mut(1).assign(&probabilities.column(0));
            scores.column_mut(0).assign(&probabilities.column(0).mapv(|p| 1.0 - p));
            return Ok(scores);
        }

        let mut scores = probabilities;
        for mut row in scores.rows_mut() {
            let total = row.sum();
            if total > 0.0 {
                row /= total;
            } else {
                row.fill(1.0 / self.n_classes as f64);
            }
        }
        Ok(scores)
    }
}

fn with_intercept(x: ArrayView2<f64>) -> Array2<f64> {
    let mut design = Array2::ones((x.nrows(), x.ncols() + 1));
    design.slice_mut(s![.., 1..]).assign(&x);
    design
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn shifted_gaussian_classes(
        n_per_class: usize,
        n_classes: usize,
        seed: u64,
    ) -> (Array2<f64>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = n_per_class * n_classes;
        let mut x = Array2::zeros((n, 2));
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % n_classes;
            let angle = class as f64 * std::f64::consts::TAU / n_classes as f64;
            x[[i, 0]] = 3.0 * angle.cos() + rng.gen_range(-1.0..1.0);
            x[[i, 1]] = 3.0 * angle.sin() + rng.gen_range(-1.0..1.0);
            y.push(class);
        }
        (x, y)
    }

    #[test]
    fn test_binary_fit_separates_shifted_classes() {
        let (x, y) = shifted_gaussian_classes(50, 2, 1);
        let model = LogisticRegression::new(LogisticParams::default())
            .fit_logistic(x.view(), &y, 2)
            .unwrap();
        let scores = model.predict_scores(x.view()).unwrap();

        let correct = y
            .iter()
            .enumerate()
            .filter(|&(i, &label)| usize::from(scores[[i, 1]] >= 0.5) == label)
            .count();
        assert!(correct >= 95, "only {correct} of 100 records classified correctly");

        // class 1 sits at negative x0, so the first weight must be negative
        assert!(model.coefficients()[[0, 1]] < 0.0);
        for row in scores.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_stronger_penalty_shrinks_weights() {
        let (x, y) = shifted_gaussian_classes(40, 2, 2);
        let loose = LogisticRegression::new(LogisticParams::default())
            .fit_logistic(x.view(), &y, 2)
            .unwrap();
        let tight = LogisticRegression::new(LogisticParams {
            c: 0.01,
            ..LogisticParams::default()
        })
        .fit_logistic(x.view(), &y, 2)
        .unwrap();
        let norm = |m: &FittedLogistic| m.coefficients().slice(s![0, 1..]).mapv(|w| w * w).sum();
        assert!(norm(&tight) < norm(&loose));
    }

    #[test]
    fn test_one_vs_rest_scores_are_normalised() {
        let (x, y) = shifted_gaussian_classes(30, 3, 3);
        let model = LogisticRegression::new(LogisticParams::default())
            .fit_logistic(x.view(), &y, 3)
            .unwrap();
        assert_eq!(model.coefficients().nrows(), 3);
        let scores = model.predict_scores(x.view()).unwrap();
        assert_eq!(scores.shape(), &[90, 3]);
        for row in scores.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_single_class_training_gives_constant_model() {
        let x = array![[0.1, 1.0], [0.4, -1.0], [0.3, 0.5]];
        let model = LogisticRegression::new(LogisticParams::default())
            .fit_logistic(x.view(), &[0, 0, 0], 2)
            .unwrap();
        let scores = model.predict_scores(x.view()).unwrap();
        for row in scores.rows() {
            assert!(row[1] < 1e-6);
        }
        assert_eq!(model.feature_importance(), None);
    }

    #[test]
    fn test_prediction_rejects_wrong_feature_count() {
        let (x, y) = shifted_gaussian_classes(10, 2, 4);
        let model = LogisticRegression::new(LogisticParams::default())
            .fit_logistic(x.view(), &y, 2)
            .unwrap();
        let err = model.predict_scores(array![[1.0, 2.0, 3.0]].view()).unwrap_err();
        assert!(matches!(
            err,
            ModelError::FeatureCountMismatch { expected: 2, found: 3 }
        ));
    }

    #[test]
    fn test_invalid_penalty_is_rejected() {
        let (x, y) = shifted_gaussian_classes(5, 2, 5);
        let err = LogisticRegression::new(LogisticParams {
            c: 0.0,
            ..LogisticParams::default()
        })
        .fit_logistic(x.view(), &y, 2)
        .unwrap_err();
        assert!(matches!(err, ModelError::InvalidParameter { name: "c", .. }));
    }
}
