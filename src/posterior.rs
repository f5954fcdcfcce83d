//! Logistic-regression posterior with a perturbable diagonal Gaussian prior.
//!
//! The density is unnormalised: a `D`-dimensional Gaussian prior with zero
//! mean and diagonal covariance `prior_variances`, plus a Bernoulli
//! log-likelihood with a logistic link over the design matrix. Both the
//! scalar log-density and its gradient (the score feeding the corrected
//! kernel) are closed-form.

use crate::error::CbqError;
use crate::sampler::HamiltonianTarget;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use std::f64::consts::PI;
use std::sync::Arc;

/// Additive guard inside every likelihood logarithm, so saturated link
/// probabilities cannot produce `-inf`.
pub const LOG_GUARD: f64 = 1e-6;

/// A synthetic logistic-regression dataset.
///
/// `design` carries the raw features plus a trailing all-ones bias column, so
/// its column count equals the parameter dimension.
#[derive(Debug, Clone)]
pub struct LogisticData {
    pub design: Array2<f64>,
    pub labels: Array1<f64>,
}

impl LogisticData {
    pub fn n_points(&self) -> usize {
        self.design.nrows()
    }

    /// Parameter dimension, bias coordinate included.
    pub fn dim(&self) -> usize {
        self.design.ncols()
    }
}

/// Draws `n_data` feature rows uniformly from `(-1, 1)^(dim - 1)`, labels
/// each row with probability `sigmoid(row sum)`, and appends the bias column.
pub fn generate_dataset<R: Rng>(n_data: usize, dim: usize, rng: &mut R) -> LogisticData {
    assert!(dim >= 1, "parameter dimension must be at least 1");
    let features = Array2::from_shape_fn((n_data, dim - 1), |_| rng.random_range(-1.0..1.0));
    let labels = Array1::from_shape_fn(n_data, |i| {
        let p = sigmoid(features.row(i).sum());
        f64::from(rng.random_bool(p))
    });

    let mut design = Array2::ones((n_data, dim));
    design.slice_mut(ndarray::s![.., ..dim - 1]).assign(&features);
    LogisticData { design, labels }
}

/// Posterior density for one prior perturbation, shared read-only across
/// threads.
#[derive(Debug, Clone)]
pub struct LogisticPosterior {
    data: Arc<LogisticData>,
    prior_variances: Array1<f64>,
}

impl LogisticPosterior {
    /// # Errors
    /// Rejects non-positive prior variances and a variance vector whose
    /// length differs from the design's column count.
    pub fn new(data: Arc<LogisticData>, prior_variances: Array1<f64>) -> Result<Self, CbqError> {
        if prior_variances.len() != data.dim() {
            return Err(CbqError::Shape(format!(
                "prior variance vector has length {}, design has {} columns",
                prior_variances.len(),
                data.dim()
            )));
        }
        for (index, &value) in prior_variances.iter().enumerate() {
            if !(value > 0.0) {
                return Err(CbqError::InvalidPriorVariance { index, value });
            }
        }
        Ok(Self {
            data,
            prior_variances,
        })
    }

    pub fn dim(&self) -> usize {
        self.prior_variances.len()
    }

    /// Unnormalised log-posterior at `beta`.
    ///
    /// The prior's normalising constant is kept: it depends on the perturbed
    /// variances, and the importance-sampling reweighting between two
    /// perturbations needs the ratio to carry it.
    pub fn log_density(&self, beta: ArrayView1<f64>) -> f64 {
        let mut logp = 0.0;
        for (&b, &v) in beta.iter().zip(self.prior_variances.iter()) {
            logp -= 0.5 * ((2.0 * PI * v).ln() + b * b / v);
        }

        let z = self.data.design.dot(&beta);
        for (&zi, &yi) in z.iter().zip(self.data.labels.iter()) {
            let p = sigmoid(zi);
            logp += yi * (p + LOG_GUARD).ln() + (1.0 - yi) * (1.0 - p + LOG_GUARD).ln();
        }
        logp
    }

    /// Gradient of the log-posterior at `beta`.
    pub fn score(&self, beta: ArrayView1<f64>) -> Array1<f64> {
        let mut grad = Array1::zeros(beta.len());
        self.logp_and_grad_view(beta, &mut grad);
        grad
    }

    /// Log-density over a batch of parameter vectors, one row each.
    pub fn log_density_batch(&self, betas: ArrayView2<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(betas.nrows());
        for (o, row) in out.iter_mut().zip(betas.rows()) {
            *o = self.log_density(row);
        }
        out
    }

    /// Scores over a batch of parameter vectors, one row each.
    pub fn score_batch(&self, betas: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(betas.dim());
        for (mut orow, row) in out.axis_iter_mut(Axis(0)).zip(betas.rows()) {
            let mut grad = Array1::zeros(row.len());
            self.logp_and_grad_view(row, &mut grad);
            orow.assign(&grad);
        }
        out
    }

    fn logp_and_grad_view(&self, beta: ArrayView1<f64>, grad: &mut Array1<f64>) -> f64 {
        let mut logp = 0.0;
        for ((g, &b), &v) in grad
            .iter_mut()
            .zip(beta.iter())
            .zip(self.prior_variances.iter())
        {
            logp -= 0.5 * ((2.0 * PI * v).ln() + b * b / v);
            *g = -b / v;
        }

        let z = self.data.design.dot(&beta);
        let mut weights = Array1::zeros(z.len());
        for ((&zi, &yi), w) in z
            .iter()
            .zip(self.data.labels.iter())
            .zip(weights.iter_mut())
        {
            let p = sigmoid(zi);
            logp += yi * (p + LOG_GUARD).ln() + (1.0 - yi) * (1.0 - p + LOG_GUARD).ln();
            let dp = p * (1.0 - p);
            *w = yi * dp / (p + LOG_GUARD) - (1.0 - yi) * dp / (1.0 - p + LOG_GUARD);
        }
        *grad += &self.data.design.t().dot(&weights);
        logp
    }
}

impl HamiltonianTarget for LogisticPosterior {
    fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
        self.logp_and_grad_view(position.view(), grad)
    }
}

/// Numerically stable logistic link.
fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn toy_posterior(seed: u64, dim: usize) -> LogisticPosterior {
        let mut rng = SmallRng::seed_from_u64(seed);
        let data = Arc::new(generate_dataset(40, dim, &mut rng));
        let variances = Array1::from_elem(dim, 5.0);
        LogisticPosterior::new(data, variances).unwrap()
    }

    #[test]
    fn dataset_has_bias_column_and_binary_labels() {
        let mut rng = SmallRng::seed_from_u64(3);
        let data = generate_dataset(25, 4, &mut rng);
        assert_eq!(data.design.dim(), (25, 4));
        assert!(data.design.column(3).iter().all(|&v| v == 1.0));
        assert!(data.labels.iter().all(|&y| y == 0.0 || y == 1.0));
        assert!(data
            .design
            .slice(ndarray::s![.., ..3])
            .iter()
            .all(|&v| (-1.0..1.0).contains(&v)));
    }

    #[test]
    fn non_positive_variance_is_rejected() {
        let mut rng = SmallRng::seed_from_u64(5);
        let data = Arc::new(generate_dataset(10, 3, &mut rng));
        let err = LogisticPosterior::new(data, ndarray::arr1(&[5.0, 0.0, 5.0])).unwrap_err();
        assert!(matches!(
            err,
            CbqError::InvalidPriorVariance { index: 1, .. }
        ));
    }

    #[test]
    fn score_matches_finite_differences() {
        let posterior = toy_posterior(17, 3);
        let beta = ndarray::arr1(&[0.4, -0.9, 0.2]);
        let grad = posterior.score(beta.view());

        let h = 1e-6;
        for d in 0..3 {
            let mut hi = beta.clone();
            let mut lo = beta.clone();
            hi[d] += h;
            lo[d] -= h;
            let numeric =
                (posterior.log_density(hi.view()) - posterior.log_density(lo.view())) / (2.0 * h);
            assert_abs_diff_eq!(grad[d], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn batch_forms_agree_with_single_evaluations() {
        let posterior = toy_posterior(29, 3);
        let betas = ndarray::arr2(&[[0.1, 0.2, -0.3], [-1.0, 0.5, 0.0]]);
        let logps = posterior.log_density_batch(betas.view());
        let scores = posterior.score_batch(betas.view());
        for (i, row) in betas.rows().into_iter().enumerate() {
            assert_abs_diff_eq!(logps[i], posterior.log_density(row), epsilon = 1e-12);
            let single = posterior.score(row);
            for d in 0..3 {
                assert_abs_diff_eq!(scores[[i, d]], single[d], epsilon = 1e-12);
            }
        }
    }
}
