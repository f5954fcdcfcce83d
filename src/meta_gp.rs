//! Second-level Gaussian process over per-perturbation quadrature estimates.
//!
//! Training triples `(alpha_i, mu_i, sigma_i)` are standardised (per-feature
//! inputs, zero-mean/unit-scale outputs, stds scaled along with the outputs),
//! then a fixed-hyperparameter RBF GP with heteroscedastic noise
//! `diag((sigma_i / scale)^2) + noise I` is fitted once. Predictions at a
//! test perturbation are mapped back to the original units, widening the
//! predictive std additively by the mean input sigma.

use crate::error::CbqError;
use crate::linalg::{cholesky_with_jitter, MAX_JITTER_ATTEMPTS};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Fixed hyperparameters of the meta-level regression.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetaGpConfig {
    /// Homoscedastic noise floor added to every Gram diagonal entry and to
    /// the test-test kernel.
    pub noise: f64,
    /// RBF lengthscale in standardised input coordinates.
    pub lengthscale: f64,
}

impl Default for MetaGpConfig {
    fn default() -> Self {
        Self {
            noise: 0.01,
            lengthscale: 0.5,
        }
    }
}

/// A fitted meta-level GP, ready for repeated prediction.
#[derive(Debug)]
pub struct MetaGp {
    x_train: Array2<f64>,
    x_center: Array1<f64>,
    x_scale: Array1<f64>,
    mu_center: f64,
    mu_scale: f64,
    std_widening: f64,
    chol: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    noise: f64,
    lengthscale: f64,
}

impl MetaGp {
    /// Fits the regressor to `n_alpha` triples, one row of `perturbations`
    /// per triple. The single-triple case stays well-defined: every Gram
    /// matrix is 1x1 and the prediction degenerates to that triple's mean.
    ///
    /// # Errors
    /// Fails on an empty training set, mismatched lengths, or a Gram matrix
    /// that cannot be factorised (non-finite inputs).
    pub fn fit(
        perturbations: ArrayView2<f64>,
        means: ArrayView1<f64>,
        stds: ArrayView1<f64>,
        config: &MetaGpConfig,
    ) -> Result<Self, CbqError> {
        let n = perturbations.nrows();
        if n == 0 {
            return Err(CbqError::EmptyTrainingSet);
        }
        if means.len() != n || stds.len() != n {
            return Err(CbqError::Shape(format!(
                "{} perturbations with {} means and {} stds",
                n,
                means.len(),
                stds.len()
            )));
        }

        let mu_center = means.mean().unwrap_or(0.0);
        let mu_scale = means.std(0.0).max(1e-10);
        let std_widening = stds.mean().unwrap_or(0.0);

        let x_center = perturbations
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(perturbations.ncols()));
        let x_scale = perturbations
            .std_axis(Axis(0), 0.0)
            .mapv(|s| s.max(1e-10));
        let mut x_train = perturbations.to_owned();
        for mut row in x_train.axis_iter_mut(Axis(0)) {
            row -= &x_center;
            row /= &x_scale;
        }

        let mut gram = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                gram[(i, j)] = rbf(x_train.row(i), x_train.row(j), config.lengthscale);
            }
            let scaled_sigma = stds[i] / mu_scale;
            gram[(i, i)] += scaled_sigma * scaled_sigma + config.noise;
        }

        let chol = cholesky_with_jitter(gram, 1e-10).ok_or(CbqError::Factorisation {
            attempts: MAX_JITTER_ATTEMPTS,
        })?;
        let mu_std = DVector::from_iterator(n, means.iter().map(|m| (m - mu_center) / mu_scale));
        let alpha = chol.solve(&mu_std);

        Ok(Self {
            x_train,
            x_center,
            x_scale,
            mu_center,
            mu_scale,
            std_widening,
            chol,
            alpha,
            noise: config.noise,
            lengthscale: config.lengthscale,
        })
    }

    /// Predictive `(mean, std)` at one perturbation, in the original units.
    pub fn predict(&self, perturbation: ArrayView1<f64>) -> (f64, f64) {
        assert_eq!(
            perturbation.len(),
            self.x_train.ncols(),
            "test perturbation dimension mismatch"
        );
        let xs = (&perturbation.to_owned() - &self.x_center) / &self.x_scale;

        let n = self.x_train.nrows();
        let k_vec = DVector::from_iterator(
            n,
            (0..n).map(|i| rbf(self.x_train.row(i), xs.view(), self.lengthscale)),
        );

        let mean_std = k_vec.dot(&self.alpha);
        let solved = self.chol.solve(&k_vec);
        let var = (1.0 + self.noise - k_vec.dot(&solved)).max(0.0);

        let mean = mean_std * self.mu_scale + self.mu_center;
        let std = var.sqrt() * self.mu_scale + self.std_widening;
        (mean, std)
    }
}

fn rbf(a: ArrayView1<f64>, b: ArrayView1<f64>, lengthscale: f64) -> f64 {
    let mut d2 = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let diff = x - y;
        d2 += diff * diff;
    }
    (-d2 / (2.0 * lengthscale * lengthscale)).exp()
}
