//! Bayesian Monte Carlo estimation of one perturbation's QoI expectation.
//!
//! A zero-mean Gaussian process with covariance
//! `A * k_s(Y, Y; l) + c` (the scalar offset acts as a constant kernel over
//! all entries) is fitted to the standardised QoI values by a fixed number of
//! Adam steps on the negative log marginal likelihood, jointly over
//! `(log l, c, A)`. At the fitted hyperparameters the quadrature weight model
//! gives the closed forms
//!
//! ```text
//! mean = c * 1^T K^-1 z,    std = sqrt(c - c^2 * 1^T K^-1 1).
//! ```
//!
//! All factorisations go through Cholesky on `K + ridge I`; degeneracy is
//! recovered locally (skipped step, fallback std) and never surfaces as an
//! error.

use crate::error::CbqError;
use crate::kernels::{median_lengthscale, stein_rbf_kernel_parts};
use crate::linalg::{cholesky_with_jitter, frobenius, log_det, quad_form, to_dmatrix};
use crate::sampler::dedup_rows;
use log::{debug, warn};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{ArrayView1, ArrayView2};

/// Posterior std used when the fitted weight model reports a non-finite
/// uncertainty (the optimiser can push the offset below the numerical floor,
/// making the implied variance negative). Applied instead of propagating NaN
/// and logged on every application.
pub const DEGENERATE_STD: f64 = 0.3;

/// Lower bound keeping the offset and amplitude strictly positive across
/// optimiser steps.
const POSITIVE_FLOOR: f64 = 1e-12;

/// Tuning knobs of the marginal-likelihood fit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BmcConfig {
    /// Fixed number of optimiser iterations; there is no convergence check,
    /// which caps the latency of every fit deterministically.
    pub opt_steps: usize,
    pub learning_rate: f64,
    /// Ridge added to the Gram diagonal before every factorisation.
    pub ridge: f64,
    /// Replacement for a non-finite posterior std, in standardised units.
    pub fallback_std: f64,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            opt_steps: 10_000,
            learning_rate: 1e-2,
            ridge: 1e-6,
            fallback_std: DEGENERATE_STD,
        }
    }
}

/// Quadrature estimate together with the hyperparameters that produced it.
#[derive(Debug, Clone, Copy)]
pub struct BmcEstimate {
    pub mean: f64,
    pub std: f64,
    pub lengthscale: f64,
    pub offset: f64,
    pub amplitude: f64,
    pub nll: f64,
}

/// One optimiser step, as seen by the trace observer.
#[derive(Debug, Clone, Copy)]
pub struct OptRecord {
    pub step: usize,
    pub nll: f64,
    pub lengthscale: f64,
    pub offset: f64,
    pub amplitude: f64,
}

/// Estimates `E[g(Y)]` from one perturbation's conditioned sample batch.
///
/// # Arguments
/// - `samples`: posterior draws, one per row.
/// - `scores`: log-density gradients at the corresponding rows.
/// - `qoi`: QoI value per row; standardised internally, results are returned
///   in the original units.
///
/// # Errors
/// Fails when fewer than two distinct samples are supplied or when the input
/// shapes disagree. Numerical degeneracy does not error, see [`DEGENERATE_STD`].
pub fn estimate(
    samples: ArrayView2<f64>,
    scores: ArrayView2<f64>,
    qoi: ArrayView1<f64>,
    config: &BmcConfig,
) -> Result<BmcEstimate, CbqError> {
    estimate_traced(samples, scores, qoi, config, |_| {})
}

/// [`estimate`] with an observer invoked once per optimiser step, for
/// external trajectory consumers.
pub fn estimate_traced(
    samples: ArrayView2<f64>,
    scores: ArrayView2<f64>,
    qoi: ArrayView1<f64>,
    config: &BmcConfig,
    mut observer: impl FnMut(&OptRecord),
) -> Result<BmcEstimate, CbqError> {
    let n = samples.nrows();
    if scores.dim() != samples.dim() {
        return Err(CbqError::Shape(format!(
            "scores {:?} do not match samples {:?}",
            scores.dim(),
            samples.dim()
        )));
    }
    if qoi.len() != n {
        return Err(CbqError::Shape(format!(
            "{} QoI values for {} samples",
            qoi.len(),
            n
        )));
    }
    let distinct = dedup_rows(samples).nrows();
    if distinct < 2 {
        return Err(CbqError::TooFewSamples {
            distinct,
            required: 2,
        });
    }

    // Standardise the QoI; the fit runs on z and the closed forms are mapped
    // back to the original units at the end.
    let center = qoi.mean().unwrap_or(0.0);
    let scale = qoi.std(0.0).max(1e-10);
    let z = DVector::from_iterator(n, qoi.iter().map(|g| (g - center) / scale));
    let var_z = z.iter().map(|v| v * v).sum::<f64>() / n as f64;

    let mut log_l = median_lengthscale(samples).max(1e-6).ln();
    let mut c = var_z;
    let mut a = var_z;

    // Adam over (log l, c, A).
    let (beta_1, beta_2, adam_eps) = (0.9, 0.999, 1e-8);
    let mut moment = [0.0_f64; 3];
    let mut second = [0.0_f64; 3];
    let mut skipped = 0_usize;

    for step in 0..config.opt_steps {
        match objective(samples, scores, &z, log_l, c, a, config.ridge) {
            Some((nll, grads)) => {
                observer(&OptRecord {
                    step,
                    nll,
                    lengthscale: log_l.exp(),
                    offset: c,
                    amplitude: a,
                });

                let t = (step + 1) as i32;
                let mut params = [log_l, c, a];
                for (i, g) in grads.iter().enumerate() {
                    moment[i] = beta_1 * moment[i] + (1.0 - beta_1) * g;
                    second[i] = beta_2 * second[i] + (1.0 - beta_2) * g * g;
                    let m_hat = moment[i] / (1.0 - beta_1.powi(t));
                    let v_hat = second[i] / (1.0 - beta_2.powi(t));
                    params[i] -= config.learning_rate * m_hat / (v_hat.sqrt() + adam_eps);
                }
                log_l = params[0];
                c = params[1].max(POSITIVE_FLOOR);
                a = params[2].max(POSITIVE_FLOOR);
            }
            None => {
                // Unfactorisable proposal; keep the previous hyperparameters.
                skipped += 1;
                observer(&OptRecord {
                    step,
                    nll: f64::NAN,
                    lengthscale: log_l.exp(),
                    offset: c,
                    amplitude: a,
                });
            }
        }
    }
    if skipped > 0 {
        debug!("marginal-likelihood fit skipped {skipped} unfactorisable steps");
    }

    let lengthscale = log_l.exp();
    let (mean_z, var_z_post, nll) = match quadrature(samples, scores, &z, log_l, c, a, config.ridge)
    {
        Some(out) => out,
        None => {
            warn!(
                "final Gram factorisation failed (l={lengthscale:.3e}, c={c:.3e}, A={a:.3e}); \
                 falling back to the sample mean"
            );
            (0.0, f64::NAN, f64::NAN)
        }
    };
    let std_z = finalize_std(var_z_post, config.fallback_std);

    Ok(BmcEstimate {
        mean: mean_z * scale + center,
        std: std_z * scale,
        lengthscale,
        offset: c,
        amplitude: a,
        nll,
    })
}

/// `sqrt` of the posterior variance, degrading to the fallback.
fn finalize_std(variance: f64, fallback: f64) -> f64 {
    let std = variance.sqrt();
    if std.is_finite() {
        std
    } else {
        warn!("non-finite posterior std (variance {variance:.3e}); using fallback {fallback}");
        fallback
    }
}

/// Negative log marginal likelihood and its gradient in `(log l, c, A)`.
///
/// With `P = K^-1` and `alpha = K^-1 z`, each component is
/// `0.5 * (<P, dK>_F - alpha^T dK alpha)` for `dK` one of `1 1^T`, `K_s`,
/// `A l dK_s/dl`.
fn objective(
    samples: ArrayView2<f64>,
    scores: ArrayView2<f64>,
    z: &DVector<f64>,
    log_l: f64,
    c: f64,
    a: f64,
    ridge: f64,
) -> Option<(f64, [f64; 3])> {
    let l = log_l.exp();
    let (k_stein, k_dl) = stein_parts(samples, scores, l);
    let chol = factor(&k_stein, c, a, ridge)?;

    let alpha = chol.solve(z);
    let p = chol.inverse();
    let nll = 0.5 * z.dot(&alpha) + 0.5 * log_det(&chol);

    let alpha_sum = alpha.sum();
    let d_c = 0.5 * (p.sum() - alpha_sum * alpha_sum);
    let d_a = 0.5 * (frobenius(&p, &k_stein) - quad_form(&k_stein, &alpha));
    let d_log_l = 0.5 * a * l * (frobenius(&p, &k_dl) - quad_form(&k_dl, &alpha));

    Some((nll, [d_log_l, d_c, d_a]))
}

/// Closed-form quadrature outputs at fixed hyperparameters:
/// `(mean, variance, nll)` in standardised units.
fn quadrature(
    samples: ArrayView2<f64>,
    scores: ArrayView2<f64>,
    z: &DVector<f64>,
    log_l: f64,
    c: f64,
    a: f64,
    ridge: f64,
) -> Option<(f64, f64, f64)> {
    let l = log_l.exp();
    let (k_stein, _) = stein_parts(samples, scores, l);
    let chol = factor(&k_stein, c, a, ridge)?;

    let alpha = chol.solve(z);
    let ones = DVector::from_element(z.len(), 1.0);
    let weights = chol.solve(&ones);

    let mean = c * alpha.sum();
    let variance = c - c * c * weights.sum();
    let nll = 0.5 * z.dot(&alpha) + 0.5 * log_det(&chol);
    Some((mean, variance, nll))
}

fn stein_parts(
    samples: ArrayView2<f64>,
    scores: ArrayView2<f64>,
    l: f64,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let (k, dk) = stein_rbf_kernel_parts(samples, scores, samples, scores, l);
    (to_dmatrix(&k), to_dmatrix(&dk))
}

/// Cholesky of `A K_s + c 1 1^T + ridge I`, retrying with escalating jitter.
fn factor(k_stein: &DMatrix<f64>, c: f64, a: f64, ridge: f64) -> Option<Cholesky<f64, Dyn>> {
    let n = k_stein.nrows();
    let mut gram = k_stein * a;
    gram.iter_mut().for_each(|v| *v += c);
    for i in 0..n {
        gram[(i, i)] += ridge;
    }
    cholesky_with_jitter(gram, ridge)
}
