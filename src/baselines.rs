//! Competing estimators sharing the meta-level prediction contract.
//!
//! Both return `(mean, std)` at the test perturbation, the same shape the
//! meta-GP reports, so the orchestrator can record them side by side.

use crate::error::CbqError;
use crate::linalg::{cholesky_with_jitter, MAX_JITTER_ATTEMPTS};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

const RIDGE: f64 = 1e-6;

/// Degree-2 polynomial regression of per-perturbation QoI means on the
/// perturbation coordinates.
///
/// Features are a bias, each coordinate, and each squared coordinate. The
/// normal equations carry a small ridge so under-determined fits (fewer
/// perturbations than features) stay solvable. The reported std is the RMSE
/// of the training residuals.
pub fn polynomial_fit(
    perturbations: ArrayView2<f64>,
    qoi_values: &[Array1<f64>],
    test: ArrayView1<f64>,
) -> Result<(f64, f64), CbqError> {
    let n = perturbations.nrows();
    let d = perturbations.ncols();
    if n == 0 {
        return Err(CbqError::EmptyTrainingSet);
    }
    if qoi_values.len() != n || test.len() != d {
        return Err(CbqError::Shape(format!(
            "{n} perturbations of dimension {d} with {} QoI batches and a test point of dimension {}",
            qoi_values.len(),
            test.len()
        )));
    }
    if let Some(i) = qoi_values.iter().position(|g| g.is_empty()) {
        return Err(CbqError::Shape(format!("QoI batch {i} is empty")));
    }

    let targets: Vec<f64> = qoi_values.iter().map(|g| g.mean().unwrap_or(0.0)).collect();

    let p = 2 * d + 1;
    let mut gram = DMatrix::zeros(p, p);
    let mut rhs = DVector::zeros(p);
    for (alpha, target) in perturbations.axis_iter(Axis(0)).zip(&targets) {
        let phi = features(alpha);
        gram += &phi * phi.transpose();
        rhs += phi * *target;
    }
    for j in 0..p {
        gram[(j, j)] += RIDGE;
    }
    let chol = cholesky_with_jitter(gram, RIDGE).ok_or(CbqError::Factorisation {
        attempts: MAX_JITTER_ATTEMPTS,
    })?;
    let weights = chol.solve(&rhs);

    let sq_err: f64 = perturbations
        .axis_iter(Axis(0))
        .zip(&targets)
        .map(|(alpha, target)| {
            let residual = target - features(alpha).dot(&weights);
            residual * residual
        })
        .sum();

    let mean = features(test).dot(&weights);
    let std = (sq_err / n as f64).sqrt();
    Ok((mean, std))
}

fn features(alpha: ArrayView1<f64>) -> DVector<f64> {
    let d = alpha.len();
    let mut phi = DVector::zeros(2 * d + 1);
    phi[0] = 1.0;
    for (j, a) in alpha.iter().enumerate() {
        phi[1 + j] = *a;
        phi[1 + d + j] = a * a;
    }
    phi
}

/// Self-normalised importance re-weighting of each perturbation's pool
/// toward the test perturbation.
///
/// `log_density` evaluates the unnormalised log target at every row of a
/// sample batch, for the posterior conditioned on the given perturbation.
/// Weights are formed in log space and shifted by their maximum before
/// exponentiation. The reported mean averages the per-perturbation
/// re-weighted estimates; the std is their population spread.
pub fn importance_sampling<F>(
    log_density: F,
    perturbations: ArrayView2<f64>,
    pools: &[Array2<f64>],
    qoi_values: &[Array1<f64>],
    test: ArrayView1<f64>,
) -> Result<(f64, f64), CbqError>
where
    F: Fn(ArrayView1<f64>, ArrayView2<f64>) -> Result<Array1<f64>, CbqError>,
{
    let n = perturbations.nrows();
    if n == 0 {
        return Err(CbqError::EmptyTrainingSet);
    }
    if pools.len() != n || qoi_values.len() != n || test.len() != perturbations.ncols() {
        return Err(CbqError::Shape(format!(
            "{n} perturbations with {} pools, {} QoI batches and a test point of dimension {}",
            pools.len(),
            qoi_values.len(),
            test.len()
        )));
    }

    let mut estimates = Array1::zeros(n);
    for i in 0..n {
        let pool = &pools[i];
        let gy = &qoi_values[i];
        if pool.nrows() == 0 {
            return Err(CbqError::Shape(format!("pool {i} is empty")));
        }
        if pool.nrows() != gy.len() {
            return Err(CbqError::Shape(format!(
                "pool {i} has {} rows but {} QoI values",
                pool.nrows(),
                gy.len()
            )));
        }

        let log_target = log_density(test, pool.view())?;
        let log_proposal = log_density(perturbations.row(i), pool.view())?;
        let log_w = &log_target - &log_proposal;
        let shift = log_w.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        let w = log_w.mapv(|lw| (lw - shift).exp());
        estimates[i] = (&w * gy).sum() / w.sum();
    }

    let mean = estimates.mean().unwrap_or(0.0);
    let std = estimates.std(0.0);
    Ok((mean, std))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    fn quadratic(alpha: ArrayView1<f64>) -> f64 {
        2.0 + 0.5 * alpha[0] - alpha[1] + 0.25 * alpha[0] * alpha[0] + alpha[1] * alpha[1]
    }

    #[test]
    fn quadratic_surface_is_recovered() {
        let mut rows = Vec::new();
        for a in [-1.0, 0.0, 1.0] {
            for b in [-1.0, 0.0, 1.0] {
                rows.push([a, b]);
            }
        }
        let perturbations = arr2(&rows);
        let qoi: Vec<Array1<f64>> = perturbations
            .axis_iter(Axis(0))
            .map(|alpha| arr1(&[quadratic(alpha)]))
            .collect();

        let test = arr1(&[0.4, -0.7]);
        let (mean, std) = polynomial_fit(perturbations.view(), &qoi, test.view()).unwrap();
        assert_abs_diff_eq!(mean, quadratic(test.view()), epsilon = 1e-3);
        assert!(std < 1e-3, "exact data should leave no residual, got {std}");
    }

    #[test]
    fn underdetermined_fit_stays_finite() {
        let perturbations = arr2(&[[0.0, 0.0], [0.5, -0.5], [-0.5, 0.5]]);
        let qoi = vec![arr1(&[1.0]), arr1(&[2.0]), arr1(&[3.0])];
        let (mean, std) =
            polynomial_fit(perturbations.view(), &qoi, arr1(&[0.1, 0.1]).view()).unwrap();
        assert!(mean.is_finite());
        assert!(std.is_finite() && std >= 0.0);
    }

    #[test]
    fn polynomial_rejects_malformed_inputs() {
        let err = polynomial_fit(
            Array2::zeros((0, 2)).view(),
            &[],
            arr1(&[0.0, 0.0]).view(),
        )
        .unwrap_err();
        assert!(matches!(err, CbqError::EmptyTrainingSet));

        let err = polynomial_fit(
            arr2(&[[0.0, 0.0]]).view(),
            &[arr1(&[1.0])],
            arr1(&[0.0]).view(),
        )
        .unwrap_err();
        assert!(matches!(err, CbqError::Shape(_)));
    }

    fn gaussian_batch_logpdf(
        alpha: ArrayView1<f64>,
        batch: ArrayView2<f64>,
    ) -> Result<Array1<f64>, CbqError> {
        Ok(batch
            .axis_iter(Axis(0))
            .map(|row| {
                -0.5 * row
                    .iter()
                    .zip(alpha.iter())
                    .map(|(y, m)| (y - m) * (y - m))
                    .sum::<f64>()
            })
            .collect())
    }

    #[test]
    fn matching_perturbations_reduce_to_plain_means() {
        let test = arr1(&[0.3, -0.1]);
        let perturbations = arr2(&[[0.3, -0.1], [0.3, -0.1]]);
        let pools = vec![
            arr2(&[[0.0, 0.0], [1.0, 1.0], [2.0, -1.0]]),
            arr2(&[[0.5, 0.5], [-0.5, -0.5]]),
        ];
        let qoi = vec![arr1(&[1.0, 2.0, 3.0]), arr1(&[4.0, 6.0])];

        let (mean, std) = importance_sampling(
            gaussian_batch_logpdf,
            perturbations.view(),
            &pools,
            &qoi,
            test.view(),
        )
        .unwrap();

        // Zero log-ratio everywhere, so each estimate is its pool's plain mean.
        assert_abs_diff_eq!(mean, (2.0 + 5.0) / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(std, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn shifted_target_pulls_the_estimate_toward_it() {
        let pool_rows: Vec<[f64; 1]> = (0..61).map(|i| [-3.0 + 0.1 * i as f64]).collect();
        let pool = arr2(&pool_rows);
        let qoi: Array1<f64> = pool.column(0).to_owned();

        let (mean, std) = importance_sampling(
            gaussian_batch_logpdf,
            arr2(&[[0.0]]).view(),
            &[pool],
            &[qoi],
            arr1(&[2.0]).view(),
        )
        .unwrap();

        // The symmetric pool averages to zero unweighted; weights centred on
        // the shifted target drag the estimate toward it.
        assert!(mean > 1.0, "re-weighted mean {mean} should move toward 2.0");
        assert_abs_diff_eq!(std, 0.0, epsilon = 1e-12);
    }
}
