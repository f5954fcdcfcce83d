//! Stationary and score-corrected kernels over posterior sample batches.
//!
//! The base kernel is the squared exponential
//! `k(y, y') = exp(-||y - y'||^2 / (2 l^2))`. The corrected variant augments
//! it with first-order score terms,
//!
//! ```text
//! k_s(y, y') = k(y, y') * (1 + s^T s' + (y - y')^T (s - s') / l^2),
//! ```
//!
//! where `s = grad log p(y)` and `s' = grad log p(y')`. This is the base
//! kernel times a score factor obtained by expanding the RBF gradients in
//! `k * (1 + s^T s') + (grad_y k)^T s' + (grad_{y'} k)^T s`, so quadrature
//! with it can exploit unnormalised density information. With all scores zero
//! the factor is one and the corrected kernel equals the base kernel.

use ndarray::{Array2, ArrayView2};

/// Matrix of squared Euclidean distances between the rows of `a` and `b`.
pub fn pairwise_sq_distances(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    assert_eq!(
        a.ncols(),
        b.ncols(),
        "row dimension mismatch between sample batches"
    );
    let mut out = Array2::zeros((a.nrows(), b.nrows()));
    for (i, ai) in a.rows().into_iter().enumerate() {
        for (j, bj) in b.rows().into_iter().enumerate() {
            let mut d2 = 0.0;
            for (x, y) in ai.iter().zip(bj.iter()) {
                let diff = x - y;
                d2 += diff * diff;
            }
            out[[i, j]] = d2;
        }
    }
    out
}

/// Squared-exponential Gram matrix between the rows of `a` and `b`.
pub fn rbf_kernel(a: ArrayView2<f64>, b: ArrayView2<f64>, lengthscale: f64) -> Array2<f64> {
    let denom = 2.0 * lengthscale * lengthscale;
    let mut k = pairwise_sq_distances(a, b);
    k.mapv_inplace(|d2| (-d2 / denom).exp());
    k
}

/// Score-corrected Gram matrix between the rows of `a` and `b`.
///
/// # Arguments
/// - `a`, `b`: sample batches, one sample per row.
/// - `scores_a`, `scores_b`: log-density gradients at the corresponding rows.
/// - `lengthscale`: base-kernel lengthscale, strictly positive.
pub fn stein_rbf_kernel(
    a: ArrayView2<f64>,
    scores_a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    scores_b: ArrayView2<f64>,
    lengthscale: f64,
) -> Array2<f64> {
    stein_rbf_kernel_parts(a, scores_a, b, scores_b, lengthscale).0
}

/// Score-corrected Gram matrix together with its lengthscale derivative.
///
/// The derivative of each entry with respect to `l` is
/// `k / l^3 * (d^2 * m - 2 (y - y')^T (s - s'))` with `m` the score factor
/// and `d^2` the squared distance; the marginal-likelihood optimiser consumes
/// it through the chain rule for `log l`.
pub fn stein_rbf_kernel_parts(
    a: ArrayView2<f64>,
    scores_a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    scores_b: ArrayView2<f64>,
    lengthscale: f64,
) -> (Array2<f64>, Array2<f64>) {
    assert_eq!(a.dim(), scores_a.dim(), "scores must match their samples");
    assert_eq!(b.dim(), scores_b.dim(), "scores must match their samples");
    assert_eq!(
        a.ncols(),
        b.ncols(),
        "row dimension mismatch between sample batches"
    );

    let l2 = lengthscale * lengthscale;
    let l3 = l2 * lengthscale;
    let mut gram = Array2::zeros((a.nrows(), b.nrows()));
    let mut dgram = Array2::zeros((a.nrows(), b.nrows()));

    for (i, (ai, si)) in a.rows().into_iter().zip(scores_a.rows()).enumerate() {
        for (j, (bj, sj)) in b.rows().into_iter().zip(scores_b.rows()).enumerate() {
            let mut d2 = 0.0;
            let mut score_dot = 0.0;
            let mut cross = 0.0;
            for (((x, y), sx), sy) in ai.iter().zip(bj.iter()).zip(si.iter()).zip(sj.iter()) {
                let diff = x - y;
                d2 += diff * diff;
                score_dot += sx * sy;
                cross += diff * (sx - sy);
            }
            let base = (-d2 / (2.0 * l2)).exp();
            let factor = 1.0 + score_dot + cross / l2;
            gram[[i, j]] = base * factor;
            dgram[[i, j]] = base / l3 * (d2 * factor - 2.0 * cross);
        }
    }
    (gram, dgram)
}

/// Median-distance lengthscale initialisation, scaled by `1/sqrt(D)`.
///
/// The median is taken over the full pairwise Euclidean distance matrix of
/// `y` against itself, zero diagonal included.
pub fn median_lengthscale(y: ArrayView2<f64>) -> f64 {
    let d2 = pairwise_sq_distances(y, y);
    let mut dists: Vec<f64> = d2.iter().map(|v| v.sqrt()).collect();
    dists.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = dists.len();
    let median = if n % 2 == 0 {
        0.5 * (dists[n / 2 - 1] + dists[n / 2])
    } else {
        dists[n / 2]
    };
    median / (y.ncols() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_batch(rng: &mut SmallRng, n: usize, d: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, d), |_| rng.random_range(-2.0..2.0))
    }

    #[test]
    fn gram_matrix_is_symmetric() {
        let mut rng = SmallRng::seed_from_u64(7);
        let y = random_batch(&mut rng, 8, 3);
        let s = random_batch(&mut rng, 8, 3);
        let k = stein_rbf_kernel(y.view(), s.view(), y.view(), s.view(), 0.9);
        for i in 0..8 {
            for j in 0..8 {
                assert_abs_diff_eq!(k[[i, j]], k[[j, i]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn zero_scores_reduce_to_base_kernel() {
        let mut rng = SmallRng::seed_from_u64(11);
        let y = random_batch(&mut rng, 6, 4);
        let zeros = Array2::zeros((6, 4));
        let corrected = stein_rbf_kernel(y.view(), zeros.view(), y.view(), zeros.view(), 1.3);
        let base = rbf_kernel(y.view(), y.view(), 1.3);
        for (c, b) in corrected.iter().zip(base.iter()) {
            assert_eq!(c, b);
        }
    }

    #[test]
    fn median_lengthscale_matches_hand_computation() {
        // 1-d points {0, 1}: distances {0, 0, 1, 1}, median 0.5, dim scale 1.
        let y = ndarray::arr2(&[[0.0], [1.0]]);
        assert_abs_diff_eq!(median_lengthscale(y.view()), 0.5, epsilon = 1e-15);
    }

    #[test]
    fn lengthscale_gradient_matches_finite_differences() {
        let mut rng = SmallRng::seed_from_u64(23);
        let y = random_batch(&mut rng, 5, 3);
        let s = random_batch(&mut rng, 5, 3);
        let l = 0.8;
        let h = 1e-6;

        let (_, grad) = stein_rbf_kernel_parts(y.view(), s.view(), y.view(), s.view(), l);
        let hi = stein_rbf_kernel(y.view(), s.view(), y.view(), s.view(), l + h);
        let lo = stein_rbf_kernel(y.view(), s.view(), y.view(), s.view(), l - h);
        for i in 0..5 {
            for j in 0..5 {
                let numeric = (hi[[i, j]] - lo[[i, j]]) / (2.0 * h);
                assert_abs_diff_eq!(grad[[i, j]], numeric, epsilon = 1e-5);
            }
        }
    }
}
