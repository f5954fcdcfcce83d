//! Small bridge between `ndarray` data and `nalgebra` factorisations.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::Array2;

/// Escalating-jitter retries before a factorisation is abandoned.
pub(crate) const MAX_JITTER_ATTEMPTS: usize = 6;

/// Cholesky with an escalating jitter retry: each failed attempt adds ten
/// times more mass to the diagonal than the previous one.
pub(crate) fn cholesky_with_jitter(
    mut gram: DMatrix<f64>,
    initial_jitter: f64,
) -> Option<Cholesky<f64, Dyn>> {
    let n = gram.nrows();
    let mut jitter = initial_jitter;
    for _ in 0..MAX_JITTER_ATTEMPTS {
        if let Some(chol) = Cholesky::new(gram.clone()) {
            return Some(chol);
        }
        for i in 0..n {
            gram[(i, i)] += jitter;
        }
        jitter *= 10.0;
    }
    None
}

/// `log det` of the factored matrix, from the triangular diagonal.
pub(crate) fn log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

pub(crate) fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_row_iterator(a.nrows(), a.ncols(), a.iter().cloned())
}

pub(crate) fn frobenius(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub(crate) fn quad_form(m: &DMatrix<f64>, v: &DVector<f64>) -> f64 {
    (m * v).dot(v)
}
