//! Error type shared across the pipeline.

use thiserror::Error;

/// Errors surfaced by the estimator pipeline.
///
/// Numerical degeneracy inside the estimators is recovered locally and never
/// reaches this enum; what remains are precondition violations on the inputs
/// and shape mismatches between collaborating components.
#[derive(Debug, Error)]
pub enum CbqError {
    /// A quadrature input had fewer distinct samples than the estimator needs.
    #[error("sample batch has {distinct} distinct draws, at least {required} required")]
    TooFewSamples { distinct: usize, required: usize },

    /// A perturbation's conditioned pool collapsed below the estimator minimum.
    #[error("perturbation {perturbation}: pool has {distinct} distinct draws, at least {required} required")]
    DegeneratePool {
        perturbation: usize,
        distinct: usize,
        required: usize,
    },

    /// The held-out test pool collapsed below the estimator minimum.
    #[error("test pool has {distinct} distinct draws, at least {required} required")]
    DegenerateTestPool { distinct: usize, required: usize },

    /// A sub-sample request exceeded the conditioned pool it draws from.
    #[error("perturbation {perturbation}: requested {requested} draws from a pool of {available}")]
    InsufficientPool {
        perturbation: usize,
        requested: usize,
        available: usize,
    },

    /// A perturbed prior variance left the positive cone.
    #[error("prior variance {value} at coordinate {index} is not positive")]
    InvalidPriorVariance { index: usize, value: f64 },

    /// An estimator received no perturbations to train on.
    #[error("estimator training set is empty")]
    EmptyTrainingSet,

    /// Mismatched dimensions between collaborating inputs.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A Gram matrix built from malformed inputs could not be factorised.
    #[error("Cholesky factorisation failed after {attempts} jitter escalations")]
    Factorisation { attempts: usize },
}
