//! # CBQ Sensitivity
//!
//! A compact Rust library for **Conditional Bayesian Quadrature (CBQ)**:
//! estimating how a scalar summary of a Bayesian posterior reacts when the
//! prior covariance is perturbed, without rerunning full inference at every
//! perturbation. It pits CBQ against **plain Monte Carlo**, **polynomial
//! regression**, and **importance sampling** across a grid of sampling
//! budgets.
//!
//! ## Getting Started
//!
//! To use this library, add it to your project:
//! ```bash
//! cargo add cbq
//! ```
//!
//! The pipeline has three levels, each usable on its own:
//! 1. **Per-perturbation quadrature** (`bmc`): turns one perturbation's
//!    posterior draws, their scores, and QoI values into a calibrated
//!    `(mean, std)` estimate via a Stein-corrected kernel whose
//!    hyperparameters are fitted by gradient descent. You need to provide:
//!    - posterior draws with matching score vectors (any differentiable
//!      unnormalised log-density works)
//! 2. **Meta-level regression** (`meta_gp`): a heteroscedastic-noise GP over
//!    `(perturbation, mean, std)` triples that predicts the QoI at an unseen
//!    perturbation. You need to provide:
//!    - the per-perturbation estimates from level 1
//! 3. **Sweep orchestration** (`experiment`): draws a synthetic logistic
//!    dataset, conditions a sample pool per perturbation with the built-in
//!    No-U-Turn sampler, and walks the `(n_alpha, n_beta)` budget grid.
//!
//! ## Example 1: A small budget sweep
//!
//! ```rust
//! use cbq::bmc::BmcConfig;
//! use cbq::experiment::{run, ExperimentConfig};
//!
//! let config = ExperimentConfig {
//!     dim: 2,
//!     n_data: 30,
//!     n_mcmc: 80,
//!     n_burnin: 40,
//!     n_alpha_list: vec![3],
//!     n_beta_list: vec![5, 10],
//!     seed: 7,
//!     bmc: BmcConfig {
//!         opt_steps: 200,
//!         ..BmcConfig::default()
//!     },
//!     ..ExperimentConfig::default()
//! };
//!
//! let result = run(&config).unwrap();
//! assert_eq!(result.cells.len(), 2);
//! for cell in &result.cells {
//!     println!(
//!         "n_beta={:3}  cbq {:.3} +/- {:.3}  (truth {:.3})",
//!         cell.n_beta, cell.cbq_mean, cell.cbq_std, result.ground_truth,
//!     );
//! }
//! ```
//!
//! ## Example 2: Quadrature for a single perturbation
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use cbq::bmc::{estimate, BmcConfig};
//! use cbq::experiment::qoi_batch;
//! use cbq::posterior::{generate_dataset, LogisticPosterior};
//! use cbq::sampler::{dedup_rows, shuffle_rows, NutsChain};
//! use ndarray::Array1;
//! use rand::rngs::SmallRng;
//! use rand::SeedableRng;
//!
//! let mut rng = SmallRng::seed_from_u64(1);
//! let data = Arc::new(generate_dataset(25, 2, &mut rng));
//! let variances = Array1::from_elem(2, 5.0);
//!
//! // Condition the pool: sample, deduplicate, shuffle.
//! let target = LogisticPosterior::new(Arc::clone(&data), variances.clone()).unwrap();
//! let mut chain = NutsChain::new(target, Array1::from_elem(2, 0.1), 0.75).set_seed(9);
//! let pool = shuffle_rows(dedup_rows(chain.run(120, 40).view()).view(), &mut rng);
//!
//! // Quadrature over the pool.
//! let scorer = LogisticPosterior::new(Arc::clone(&data), variances).unwrap();
//! let scores = scorer.score_batch(pool.view());
//! let qoi = qoi_batch(pool.view());
//! let config = BmcConfig {
//!     opt_steps: 300,
//!     ..BmcConfig::default()
//! };
//!
//! let est = estimate(pool.view(), scores.view(), qoi.view(), &config).unwrap();
//! assert!(est.std >= 0.0);
//! println!("E[g] = {:.3} +/- {:.3}", est.mean, est.std);
//! ```
//!
//! ## Features
//! - **Stein-corrected kernels** so quadrature can exploit unnormalised
//!   posterior information, not just samples
//! - **Dual-averaging NUTS** (Hoffman & Gelman, Algorithm 6) as the built-in
//!   sampler
//! - **Hierarchical uncertainty**: per-perturbation epistemic stds feed the
//!   meta-GP's noise model instead of being discarded
//! - **Parallel pool conditioning** and per-cell fits via rayon
//! - **Effective Sample Size (ESS)** estimation following STAN's methodology
//! - **R-hat Diagnostics** for convergence monitoring
//!
//! ## Roadmap
//! - Multiple chains per perturbation pool, pooled by the existing
//!   split diagnostics
//! - Cross-coordinate features for the polynomial baseline

pub mod baselines;
pub mod bmc;
pub mod diagnostics;
pub mod error;
pub mod experiment;
pub mod kernels;
mod linalg;
pub mod meta_gp;
pub mod posterior;
pub mod sampler;
