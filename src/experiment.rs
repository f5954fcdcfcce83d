//! Budget-sweep orchestration.
//!
//! One run draws a synthetic logistic-regression dataset, holds out a test
//! perturbation with a large ground-truth pool, then walks the
//! `(n_alpha, n_beta)` grid. Perturbations and their sample pools are drawn
//! once per `n_alpha` value and sub-sampled for every `n_beta`, so estimates
//! across sample budgets differ only in how much of the same pool they see.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::baselines;
use crate::bmc::{self, BmcConfig, BmcEstimate};
use crate::diagnostics::{split_diagnostics, summarize};
use crate::error::CbqError;
use crate::meta_gp::{MetaGp, MetaGpConfig};
use crate::posterior::{generate_dataset, LogisticData, LogisticPosterior};
use crate::sampler::{dedup_rows, shuffle_rows, NutsChain};

/// Dual-averaging acceptance statistic used for every chain.
const TARGET_ACCEPT: f64 = 0.75;

/// Full description of one sweep.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExperimentConfig {
    /// Parameter dimension of the logistic model (features plus intercept).
    pub dim: usize,
    /// Observations in the synthetic dataset.
    pub n_data: usize,
    /// Prior variance before perturbation; each coordinate is offset by its
    /// perturbation entry.
    pub base_variance: f64,
    /// Draws collected per perturbation pool.
    pub n_mcmc: usize,
    /// Adaptation steps discarded before collection.
    pub n_burnin: usize,
    /// Outer sweep: how many perturbations the meta level trains on.
    pub n_alpha_list: Vec<usize>,
    /// Inner sweep: how many pool draws each estimator sees.
    pub n_beta_list: Vec<usize>,
    pub seed: u64,
    pub bmc: BmcConfig,
    pub meta_gp: MetaGpConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            dim: 3,
            n_data: 100,
            base_variance: 5.0,
            n_mcmc: 5000,
            n_burnin: 1000,
            n_alpha_list: vec![3, 5, 10, 20, 30],
            n_beta_list: vec![3, 5, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100],
            seed: 0,
            bmc: BmcConfig::default(),
            meta_gp: MetaGpConfig::default(),
        }
    }
}

/// Every estimator's answer for one `(n_alpha, n_beta)` grid cell.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CellResult {
    pub n_alpha: usize,
    pub n_beta: usize,
    /// Plain Monte Carlo over the first `n_beta` ground-truth draws.
    pub mc_mean: f64,
    pub cbq_mean: f64,
    pub cbq_std: f64,
    pub poly_mean: f64,
    pub poly_std: f64,
    pub is_mean: f64,
    pub is_std: f64,
}

/// Output of [`run`], ready for serialisation.
#[derive(Debug, serde::Serialize)]
pub struct ExperimentResult {
    pub test_perturbation: Vec<f64>,
    /// Mean QoI over the full held-out pool.
    pub ground_truth: f64,
    pub cells: Vec<CellResult>,
}

/// The quantity of interest: the sum of a sample's coordinates, per row.
pub fn qoi_batch(sample: ArrayView2<f64>) -> Array1<f64> {
    sample.sum_axis(Axis(1))
}

/// Runs the full sweep described by `config`.
///
/// # Errors
/// Propagates precondition violations from the estimators: a pool that
/// deduplicates below two distinct draws, a sample budget exceeding its
/// pool, or a perturbed prior variance leaving the positive cone.
pub fn run(config: &ExperimentConfig) -> Result<ExperimentResult, CbqError> {
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let data = Arc::new(generate_dataset(config.n_data, config.dim, &mut rng));
    info!(
        "dataset: {} observations, {} parameters, base prior variance {}",
        config.n_data, config.dim, config.base_variance
    );

    let test_alpha = draw_perturbations(1, config.dim, &mut rng).row(0).to_owned();
    let test_pool = sample_pool(
        &data,
        &variances(config, test_alpha.view()),
        2 * config.n_mcmc,
        config.n_burnin,
        derived_seed(config.seed, [0, 0, 0, 0]),
        "test pool",
    )?;
    let max_n_beta = config.n_beta_list.iter().copied().max().unwrap_or(0);
    if test_pool.nrows() < max_n_beta.max(2) {
        return Err(CbqError::DegenerateTestPool {
            distinct: test_pool.nrows(),
            required: max_n_beta.max(2),
        });
    }
    let test_qoi = qoi_batch(test_pool.view());
    let ground_truth = test_qoi.mean().unwrap_or(0.0);
    info!(
        "ground truth {ground_truth:.6} from {} held-out draws",
        test_pool.nrows()
    );
    debug!("test pool {}", summarize("QoI", test_qoi.view()));

    let mc_means: Vec<f64> = config
        .n_beta_list
        .iter()
        .map(|&n_beta| test_qoi.slice(s![..n_beta]).mean().unwrap_or(0.0))
        .collect();

    let bar = ProgressBar::new((config.n_alpha_list.len() * config.n_beta_list.len()) as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.cyan/blue} {pos}/{len} ({eta}) | {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    bar.set_prefix("sweep");

    let mut cells = Vec::with_capacity(config.n_alpha_list.len() * config.n_beta_list.len());
    for &n_alpha in &config.n_alpha_list {
        let perturbations = draw_perturbations(n_alpha, config.dim, &mut rng);
        let pools: Vec<Array2<f64>> = (0..n_alpha)
            .into_par_iter()
            .map(|i| {
                let pool = sample_pool(
                    &data,
                    &variances(config, perturbations.row(i)),
                    config.n_mcmc,
                    config.n_burnin,
                    derived_seed(config.seed, [1, n_alpha as u64, i as u64, 0]),
                    &format!("pool {i}"),
                )?;
                if pool.nrows() < 2 {
                    return Err(CbqError::DegeneratePool {
                        perturbation: i,
                        distinct: pool.nrows(),
                        required: 2,
                    });
                }
                Ok(pool)
            })
            .collect::<Result<_, CbqError>>()?;
        let pool_qoi: Vec<Array1<f64>> = pools.iter().map(|p| qoi_batch(p.view())).collect();
        info!(
            "n_alpha={n_alpha}: conditioned pool sizes {:?}",
            pools.iter().map(Array2::nrows).collect::<Vec<_>>()
        );
        for (i, g) in pool_qoi.iter().enumerate() {
            debug!("pool {i} {}", summarize("QoI", g.view()));
        }

        for (&n_beta, &mc_mean) in config.n_beta_list.iter().zip(&mc_means) {
            bar.set_message(format!("n_alpha={n_alpha} n_beta={n_beta}"));
            cells.push(run_cell(
                config,
                &data,
                perturbations.view(),
                &pools,
                &pool_qoi,
                test_alpha.view(),
                n_beta,
                mc_mean,
            )?);
            bar.inc(1);
        }
    }
    bar.finish_with_message("done");

    Ok(ExperimentResult {
        test_perturbation: test_alpha.to_vec(),
        ground_truth,
        cells,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_cell(
    config: &ExperimentConfig,
    data: &Arc<LogisticData>,
    perturbations: ArrayView2<f64>,
    pools: &[Array2<f64>],
    pool_qoi: &[Array1<f64>],
    test_alpha: ArrayView1<f64>,
    n_beta: usize,
    mc_mean: f64,
) -> Result<CellResult, CbqError> {
    let n_alpha = perturbations.nrows();

    let fitted: Vec<(Array2<f64>, Array1<f64>, BmcEstimate)> = (0..n_alpha)
        .into_par_iter()
        .map(|i| {
            let seed = derived_seed(config.seed, [2, n_alpha as u64, i as u64, n_beta as u64]);
            let (batch, gy) = subsample(&pools[i], &pool_qoi[i], n_beta, i, seed)?;
            let posterior =
                LogisticPosterior::new(Arc::clone(data), variances(config, perturbations.row(i)))?;
            let scores = posterior.score_batch(batch.view());
            let est = bmc::estimate(batch.view(), scores.view(), gy.view(), &config.bmc)?;
            debug!(
                "perturbation {i} at n_beta={n_beta}: mean {:.4}, std {:.4}, nll {:.4}",
                est.mean, est.std, est.nll
            );
            Ok((batch, gy, est))
        })
        .collect::<Result<_, CbqError>>()?;

    let mut batches = Vec::with_capacity(n_alpha);
    let mut qoi = Vec::with_capacity(n_alpha);
    let mut means = Vec::with_capacity(n_alpha);
    let mut stds = Vec::with_capacity(n_alpha);
    for (batch, gy, est) in fitted {
        batches.push(batch);
        qoi.push(gy);
        means.push(est.mean);
        stds.push(est.std);
    }
    let means = Array1::from(means);
    let stds = Array1::from(stds);

    let gp = MetaGp::fit(perturbations, means.view(), stds.view(), &config.meta_gp)?;
    let (cbq_mean, cbq_std) = gp.predict(test_alpha);

    let (poly_mean, poly_std) = baselines::polynomial_fit(perturbations, &qoi, test_alpha)?;

    let log_density = |alpha: ArrayView1<f64>, batch: ArrayView2<f64>| {
        let posterior = LogisticPosterior::new(Arc::clone(data), variances(config, alpha))?;
        Ok(posterior.log_density_batch(batch))
    };
    let (is_mean, is_std) =
        baselines::importance_sampling(log_density, perturbations, &batches, &qoi, test_alpha)?;

    Ok(CellResult {
        n_alpha,
        n_beta,
        mc_mean,
        cbq_mean,
        cbq_std,
        poly_mean,
        poly_std,
        is_mean,
        is_std,
    })
}

fn variances(config: &ExperimentConfig, alpha: ArrayView1<f64>) -> Array1<f64> {
    alpha.mapv(|a| config.base_variance + a)
}

fn draw_perturbations<R: Rng>(count: usize, dim: usize, rng: &mut R) -> Array2<f64> {
    Array2::from_shape_fn((count, dim), |_| rng.random_range(-1.0..1.0))
}

/// Conditions one perturbation's pool: run the chain, drop duplicate rows,
/// shuffle away the chain ordering.
fn sample_pool(
    data: &Arc<LogisticData>,
    prior_variances: &Array1<f64>,
    n_collect: usize,
    n_discard: usize,
    seed: u64,
    label: &str,
) -> Result<Array2<f64>, CbqError> {
    let posterior = LogisticPosterior::new(Arc::clone(data), prior_variances.clone())?;
    let init = Array1::from_elem(posterior.dim(), 0.1);

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut chain = NutsChain::new(posterior, init, TARGET_ACCEPT).set_seed(rng.random());
    let raw = chain.run(n_collect, n_discard);
    debug!("{label}: {}", split_diagnostics(raw.view()));

    Ok(shuffle_rows(dedup_rows(raw.view()).view(), &mut rng))
}

/// Draws `n_beta` pool rows without replacement, with their QoI values.
fn subsample(
    pool: &Array2<f64>,
    qoi: &Array1<f64>,
    n_beta: usize,
    perturbation: usize,
    seed: u64,
) -> Result<(Array2<f64>, Array1<f64>), CbqError> {
    let available = pool.nrows();
    if n_beta > available {
        return Err(CbqError::InsufficientPool {
            perturbation,
            requested: n_beta,
            available,
        });
    }

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..available).collect();
    // Partial Fisher-Yates: only the first n_beta slots are consumed.
    for k in 0..n_beta {
        let j = rng.random_range(k..available);
        indices.swap(k, j);
    }

    let batch = Array2::from_shape_fn((n_beta, pool.ncols()), |(r, c)| pool[[indices[r], c]]);
    let gy = Array1::from_iter(indices[..n_beta].iter().map(|&r| qoi[r]));
    Ok((batch, gy))
}

/// Folds sweep coordinates into one stream seed. `seed_from_u64` mixes the
/// result further, so distinct coordinate tuples are all that is needed.
fn derived_seed(root: u64, coords: [u64; 4]) -> u64 {
    let mut seed = root;
    for part in coords {
        seed ^= part
            .wrapping_add(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(seed << 6)
            .wrapping_add(seed >> 2);
    }
    seed
}
