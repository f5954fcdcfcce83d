//! End-to-end checks of the sensitivity pipeline: per-perturbation
//! quadrature stays in the range the bounded QoI allows, the meta level
//! reports usable uncertainty, and the sweep is reproducible from its seed.

#[cfg(test)]
mod tests {
    use cbq::bmc::{estimate, BmcConfig};
    use cbq::error::CbqError;
    use cbq::experiment::{qoi_batch, run, ExperimentConfig};
    use cbq::meta_gp::{MetaGp, MetaGpConfig};
    use cbq::posterior::{generate_dataset, LogisticData, LogisticPosterior};
    use cbq::sampler::{dedup_rows, shuffle_rows, NutsChain};
    use ndarray::{s, Array1, Array2};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    const SEED: u64 = 42;
    const DIM: usize = 3;
    const N_DATA: usize = 100;
    const BASE_VARIANCE: f64 = 5.0;

    /// Conditions one pool the way the orchestrator does: run the chain,
    /// deduplicate, shuffle.
    fn condition_pool(
        data: &Arc<LogisticData>,
        variances: Array1<f64>,
        n_collect: usize,
        seed: u64,
    ) -> Array2<f64> {
        let target = LogisticPosterior::new(Arc::clone(data), variances).unwrap();
        let mut chain =
            NutsChain::new(target, Array1::from_elem(DIM, 0.1), 0.75).set_seed(seed);
        let raw = chain.run(n_collect, 150);
        let mut rng = SmallRng::seed_from_u64(seed ^ 0xA5A5);
        shuffle_rows(dedup_rows(raw.view()).view(), &mut rng)
    }

    /// Five perturbations, ten draws each: every quadrature mean must stay
    /// inside the interval a bounded coordinate sum allows, and the meta
    /// level must report a finite non-negative uncertainty at a held-out
    /// perturbation.
    #[test]
    fn test_small_sweep_bounds_and_uncertainty() {
        let n_alpha = 5;
        let n_beta = 10;
        let mut rng = SmallRng::seed_from_u64(SEED);
        let data = Arc::new(generate_dataset(N_DATA, DIM, &mut rng));

        let perturbations =
            Array2::from_shape_fn((n_alpha, DIM), |_| rng.random_range(-1.0..1.0));
        let test_alpha = Array1::from_shape_fn(DIM, |_| rng.random_range(-1.0..1.0));

        let bmc_config = BmcConfig {
            opt_steps: 800,
            ..BmcConfig::default()
        };
        let mut means = Array1::zeros(n_alpha);
        let mut stds = Array1::zeros(n_alpha);
        for i in 0..n_alpha {
            let variances = perturbations.row(i).mapv(|a| BASE_VARIANCE + a);
            let pool = condition_pool(&data, variances.clone(), 400, SEED + 1 + i as u64);
            assert!(
                pool.nrows() >= n_beta,
                "pool {i} deduplicated to {} rows",
                pool.nrows()
            );

            let batch = pool.slice(s![..n_beta, ..]);
            let scorer = LogisticPosterior::new(Arc::clone(&data), variances).unwrap();
            let scores = scorer.score_batch(batch);
            let qoi = qoi_batch(batch);

            let est = estimate(batch, scores.view(), qoi.view(), &bmc_config).unwrap();
            assert!(
                est.mean.is_finite() && (-5.0..=5.0).contains(&est.mean),
                "quadrature mean {} escaped the QoI range at perturbation {i}",
                est.mean
            );
            assert!(
                est.std.is_finite() && est.std >= 0.0,
                "bad quadrature std {} at perturbation {i}",
                est.std
            );
            means[i] = est.mean;
            stds[i] = est.std;
        }

        let gp = MetaGp::fit(
            perturbations.view(),
            means.view(),
            stds.view(),
            &MetaGpConfig::default(),
        )
        .unwrap();
        let (prediction, uncertainty) = gp.predict(test_alpha.view());
        assert!(prediction.is_finite());
        assert!(
            uncertainty.is_finite() && uncertainty >= 0.0,
            "meta-GP uncertainty {uncertainty} must be finite and non-negative"
        );
    }

    /// The sweep is a pure function of its configuration, and a repeated
    /// inner budget reproduces its cell exactly because pools are drawn once
    /// per `n_alpha` and sub-sampled by derived seeds.
    #[test]
    fn test_sweep_is_reproducible_and_reuses_pools() {
        let config = ExperimentConfig {
            dim: 2,
            n_data: 30,
            n_mcmc: 60,
            n_burnin: 30,
            n_alpha_list: vec![3],
            n_beta_list: vec![5, 5, 12],
            seed: SEED,
            bmc: BmcConfig {
                opt_steps: 150,
                ..BmcConfig::default()
            },
            ..ExperimentConfig::default()
        };

        let first = run(&config).unwrap();
        let second = run(&config).unwrap();

        assert_eq!(first.ground_truth, second.ground_truth);
        assert_eq!(first.cells, second.cells);
        assert_eq!(first.cells.len(), 3);
        assert_eq!(
            first.cells[0], first.cells[1],
            "a repeated n_beta must see the same subsample of the same pool"
        );
        assert_ne!(first.cells[0].n_beta, first.cells[2].n_beta);
    }

    /// The complete default-budget sweep, chain conditioning included.
    #[test]
    #[ignore = "Slow test: run only when explicitly requested"]
    fn test_full_size_sweep() {
        let config = ExperimentConfig {
            seed: SEED,
            ..ExperimentConfig::default()
        };

        let result = run(&config).unwrap();
        assert_eq!(
            result.cells.len(),
            config.n_alpha_list.len() * config.n_beta_list.len()
        );
        assert!(result.ground_truth.is_finite());
        for cell in &result.cells {
            assert!(cell.mc_mean.is_finite(), "bad MC mean in {cell:?}");
            assert!(
                cell.cbq_mean.is_finite() && cell.cbq_std >= 0.0,
                "bad CBQ record in {cell:?}"
            );
            assert!(
                cell.poly_mean.is_finite() && cell.poly_std >= 0.0,
                "bad polynomial record in {cell:?}"
            );
            assert!(
                cell.is_mean.is_finite() && cell.is_std >= 0.0,
                "bad importance-sampling record in {cell:?}"
            );
        }
    }

    /// A sample budget larger than the held-out pool is a configuration
    /// error, not something to silently truncate.
    #[test]
    fn test_oversized_budget_fails_loudly() {
        let config = ExperimentConfig {
            dim: 2,
            n_data: 30,
            n_mcmc: 60,
            n_burnin: 30,
            n_alpha_list: vec![3],
            n_beta_list: vec![150],
            seed: SEED,
            bmc: BmcConfig {
                opt_steps: 50,
                ..BmcConfig::default()
            },
            ..ExperimentConfig::default()
        };

        let err = run(&config).unwrap_err();
        assert!(
            matches!(err, CbqError::DegenerateTestPool { .. }),
            "unexpected error: {err}"
        );
    }

    /// The result record carries every field the comparison schema needs.
    #[test]
    fn test_result_serialises_with_schema_fields() {
        let config = ExperimentConfig {
            dim: 2,
            n_data: 25,
            n_mcmc: 50,
            n_burnin: 25,
            n_alpha_list: vec![3],
            n_beta_list: vec![6],
            seed: SEED,
            bmc: BmcConfig {
                opt_steps: 100,
                ..BmcConfig::default()
            },
            ..ExperimentConfig::default()
        };

        let result = run(&config).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&result).unwrap()).unwrap();

        assert!(value["ground_truth"].is_number());
        assert_eq!(value["test_perturbation"].as_array().unwrap().len(), 2);
        let cell = &value["cells"][0];
        for field in [
            "n_alpha", "n_beta", "mc_mean", "cbq_mean", "cbq_std", "poly_mean", "poly_std",
            "is_mean", "is_std",
        ] {
            assert!(cell[field].is_number(), "missing cell field {field}");
        }
    }
}
