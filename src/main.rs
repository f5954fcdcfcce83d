use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::info;

use cbq::bmc::BmcConfig;
use cbq::experiment::{run, ExperimentConfig, ExperimentResult};
use cbq::meta_gp::MetaGpConfig;

/// Prior-sensitivity sweep: conditional Bayesian quadrature against plain
/// Monte Carlo, polynomial regression and importance sampling.
#[derive(Debug, Parser)]
#[command(name = "cbq", version, about)]
struct Cli {
    /// Parameter dimension of the logistic model.
    #[arg(long, default_value_t = 3)]
    dim: usize,

    /// Observations in the synthetic dataset.
    #[arg(long, default_value_t = 100)]
    n_data: usize,

    /// Prior variance before perturbation.
    #[arg(long, default_value_t = 5.0)]
    base_variance: f64,

    /// Draws collected per perturbation pool.
    #[arg(long, default_value_t = 5000)]
    n_mcmc: usize,

    /// Adaptation steps discarded before collection.
    #[arg(long, default_value_t = 1000)]
    burnin: usize,

    /// Perturbation counts for the outer sweep.
    #[arg(long, value_delimiter = ',', default_values_t = [3, 5, 10, 20, 30])]
    n_alpha: Vec<usize>,

    /// Sample budgets for the inner sweep.
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [3, 5, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]
    )]
    n_beta: Vec<usize>,

    /// Root seed; every chain and subsample derives its stream from it.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Optimiser iterations per quadrature fit.
    #[arg(long, default_value_t = 10_000)]
    opt_steps: usize,

    /// Optimiser learning rate.
    #[arg(long, default_value_t = 1e-2)]
    learning_rate: f64,

    /// Where the JSON result artifact is written.
    #[arg(long, default_value = "results.json")]
    output: PathBuf,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, serde::Serialize)]
struct Artifact<'a> {
    config: &'a ExperimentConfig,
    elapsed_secs: f64,
    #[serde(flatten)]
    result: ExperimentResult,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&*cli.log_level))
        .init();

    let config = ExperimentConfig {
        dim: cli.dim,
        n_data: cli.n_data,
        base_variance: cli.base_variance,
        n_mcmc: cli.n_mcmc,
        n_burnin: cli.burnin,
        n_alpha_list: cli.n_alpha,
        n_beta_list: cli.n_beta,
        seed: cli.seed,
        bmc: BmcConfig {
            opt_steps: cli.opt_steps,
            learning_rate: cli.learning_rate,
            ..BmcConfig::default()
        },
        meta_gp: MetaGpConfig::default(),
    };

    let started = Instant::now();
    let result = run(&config)?;
    let elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        "sweep finished in {elapsed_secs:.1} s, {} cells",
        result.cells.len()
    );

    let artifact = Artifact {
        config: &config,
        elapsed_secs,
        result,
    };
    let json = serde_json::to_string_pretty(&artifact)?;
    fs::write(&cli.output, json).with_context(|| format!("writing {}", cli.output.display()))?;
    info!("results written to {}", cli.output.display());
    Ok(())
}
