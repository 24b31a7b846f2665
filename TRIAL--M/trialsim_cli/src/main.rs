use std::{future::Future, path::PathBuf, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use tokio::runtime::Runtime;
use trialsim::{
    helper::random_seed, CmdStanConfig, CmdStanEstimator, LinearEstimator, TrialDesign,
    TrialEngine, TrialTelemetry,
};

#[derive(Parser, Debug)]
#[command(
    name = "trialsim",
    version,
    about = "Monte Carlo simulation of stratified platform trials"
)]
struct Cli {
    /// Number of simulated trials.
    #[arg(short = 's', long)]
    sims: usize,
    /// Patients enrolled per trial.
    #[arg(short = 'n', long = "N")]
    patients: usize,
    /// Run seed; drawn at random when omitted.
    #[arg(long)]
    seed: Option<u64>,
    /// Worker pool size.
    #[arg(long)]
    workers: Option<usize>,
    /// Trial design TOML; the built-in antihistamine design when omitted.
    #[arg(long)]
    design: Option<PathBuf>,
    /// Directory the result CSV is written to.
    #[arg(long, default_value = "results/fixed")]
    results_dir: PathBuf,
    /// Precompiled CmdStan model used as the `bayes` estimator.
    #[arg(long)]
    stan_model: Option<PathBuf>,
    /// JSON-lines run log.
    #[arg(long, default_value = "logs/trialsim.log")]
    log_path: PathBuf,
    /// Optional JSON-lines file receiving run lifecycle events.
    #[arg(long)]
    event_log: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let started = Instant::now();

    let mut telemetry = TrialTelemetry::builder("trialsim").log_path(&cli.log_path);
    if let Some(path) = &cli.event_log {
        telemetry = telemetry.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    let telemetry = telemetry
        .build()
        .with_context(|| format!("opening log {}", cli.log_path.display()))?;

    let design = match &cli.design {
        Some(path) => TrialDesign::load(path)?,
        None => TrialDesign::default(),
    };
    let seed = cli.seed.unwrap_or_else(random_seed);

    let mut builder = TrialEngine::builder()
        .design(design)
        .telemetry(telemetry.clone())
        .run_seed(seed);
    if let Some(workers) = cli.workers {
        builder = builder.workers(workers);
    }
    if let Some(exe) = &cli.stan_model {
        let stan = CmdStanEstimator::load(exe, CmdStanConfig::default())
            .with_context(|| format!("loading model {}", exe.display()))?;
        builder = builder
            .estimator(Arc::new(stan))
            .estimator(Arc::new(LinearEstimator::new()));
    }
    let engine = builder.build().context("invalid trial design")?;

    let _ = telemetry.log(
        LogLevel::Info,
        "trial.cli.start",
        json!({
            "sims": cli.sims,
            "n": cli.patients,
            "seed": engine.run_seed(),
            "workers": engine.workers(),
        }),
    );

    let path = block_on_detached(engine.run_to_dir(cli.sims, cli.patients, &cli.results_dir))?
        .with_context(|| format!("simulation run with seed {seed} failed"))?;

    let minutes = started.elapsed().as_secs_f64() / 60.0;
    println!("N={} complete in {minutes:.2} minutes", cli.patients);
    println!("{}", path.display());
    Ok(())
}

/// Drives `future` to completion, then drops the runtime without waiting on
/// blocking replicates a failed batch left running.
fn block_on_detached<F: Future>(future: F) -> Result<F::Output> {
    let runtime = Runtime::new()?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn returns_without_waiting_for_stray_blocking_work() {
        let started = Instant::now();
        let value = block_on_detached(async {
            drop(tokio::task::spawn_blocking(|| {
                std::thread::sleep(Duration::from_secs(3));
            }));
            7
        })
        .unwrap();
        assert_eq!(value, 7);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn parses_short_flags() {
        let cli = Cli::try_parse_from(["trialsim", "-s", "10", "-n", "1000"]).unwrap();
        assert_eq!(cli.sims, 10);
        assert_eq!(cli.patients, 1000);
        assert_eq!(cli.results_dir, PathBuf::from("results/fixed"));
        assert!(cli.seed.is_none());
    }

    #[test]
    fn parses_long_flags() {
        let cli = Cli::try_parse_from([
            "trialsim", "--sims", "2", "--N", "500", "--seed", "7", "--workers", "3",
        ])
        .unwrap();
        assert_eq!((cli.sims, cli.patients), (2, 500));
        assert_eq!(cli.seed, Some(7));
        assert_eq!(cli.workers, Some(3));
    }

    #[test]
    fn requires_sims_and_patients() {
        assert!(Cli::try_parse_from(["trialsim", "-s", "10"]).is_err());
        assert!(Cli::try_parse_from(["trialsim", "-n", "10"]).is_err());
        assert!(Cli::try_parse_from(["trialsim", "-s", "x", "-n", "10"]).is_err());
    }
}
