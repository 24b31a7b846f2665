//! Hierarchical estimator backed by a precompiled CmdStan executable.
//!
//! The executable is resolved once per run and shared by every worker. The
//! model must accept the data block written by [`stan_payload`] and expose a
//! quantity `delta[drug, stratum]` (effect versus control);
//! `models/hierarchical.stan` is such a model.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::{
    errors::FitError,
    models::{EstimateCell, Estimates, Estimator, TrialData},
};

/// Sampler settings passed on the command line.
#[derive(Debug, Clone)]
pub struct CmdStanConfig {
    /// Warmup iterations.
    pub num_warmup: usize,
    /// Retained draws.
    pub num_samples: usize,
    /// Directory for per-fit scratch files.
    pub scratch_dir: PathBuf,
}

impl Default for CmdStanConfig {
    fn default() -> Self {
        Self {
            num_warmup: 1000,
            num_samples: 1000,
            scratch_dir: std::env::temp_dir().join("trialsim-cmdstan"),
        }
    }
}

/// Estimator that shells out to a compiled Stan model.
#[derive(Debug, Clone)]
pub struct CmdStanEstimator {
    exe: PathBuf,
    config: CmdStanConfig,
}

impl CmdStanEstimator {
    /// Locates the compiled model; compilation itself is never attempted here.
    pub fn load(exe: impl AsRef<Path>, config: CmdStanConfig) -> Result<Self, FitError> {
        let exe = exe.as_ref().to_path_buf();
        if !exe.is_file() {
            return Err(FitError::Toolchain(format!(
                "compiled model {} not found",
                exe.display()
            )));
        }
        fs::create_dir_all(&config.scratch_dir)?;
        Ok(Self { exe, config })
    }

    /// Model executable.
    #[must_use]
    pub fn exe(&self) -> &Path {
        &self.exe
    }
}

impl Estimator for CmdStanEstimator {
    fn label(&self) -> &str {
        "bayes"
    }

    fn fit(&self, data: &TrialData, seed: u64) -> Result<Estimates, FitError> {
        let workdir = self
            .config
            .scratch_dir
            .join(format!("fit-{seed}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&workdir)?;
        let result = self.sample(data, seed, &workdir);
        let _ = fs::remove_dir_all(&workdir);
        result
    }
}

impl CmdStanEstimator {
    fn sample(&self, data: &TrialData, seed: u64, workdir: &Path) -> Result<Estimates, FitError> {
        let data_file = workdir.join("data.json");
        let output_file = workdir.join("output.csv");
        fs::write(&data_file, serde_json::to_vec(&stan_payload(data))?)?;

        let output = Command::new(&self.exe)
            .arg("sample")
            .arg(format!("num_warmup={}", self.config.num_warmup))
            .arg(format!("num_samples={}", self.config.num_samples))
            .arg("data")
            .arg(format!("file={}", data_file.display()))
            .arg("output")
            .arg(format!("file={}", output_file.display()))
            .arg("random")
            .arg(format!("seed={}", seed % u64::from(u32::MAX)))
            .output()
            .map_err(|err| {
                FitError::Toolchain(format!("launching {}: {err}", self.exe.display()))
            })?;
        if !output.status.success() {
            return Err(FitError::Toolchain(format!(
                "{} exited with {}: {}",
                self.exe.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let draws = fs::read_to_string(&output_file)?;
        summarize_draws(&draws, data.n_drugs(), data.n_strata)
    }
}

/// Data block for the Stan model (arm and stratum indices are 1-based).
#[must_use]
pub fn stan_payload(data: &TrialData) -> Value {
    let y: Vec<f64> = data.observations.iter().map(|o| o.endpoint).collect();
    let arm: Vec<usize> = data.observations.iter().map(|o| o.arm + 1).collect();
    let stratum: Vec<usize> = data.observations.iter().map(|o| o.stratum + 1).collect();
    json!({
        "N": data.observations.len(),
        "K": data.n_drugs(),
        "S": data.n_strata,
        "y": y,
        "arm": arm,
        "stratum": stratum,
        "n0": data.prior.n0,
        "n_groups": data.prior.groups.len(),
        "group_sizes": data.prior.groups,
    })
}

/// Summarizes `delta.<drug>.<stratum>` columns of a CmdStan draws file.
#[allow(clippy::cast_precision_loss)]
pub fn summarize_draws(csv: &str, n_drugs: usize, n_strata: usize) -> Result<Estimates, FitError> {
    let mut lines = csv
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));
    let header = lines
        .next()
        .ok_or_else(|| FitError::Toolchain("draws file has no header".into()))?;
    let mut columns: IndexMap<&str, Vec<f64>> =
        header.split(',').map(|name| (name, Vec::new())).collect();

    for line in lines {
        let values: Vec<f64> = line
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|err| FitError::Toolchain(format!("malformed draw: {err}")))?;
        if values.len() != columns.len() {
            return Err(FitError::Toolchain(format!(
                "draw has {} values, header has {}",
                values.len(),
                columns.len()
            )));
        }
        for (draws, value) in columns.values_mut().zip(values) {
            draws.push(value);
        }
    }

    let mut cells = Vec::with_capacity(n_drugs * n_strata);
    for drug in 1..=n_drugs {
        for stratum in 1..=n_strata {
            let name = format!("delta.{drug}.{stratum}");
            let draws = columns
                .get(name.as_str())
                .ok_or_else(|| FitError::MissingParameter(name.clone()))?;
            if draws.is_empty() {
                return Err(FitError::Toolchain(format!("no draws for {name}")));
            }
            let n = draws.len() as f64;
            let mean = draws.iter().sum::<f64>() / n;
            let var = if draws.len() > 1 {
                draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0)
            } else {
                0.0
            };
            let below = draws.iter().filter(|d| **d < 0.0).count() as f64;
            cells.push(EstimateCell {
                mean,
                superiority: below / n,
                sd: var.sqrt(),
            });
        }
    }
    Ok(Estimates::new(n_strata, cells))
}
