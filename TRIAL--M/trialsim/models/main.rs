//! Estimators fitted to each replicate's completer data.
//!
//! Every estimator implements [`Estimator`] and returns one [`EstimateCell`]
//! per (drug, stratum), drug-major, so the driver can join estimates onto
//! the raw summaries without knowing how they were produced.

/// External CmdStan model runner.
pub mod cmdstan;
/// In-process normal-normal hierarchical estimator.
pub mod hierarchical;
/// Per-stratum least squares estimator.
pub mod linear;

pub use cmdstan::{CmdStanConfig, CmdStanEstimator};
pub use hierarchical::HierarchicalEstimator;
pub use linear::LinearEstimator;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{Domain, PriorSpec},
    errors::FitError,
    patients::Patient,
};

/// One completer's contribution to the analysis of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Stratum index.
    pub stratum: usize,
    /// Arm index within the analysed domain (0 = control).
    pub arm: usize,
    /// Observed endpoint.
    pub endpoint: f64,
}

/// Sample size, mean and sample variance of one group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    /// Number of observations.
    pub n: usize,
    /// Mean, absent when empty.
    pub mean: Option<f64>,
    /// Variance with denominator `n - 1`, absent below two observations.
    pub var: Option<f64>,
}

impl CellSummary {
    /// Summarizes a set of values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_values(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Self {
                n,
                mean: None,
                var: None,
            };
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = (n > 1).then(|| {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        });
        Self {
            n,
            mean: Some(mean),
            var,
        }
    }

    /// Residual sum of squares around the mean.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sum_of_squares(&self) -> f64 {
        self.var.map_or(0.0, |v| v * (self.n - 1) as f64)
    }
}

/// Analysis dataset for one domain, built from completers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialData {
    /// Domain name.
    pub domain: String,
    /// Arm count including control.
    pub n_arms: usize,
    /// Stratum count.
    pub n_strata: usize,
    /// Per-patient observations.
    pub observations: Vec<Observation>,
    /// Prior metadata from the domain.
    pub prior: PriorSpec,
}

impl TrialData {
    /// Extracts the observations for domain number `domain_index`.
    #[must_use]
    pub fn from_completers(completers: &[&Patient], domain_index: usize, domain: &Domain) -> Self {
        let observations = completers
            .iter()
            .filter_map(|patient| {
                patient
                    .assignment
                    .get(domain_index)
                    .map(|&arm| Observation {
                        stratum: patient.stratum,
                        arm,
                        endpoint: patient.endpoint,
                    })
            })
            .collect();
        Self {
            domain: domain.name().to_string(),
            n_arms: domain.arms().len(),
            n_strata: domain.strata(),
            observations,
            prior: domain.prior().clone(),
        }
    }

    /// Number of active arms.
    #[must_use]
    pub const fn n_drugs(&self) -> usize {
        self.n_arms.saturating_sub(1)
    }

    /// Summary of the `(arm, stratum)` cell.
    #[must_use]
    pub fn cell(&self, arm: usize, stratum: usize) -> CellSummary {
        let values: Vec<f64> = self
            .observations
            .iter()
            .filter(|o| o.arm == arm && o.stratum == stratum)
            .map(|o| o.endpoint)
            .collect();
        CellSummary::from_values(&values)
    }

    /// Summaries for every arm in `stratum`, control first.
    #[must_use]
    pub fn stratum_cells(&self, stratum: usize) -> Vec<CellSummary> {
        let mut values = vec![Vec::new(); self.n_arms];
        for obs in self.observations.iter().filter(|o| o.stratum == stratum) {
            if let Some(bucket) = values.get_mut(obs.arm) {
                bucket.push(obs.endpoint);
            }
        }
        values.iter().map(|v| CellSummary::from_values(v)).collect()
    }
}

/// Point estimate, superiority probability and sd for one (drug, stratum).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimateCell {
    /// Estimated effect versus control.
    pub mean: f64,
    /// Probability the effect versus control is below zero.
    pub superiority: f64,
    /// Standard deviation of the estimate.
    pub sd: f64,
}

/// Estimates for every (drug, stratum), drug-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimates {
    n_strata: usize,
    cells: Vec<EstimateCell>,
}

impl Estimates {
    /// Wraps drug-major cells.
    #[must_use]
    pub const fn new(n_strata: usize, cells: Vec<EstimateCell>) -> Self {
        Self { n_strata, cells }
    }

    /// Estimate for 1-based `drug` in `stratum`.
    #[must_use]
    pub fn get(&self, drug: usize, stratum: usize) -> Option<&EstimateCell> {
        if drug == 0 || stratum >= self.n_strata {
            return None;
        }
        self.cells.get((drug - 1) * self.n_strata + stratum)
    }

    /// All cells, drug-major.
    #[must_use]
    pub fn cells(&self) -> &[EstimateCell] {
        &self.cells
    }
}

/// Capability shared by every estimator.
pub trait Estimator: Send + Sync {
    /// Column prefix used in the result table (`bayes`, `lm`).
    fn label(&self) -> &str;

    /// Fits the model; `seed` makes stochastic fitters reproducible.
    fn fit(&self, data: &TrialData, seed: u64) -> Result<Estimates, FitError>;
}

/// Within-stratum contrast of one drug against control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Contrast {
    pub estimate: f64,
    pub variance: f64,
    /// Pooled residual variance of the stratum.
    pub residual_var: f64,
}

/// OLS contrasts per (drug, stratum), drug-major. Residual variance is pooled
/// over the arms present in the stratum.
pub(crate) fn stratum_contrasts(data: &TrialData) -> Result<Vec<Contrast>, FitError> {
    contrast_grid(data).into_iter().collect()
}

/// Same layout as [`stratum_contrasts`], keeping a per-cell error for every
/// (drug, stratum) that cannot be estimated on its own.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn contrast_grid(data: &TrialData) -> Vec<Result<Contrast, FitError>> {
    let mut by_stratum = Vec::with_capacity(data.n_strata);
    for stratum in 0..data.n_strata {
        let cells = data.stratum_cells(stratum);
        let present = cells.iter().filter(|c| c.n > 0).count();
        let total: usize = cells.iter().map(|c| c.n).sum();
        let sse: f64 = cells.iter().map(CellSummary::sum_of_squares).sum();
        let df = total.saturating_sub(present);
        by_stratum.push((cells, df, sse));
    }

    let mut contrasts = Vec::with_capacity(data.n_drugs() * data.n_strata);
    for drug in 1..data.n_arms {
        for (stratum, (cells, df, sse)) in by_stratum.iter().enumerate() {
            let insufficient = |reason: &str| FitError::InsufficientData {
                drug,
                stratum,
                reason: reason.to_string(),
            };
            let control = cells[0];
            let treated = cells[drug];
            let (Some(control_mean), Some(treated_mean)) = (control.mean, treated.mean) else {
                contrasts.push(Err(insufficient("empty treatment or control cell")));
                continue;
            };
            if *df == 0 {
                contrasts.push(Err(insufficient("no residual degrees of freedom")));
                continue;
            }
            let residual_var = sse / *df as f64;
            let variance = residual_var * (1.0 / treated.n as f64 + 1.0 / control.n as f64);
            if !(variance.is_finite() && variance > 0.0) {
                contrasts.push(Err(insufficient("degenerate residual variance")));
                continue;
            }
            contrasts.push(Ok(Contrast {
                estimate: treated_mean - control_mean,
                variance,
                residual_var,
            }));
        }
    }
    contrasts
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Two strata, control + two drugs, deterministic endpoints.
    pub(crate) fn small_data() -> TrialData {
        let mut observations = Vec::new();
        let layout: [(usize, usize, &[f64]); 6] = [
            (0, 0, &[1.0, 2.0, 3.0]),
            (0, 1, &[0.0, 1.0, 2.0]),
            (0, 2, &[2.0, 3.0, 4.0]),
            (1, 0, &[0.5, 1.5]),
            (1, 1, &[-1.0, 0.0, 1.0]),
            (1, 2, &[0.0, 2.0]),
        ];
        for (stratum, arm, values) in layout {
            for &endpoint in values {
                observations.push(Observation {
                    stratum,
                    arm,
                    endpoint,
                });
            }
        }
        TrialData {
            domain: "D".into(),
            n_arms: 3,
            n_strata: 2,
            observations,
            prior: PriorSpec {
                groups: vec![2],
                n0: 1.0,
            },
        }
    }
}
