use std::sync::Arc;

use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    design::BuiltDesign,
    errors::ReplicateError,
    helper::{seeded_rng, TrialTelemetry},
    models::{Estimator, TrialData},
    summary::{summarize, ReplicateKey, ResultRow},
};

/// Runs single trial replicates: enroll, randomize, fit, summarize.
///
/// Cheap to clone; every clone shares the validated design and estimators.
#[derive(Clone)]
pub struct ReplicateRunner {
    design: Arc<BuiltDesign>,
    estimators: Arc<[Arc<dyn Estimator>]>,
    telemetry: Option<TrialTelemetry>,
}

impl ReplicateRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        design: Arc<BuiltDesign>,
        estimators: Arc<[Arc<dyn Estimator>]>,
        telemetry: Option<TrialTelemetry>,
    ) -> Self {
        Self {
            design,
            estimators,
            telemetry,
        }
    }

    /// Estimator labels in column order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.estimators.iter().map(|e| e.label().to_string()).collect()
    }

    /// Runs replicate `sim` with `n` patients from `seed`.
    pub fn run(&self, sim: usize, n: usize, seed: u64) -> Result<Vec<ResultRow>, ReplicateError> {
        let mut rng = seeded_rng(seed);
        let mut population = self.design.population.clone();
        population.enroll_n(n, 0.0, &self.design.domains, &mut rng)?;

        let completers = population.get_complete();
        let domain = self.design.analysis_domain();
        let data = TrialData::from_completers(&completers, self.design.analysis, domain);

        let mut estimates = Vec::with_capacity(self.estimators.len());
        for estimator in self.estimators.iter() {
            let fitted = estimator
                .fit(&data, seed)
                .map_err(|source| ReplicateError::Fit {
                    estimator: estimator.label().to_string(),
                    source,
                })?;
            estimates.push(fitted);
        }

        let rows = summarize(ReplicateKey { sim, n, seed }, domain, &data, &estimates);
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Debug,
                "trial.replicate.completed",
                json!({
                    "sim": sim,
                    "seed": seed,
                    "enrolled": n,
                    "completers": completers.len(),
                    "rows": rows.len(),
                }),
            );
        }
        Ok(rows)
    }
}
