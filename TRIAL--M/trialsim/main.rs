use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use serde_json::json;
use shared_logging::LogLevel;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    design::TrialDesign,
    errors::{DesignError, TrialError},
    helper::{random_seed, replicate_seed, TrialTelemetry},
    models::{Estimator, HierarchicalEstimator, LinearEstimator},
    output::ResultTable,
    simulator::ReplicateRunner,
    summary::ResultRow,
};

/// Runs batches of independent trial replicates on a fixed-size worker pool.
pub struct TrialEngine {
    runner: ReplicateRunner,
    run_seed: u64,
    workers: usize,
    telemetry: Option<TrialTelemetry>,
}

impl TrialEngine {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> TrialEngineBuilder {
        TrialEngineBuilder::default()
    }

    /// Seed every replicate seed is derived from.
    #[must_use]
    pub const fn run_seed(&self) -> u64 {
        self.run_seed
    }

    /// Pool size.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Runs replicate `sim` synchronously (useful to reproduce a failure).
    pub fn run_replicate(&self, sim: usize, n: usize) -> Result<Vec<ResultRow>, TrialError> {
        let seed = replicate_seed(self.run_seed, sim);
        self.runner
            .run(sim, n, seed)
            .map_err(|source| TrialError::Replicate {
                index: sim,
                seed,
                source,
            })
    }

    /// Runs `sims` replicates of `n` patients each.
    ///
    /// The first failing replicate aborts the remaining work and is returned
    /// with its index and seed. Rows come back ordered by replicate.
    pub async fn run_batch(&self, sims: usize, n: usize) -> Result<ResultTable, TrialError> {
        let started = Instant::now();
        self.log(
            LogLevel::Info,
            "trial.batch.start",
            json!({
                "sims": sims,
                "n": n,
                "run_seed": self.run_seed,
                "workers": self.workers,
            }),
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        for sim in 0..sims {
            let runner = self.runner.clone();
            let semaphore = Arc::clone(&semaphore);
            let seed = replicate_seed(self.run_seed, sim);
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|err| TrialError::Worker(err.to_string()))?;
                tokio::task::spawn_blocking(move || runner.run(sim, n, seed))
                    .await
                    .map_err(|err| TrialError::Worker(err.to_string()))?
                    .map(|rows| (sim, rows))
                    .map_err(|source| TrialError::Replicate {
                        index: sim,
                        seed,
                        source,
                    })
            });
        }

        let mut per_sim: Vec<Vec<ResultRow>> = vec![Vec::new(); sims];
        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .map_err(|err| TrialError::Worker(err.to_string()))
                .and_then(|result| result);
            match outcome {
                Ok((sim, rows)) => {
                    self.event(
                        "trial.replicate.completed",
                        json!({ "sim": sim, "seed": replicate_seed(self.run_seed, sim) }),
                    )
                    .await;
                    per_sim[sim] = rows;
                }
                Err(err) => {
                    set.abort_all();
                    let payload = json!({ "seed": err.seed(), "error": err.to_string() });
                    self.log(LogLevel::Error, "trial.replicate.failed", payload.clone());
                    self.event("trial.replicate.failed", payload).await;
                    return Err(err);
                }
            }
        }

        let rows: Vec<ResultRow> = per_sim.into_iter().flatten().collect();
        let elapsed = started.elapsed().as_secs_f64();
        self.log(
            LogLevel::Info,
            "trial.batch.completed",
            json!({ "sims": sims, "rows": rows.len(), "elapsed_s": elapsed }),
        );
        self.event(
            "trial.batch.completed",
            json!({ "sims": sims, "rows": rows.len() }),
        )
        .await;
        Ok(ResultTable::new(self.runner.labels(), rows))
    }

    /// Runs a batch and writes it under `dir`; nothing is written on failure.
    pub async fn run_to_dir(
        &self,
        sims: usize,
        n: usize,
        dir: &Path,
    ) -> Result<PathBuf, TrialError> {
        let table = self.run_batch(sims, n).await?;
        let path = table.write_to_dir(dir, n, sims)?;
        self.log(
            LogLevel::Info,
            "trial.output.written",
            json!({ "path": path.display().to_string(), "rows": table.rows().len() }),
        );
        Ok(path)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    async fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, payload).await;
        }
    }
}

/// Builder for [`TrialEngine`].
pub struct TrialEngineBuilder {
    design: TrialDesign,
    telemetry: Option<TrialTelemetry>,
    run_seed: u64,
    workers: usize,
    estimators: Vec<Arc<dyn Estimator>>,
}

impl TrialEngineBuilder {
    /// Sets the trial design.
    #[must_use]
    pub fn design(mut self, design: TrialDesign) -> Self {
        self.design = design;
        self
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: TrialTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Fixes the run seed.
    #[must_use]
    pub const fn run_seed(mut self, seed: u64) -> Self {
        self.run_seed = seed;
        self
    }

    /// Sets the pool size (at least one worker).
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Adds an estimator; when none is added the hierarchical and linear
    /// estimators are used, in that order.
    #[must_use]
    pub fn estimator(mut self, estimator: Arc<dyn Estimator>) -> Self {
        self.estimators.push(estimator);
        self
    }

    /// Validates the design and builds the engine.
    pub fn build(self) -> Result<TrialEngine, DesignError> {
        let design = Arc::new(self.design.build()?);
        let estimators: Vec<Arc<dyn Estimator>> = if self.estimators.is_empty() {
            vec![
                Arc::new(HierarchicalEstimator::new()),
                Arc::new(LinearEstimator::new()),
            ]
        } else {
            self.estimators
        };
        let runner = ReplicateRunner::new(design, estimators.into(), self.telemetry.clone());
        Ok(TrialEngine {
            runner,
            run_seed: self.run_seed,
            workers: self.workers,
            telemetry: self.telemetry,
        })
    }
}

impl Default for TrialEngineBuilder {
    fn default() -> Self {
        Self {
            design: TrialDesign::default(),
            telemetry: None,
            run_seed: random_seed(),
            workers: std::thread::available_parallelism().map_or(1, usize::from),
            estimators: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{FitError, ReplicateError},
        models::{Estimates, TrialData},
    };
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    struct FailOnSeed(u64);

    impl Estimator for FailOnSeed {
        fn label(&self) -> &str {
            "flaky"
        }

        fn fit(&self, data: &TrialData, seed: u64) -> Result<Estimates, FitError> {
            if seed == self.0 {
                return Err(FitError::Toolchain("divergent transitions".into()));
            }
            LinearEstimator::new().fit(data, seed)
        }
    }

    fn engine(workers: usize) -> TrialEngine {
        TrialEngine::builder()
            .run_seed(1_000)
            .workers(workers)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn batch_concatenates_replicates_in_order() {
        let table = engine(3).run_batch(4, 500).await.unwrap();
        assert_eq!(table.estimators(), &["bayes".to_string(), "lm".to_string()]);
        assert_eq!(table.rows().len(), 4 * 4 * 5);
        let sims: Vec<usize> = table.rows().iter().map(|r| r.sim).collect();
        assert!(sims.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(table.rows()[0].seed, 1_000);
        assert_eq!(table.rows().last().unwrap().seed, 1_003);
    }

    #[tokio::test]
    async fn batch_is_independent_of_pool_size() {
        let serial = engine(1).run_batch(3, 300).await.unwrap();
        let parallel = engine(4).run_batch(3, 300).await.unwrap();
        assert_eq!(serial, parallel);
        assert_eq!(
            serial.rows()[..20],
            engine(2).run_replicate(0, 300).unwrap()[..]
        );
    }

    #[tokio::test]
    async fn zero_sims_writes_header_only() {
        let dir = tempdir().unwrap();
        let path = engine(2)
            .run_to_dir(0, 1000, &dir.path().join("results"))
            .await
            .unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn failing_fit_aborts_batch_and_reports_seed() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("results");
        let engine = TrialEngine::builder()
            .run_seed(50)
            .workers(2)
            .estimator(Arc::new(FailOnSeed(52)))
            .build()
            .unwrap();

        let err = engine.run_to_dir(5, 300, &out).await.unwrap_err();
        assert_eq!(err.seed(), Some(52));
        assert!(matches!(
            err,
            TrialError::Replicate {
                index: 2,
                source: ReplicateError::Fit { .. },
                ..
            }
        ));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn telemetry_records_batch_lifecycle() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(MemoryEventBus::new(16));
        let log_path = dir.path().join("trial.log");
        let telemetry = TrialTelemetry::builder("trialsim")
            .log_path(&log_path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let engine = TrialEngine::builder()
            .run_seed(3)
            .workers(2)
            .telemetry(telemetry)
            .build()
            .unwrap();
        engine.run_batch(2, 200).await.unwrap();

        let events: Vec<String> = bus.snapshot().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            events.iter().filter(|e| *e == "trial.replicate.completed").count(),
            2
        );
        assert_eq!(events.last().map(String::as_str), Some("trial.batch.completed"));
        let log = std::fs::read_to_string(log_path).unwrap();
        assert!(log.contains("trial.batch.start"));
        assert!(log.contains("trial.replicate.completed"));
    }

    #[test]
    fn invalid_design_fails_before_running() {
        let mut design = TrialDesign::default();
        design.accrual_rate = -1.0;
        assert!(matches!(
            TrialEngine::builder().design(design).build(),
            Err(DesignError::Parameter { name: "accrual_rate", .. })
        ));
    }
}
