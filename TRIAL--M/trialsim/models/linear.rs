use crate::{
    errors::FitError,
    helper::normal_cdf,
    models::{stratum_contrasts, EstimateCell, Estimates, Estimator, TrialData},
};

/// Per-stratum least squares on arm indicators, control as reference.
///
/// Frequentist baseline: each stratum is analysed on its own, so effects are
/// never borrowed across strata.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearEstimator;

impl LinearEstimator {
    /// Creates the estimator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Estimator for LinearEstimator {
    fn label(&self) -> &str {
        "lm"
    }

    fn fit(&self, data: &TrialData, _seed: u64) -> Result<Estimates, FitError> {
        let cells = stratum_contrasts(data)?
            .into_iter()
            .map(|c| {
                let sd = c.variance.sqrt();
                EstimateCell {
                    mean: c.estimate,
                    superiority: normal_cdf(-c.estimate / sd),
                    sd,
                }
            })
            .collect();
        Ok(Estimates::new(data.n_strata, cells))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::small_data;

    #[test]
    fn reports_difference_in_means() {
        let estimates = LinearEstimator::new().fit(&small_data(), 0).unwrap();
        let cell = estimates.get(1, 0).unwrap();
        assert!((cell.mean + 1.0).abs() < 1e-12);
        assert!((cell.sd - (2.0_f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!(cell.superiority > 0.85 && cell.superiority < 0.95);

        let harmful = estimates.get(2, 0).unwrap();
        assert!(harmful.superiority < 0.15);
    }

    #[test]
    fn propagates_insufficient_data() {
        let mut data = small_data();
        data.observations.retain(|o| o.arm != 0);
        assert!(LinearEstimator::new().fit(&data, 0).is_err());
    }
}
