use crate::{
    errors::FitError,
    helper::normal_cdf,
    models::{contrast_grid, Contrast, EstimateCell, Estimates, Estimator, TrialData},
};

/// Normal-normal hierarchical model over strata, fitted in closed form.
///
/// For each drug the stratum contrasts `theta_hat_s` (variance `v_s`) are
/// exchangeable draws around a drug-level mean `mu`:
///
/// * `tau^2` is the DerSimonian-Laird moment estimate (zero with one stratum);
/// * `mu` has a zero-centred normal prior worth `n0` pseudo-patients, i.e.
///   precision `n0 / s^2` with `s^2` the pooled residual variance;
/// * each stratum's posterior shrinks `theta_hat_s` toward `mu` by
///   `B_s = v_s / (v_s + tau^2)`.
///
/// Strata without an estimable contrast for a drug are left out of `tau^2`
/// and `mu`; their posterior is the predictive `N(mu, tau^2 + Var(mu))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchicalEstimator;

impl HierarchicalEstimator {
    /// Creates the estimator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Estimator for HierarchicalEstimator {
    fn label(&self) -> &str {
        "bayes"
    }

    fn fit(&self, data: &TrialData, _seed: u64) -> Result<Estimates, FitError> {
        let grid: Vec<Option<Contrast>> = contrast_grid(data).into_iter().map(Result::ok).collect();
        let n0 = data.prior.n0.max(0.0);
        let mut cells = Vec::with_capacity(grid.len());
        for (offset, group) in grid.chunks(data.n_strata.max(1)).enumerate() {
            let fitted = shrink(group, n0).ok_or(FitError::NoInformation { drug: offset + 1 })?;
            cells.extend(fitted);
        }
        Ok(Estimates::new(data.n_strata, cells))
    }
}

/// Posterior cells for one drug; `None` when no stratum was observed.
#[allow(clippy::cast_precision_loss)]
fn shrink(group: &[Option<Contrast>], n0: f64) -> Option<Vec<EstimateCell>> {
    let observed: Vec<Contrast> = group.iter().flatten().copied().collect();
    if observed.is_empty() {
        return None;
    }
    let tau2 = between_stratum_variance(&observed);

    let pooled_residual =
        observed.iter().map(|c| c.residual_var).sum::<f64>() / observed.len() as f64;
    let prior_precision = if pooled_residual > 0.0 {
        n0 / pooled_residual
    } else {
        0.0
    };

    let weights: Vec<f64> = observed.iter().map(|c| 1.0 / (c.variance + tau2)).collect();
    let precision = weights.iter().sum::<f64>() + prior_precision;
    let mu = observed
        .iter()
        .zip(&weights)
        .map(|(c, w)| w * c.estimate)
        .sum::<f64>()
        / precision;
    let mu_var = 1.0 / precision;

    let cell = |mean: f64, var: f64| {
        let sd = var.sqrt();
        EstimateCell {
            mean,
            superiority: normal_cdf(-mean / sd),
            sd,
        }
    };
    Some(
        group
            .iter()
            .map(|contrast| match contrast {
                Some(c) => {
                    let b = c.variance / (c.variance + tau2);
                    cell(
                        (1.0 - b).mul_add(c.estimate - mu, mu),
                        (1.0 - b).mul_add(c.variance, b * b * mu_var),
                    )
                }
                None => cell(mu, tau2 + mu_var),
            })
            .collect(),
    )
}

#[allow(clippy::cast_precision_loss)]
fn between_stratum_variance(group: &[Contrast]) -> f64 {
    if group.len() < 2 {
        return 0.0;
    }
    let weights: Vec<f64> = group.iter().map(|c| 1.0 / c.variance).collect();
    let sum_w: f64 = weights.iter().sum();
    let sum_w2: f64 = weights.iter().map(|w| w * w).sum();
    let fixed = group
        .iter()
        .zip(&weights)
        .map(|(c, w)| w * c.estimate)
        .sum::<f64>()
        / sum_w;
    let q: f64 = group
        .iter()
        .zip(&weights)
        .map(|(c, w)| w * (c.estimate - fixed).powi(2))
        .sum();
    let denom = sum_w - sum_w2 / sum_w;
    if denom <= 0.0 {
        return 0.0;
    }
    ((q - (group.len() - 1) as f64) / denom).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fixtures::small_data, LinearEstimator};

    fn contrast(estimate: f64, variance: f64) -> Contrast {
        Contrast {
            estimate,
            variance,
            residual_var: 1.0,
        }
    }

    fn observed(group: &[Contrast]) -> Vec<Option<Contrast>> {
        group.iter().copied().map(Some).collect()
    }

    #[test]
    fn homogeneous_strata_pool_completely() {
        let group = [contrast(-0.5, 0.1), contrast(-0.5, 0.1), contrast(-0.5, 0.1)];
        assert_eq!(between_stratum_variance(&group), 0.0);
        let cells = shrink(&observed(&group), 0.0).unwrap();
        for cell in &cells {
            assert!((cell.mean + 0.5).abs() < 1e-12);
            assert!((cell.sd - (0.1_f64 / 3.0).sqrt()).abs() < 1e-12);
        }
    }

    #[test]
    fn heterogeneous_strata_shrink_partially() {
        let group = [contrast(-2.0, 0.01), contrast(2.0, 0.01)];
        let tau2 = between_stratum_variance(&group);
        assert!(tau2 > 1.0);
        let cells = shrink(&observed(&group), 0.0).unwrap();
        assert!(cells[0].mean < -1.9 && cells[0].mean > -2.0);
        assert!(cells[1].mean > 1.9 && cells[1].mean < 2.0);
        assert!(cells[0].superiority > 0.99);
    }

    #[test]
    fn prior_pulls_toward_zero() {
        let group = [contrast(-1.0, 0.5), contrast(-1.0, 0.5)];
        let flat = shrink(&observed(&group), 0.0).unwrap();
        let informative = shrink(&observed(&group), 10.0).unwrap();
        assert!(informative[0].mean > flat[0].mean);
        assert!(informative[0].mean < 0.0);
    }

    #[test]
    fn single_stratum_matches_linear_model_without_prior() {
        let mut data = small_data();
        data.observations.retain(|o| o.stratum == 0);
        data.n_strata = 1;
        data.prior.n0 = 0.0;
        let bayes = HierarchicalEstimator::new().fit(&data, 0).unwrap();
        let lm = LinearEstimator::new().fit(&data, 0).unwrap();
        for (b, l) in bayes.cells().iter().zip(lm.cells()) {
            assert!((b.mean - l.mean).abs() < 1e-12);
            assert!((b.sd - l.sd).abs() < 1e-12);
        }
    }

    #[test]
    fn fits_every_cell() {
        let estimates = HierarchicalEstimator::new().fit(&small_data(), 0).unwrap();
        assert_eq!(estimates.cells().len(), 4);
        assert!(estimates
            .cells()
            .iter()
            .all(|c| c.sd > 0.0 && (0.0..=1.0).contains(&c.superiority)));
    }

    #[test]
    fn unobserved_stratum_borrows_from_the_others() {
        let mut data = small_data();
        data.observations.retain(|o| !(o.stratum == 1 && o.arm == 2));
        assert!(LinearEstimator::new().fit(&data, 0).is_err());

        let estimates = HierarchicalEstimator::new().fit(&data, 0).unwrap();
        assert_eq!(estimates.cells().len(), 4);
        let filled = estimates.get(2, 1).unwrap();
        let observed = estimates.get(2, 0).unwrap();
        assert!(filled.mean.is_finite() && filled.sd > 0.0);
        assert!((0.0..=1.0).contains(&filled.superiority));
        // a lone observed stratum gives tau^2 = 0, so the gap gets mu itself
        assert!((filled.mean - observed.mean).abs() < 1e-12);
        assert!(filled.sd >= observed.sd - 1e-12);
    }

    #[test]
    fn predictive_cell_widens_with_heterogeneity() {
        let group = [
            Some(contrast(-2.0, 0.01)),
            Some(contrast(2.0, 0.01)),
            None,
        ];
        let cells = shrink(&group, 0.0).unwrap();
        let tau2 = between_stratum_variance(&[contrast(-2.0, 0.01), contrast(2.0, 0.01)]);
        assert!(cells[2].mean.abs() < 1e-9);
        assert!(cells[2].sd * cells[2].sd > tau2);
    }

    #[test]
    fn drug_without_any_observed_stratum_fails() {
        let mut data = small_data();
        data.observations.retain(|o| o.arm != 2);
        assert!(matches!(
            HierarchicalEstimator::new().fit(&data, 0),
            Err(FitError::NoInformation { drug: 2 })
        ));
    }
}
