use serde::{Deserialize, Serialize};

use crate::{
    domain::Domain,
    models::{CellSummary, EstimateCell, Estimates, TrialData},
};

/// One output record: a (drug, stratum) cell of one replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Replicate index.
    pub sim: usize,
    /// Patients enrolled in the replicate.
    pub n: usize,
    /// Replicate seed.
    pub seed: u64,
    /// Stratum index.
    pub stratum: usize,
    /// 1-based drug index within the analysed domain.
    pub drug: usize,
    /// True simulated effect.
    pub effect: f64,
    /// Completers on the drug in this stratum.
    pub treatment: CellSummary,
    /// Completers on control in this stratum.
    pub control: CellSummary,
    /// Estimates in estimator order.
    pub estimates: Vec<EstimateCell>,
}

/// Identifies the replicate a set of rows belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ReplicateKey {
    /// Replicate index.
    pub sim: usize,
    /// Enrolled patients.
    pub n: usize,
    /// Replicate seed.
    pub seed: u64,
}

/// Joins raw per-cell summaries with every estimator's output.
///
/// Rows are drug-major with strata varying fastest. Cells an estimator did
/// not report are filled with NaN.
#[must_use]
pub fn summarize(
    key: ReplicateKey,
    domain: &Domain,
    data: &TrialData,
    estimates: &[Estimates],
) -> Vec<ResultRow> {
    let controls: Vec<CellSummary> = (0..data.n_strata).map(|s| data.cell(0, s)).collect();
    let missing = EstimateCell {
        mean: f64::NAN,
        superiority: f64::NAN,
        sd: f64::NAN,
    };

    let mut rows = Vec::with_capacity(data.n_drugs() * data.n_strata);
    for drug in 1..data.n_arms {
        for (stratum, control) in controls.iter().enumerate() {
            rows.push(ResultRow {
                sim: key.sim,
                n: key.n,
                seed: key.seed,
                stratum,
                drug,
                effect: domain.effect(drug, stratum).unwrap_or(f64::NAN),
                treatment: data.cell(drug, stratum),
                control: *control,
                estimates: estimates
                    .iter()
                    .map(|e| e.get(drug, stratum).copied().unwrap_or(missing))
                    .collect(),
            });
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arm::Arm, models::fixtures::small_data};

    #[test]
    fn rows_cover_every_drug_and_stratum() {
        let domain = Domain::new(
            "D",
            vec![Arm::new("A", vec![-0.5, 0.0]), Arm::new("B", vec![0.0, -1.0])],
            None,
        )
        .unwrap();
        let data = small_data();
        let estimate = |mean| EstimateCell {
            mean,
            superiority: 0.5,
            sd: 1.0,
        };
        let fitted = Estimates::new(
            2,
            vec![estimate(1.0), estimate(2.0), estimate(3.0), estimate(4.0)],
        );
        let key = ReplicateKey {
            sim: 3,
            n: 16,
            seed: 99,
        };
        let rows = summarize(key, &domain, &data, &[fitted]);

        assert_eq!(rows.len(), 4);
        let order: Vec<(usize, usize)> = rows.iter().map(|r| (r.drug, r.stratum)).collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (2, 0), (2, 1)]);
        assert_eq!(rows[3].effect, -1.0);
        assert_eq!(rows[3].estimates[0].mean, 4.0);
        assert_eq!(rows[0].treatment.n, 3);
        assert_eq!(rows[0].treatment.mean, Some(1.0));
        assert_eq!(rows[1].control.n, 2);
        assert_eq!(rows[1].control.var, Some(0.5));
        assert!(rows.iter().all(|r| r.sim == 3 && r.seed == 99 && r.n == 16));
    }
}
