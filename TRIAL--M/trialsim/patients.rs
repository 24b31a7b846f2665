use rand::{
    distributions::{Distribution, WeightedIndex},
    Rng,
};
use serde::{Deserialize, Serialize};

use crate::{
    domain::Domain,
    errors::DesignError,
    helper::{exponential, standard_normal},
};

const PREVALENCE_TOLERANCE: f64 = 1e-6;

/// One simulated participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    /// Enrollment order.
    pub id: usize,
    /// Stratum index.
    pub stratum: usize,
    /// Arrival time.
    pub arrival: f64,
    /// Assigned arm index per domain, in domain order.
    pub assignment: Vec<usize>,
    /// Observed endpoint: summed domain effects plus observation noise.
    pub endpoint: f64,
    /// Whether the patient dropped out before the endpoint was observed.
    pub dropped_out: bool,
}

/// Generator of a stratified, accruing patient population.
#[derive(Debug, Clone)]
pub struct StratifiedPatients {
    names: Vec<String>,
    prevalence: Vec<f64>,
    accrual_rate: f64,
    dropout_rate: f64,
    noise_sd: f64,
    patients: Vec<Patient>,
}

impl StratifiedPatients {
    /// Validates the population parameters; observation noise defaults to sd 1.
    pub fn new(
        names: Vec<String>,
        prevalence: Vec<f64>,
        accrual_rate: f64,
        dropout_rate: f64,
    ) -> Result<Self, DesignError> {
        if names.len() != prevalence.len() {
            return Err(DesignError::Prevalence(format!(
                "{} strata names but {} prevalences",
                names.len(),
                prevalence.len()
            )));
        }
        if names.is_empty() {
            return Err(DesignError::Prevalence("no strata declared".into()));
        }
        if prevalence.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(DesignError::Prevalence(format!(
                "entries must be finite and non-negative: {prevalence:?}"
            )));
        }
        let total: f64 = prevalence.iter().sum();
        if (total - 1.0).abs() > PREVALENCE_TOLERANCE {
            return Err(DesignError::Prevalence(format!(
                "entries sum to {total}, expected 1"
            )));
        }
        if !(accrual_rate.is_finite() && accrual_rate > 0.0) {
            return Err(DesignError::Parameter {
                name: "accrual_rate",
                value: accrual_rate,
                expected: "> 0",
            });
        }
        if !(0.0..=1.0).contains(&dropout_rate) {
            return Err(DesignError::Parameter {
                name: "dropout_rate",
                value: dropout_rate,
                expected: "0..=1",
            });
        }
        Ok(Self {
            names,
            prevalence,
            accrual_rate,
            dropout_rate,
            noise_sd: 1.0,
            patients: Vec::new(),
        })
    }

    /// Sets the observation noise standard deviation.
    pub fn with_noise_sd(mut self, noise_sd: f64) -> Result<Self, DesignError> {
        if !(noise_sd.is_finite() && noise_sd >= 0.0) {
            return Err(DesignError::Parameter {
                name: "noise_sd",
                value: noise_sd,
                expected: ">= 0",
            });
        }
        self.noise_sd = noise_sd;
        Ok(self)
    }

    /// Stratum names.
    #[must_use]
    pub fn strata_names(&self) -> &[String] {
        &self.names
    }

    /// Every enrolled patient, dropouts included.
    #[must_use]
    pub fn patients(&self) -> &[Patient] {
        &self.patients
    }

    /// Enrolls `n` more patients arriving from `start_time`, randomizing them
    /// in every domain. Returns the last arrival time (or `start_time`).
    pub fn enroll_n<R: Rng + ?Sized>(
        &mut self,
        n: usize,
        start_time: f64,
        domains: &[Domain],
        rng: &mut R,
    ) -> Result<f64, DesignError> {
        if let Some(domain) = domains.iter().find(|d| d.strata() != self.names.len()) {
            return Err(DesignError::Design(format!(
                "domain `{}` covers {} strata but the population has {}",
                domain.name(),
                domain.strata(),
                self.names.len()
            )));
        }

        let strata_dist = WeightedIndex::new(&self.prevalence)
            .map_err(|err| DesignError::Prevalence(err.to_string()))?;
        let strata: Vec<usize> = (0..n).map(|_| strata_dist.sample(rng)).collect();

        let mut clock = start_time;
        let arrivals: Vec<f64> = (0..n)
            .map(|_| {
                clock += exponential(rng, self.accrual_rate);
                clock
            })
            .collect();

        let mut endpoints = vec![0.0; n];
        let mut assignments: Vec<Vec<usize>> = vec![Vec::with_capacity(domains.len()); n];
        for domain in domains {
            let assignment = domain.randomize_patients(&strata, rng)?;
            let effects = domain.treatment_effect(&strata, &assignment)?;
            for (idx, (arm, effect)) in assignment.into_iter().zip(effects).enumerate() {
                assignments[idx].push(arm);
                endpoints[idx] += effect;
            }
        }

        let first_id = self.patients.len();
        for (idx, ((stratum, arrival), assignment)) in strata
            .into_iter()
            .zip(arrivals)
            .zip(assignments)
            .enumerate()
        {
            let endpoint = self.noise_sd.mul_add(standard_normal(rng), endpoints[idx]);
            let dropped_out = rng.gen::<f64>() < self.dropout_rate;
            self.patients.push(Patient {
                id: first_id + idx,
                stratum,
                arrival,
                assignment,
                endpoint,
                dropped_out,
            });
        }
        Ok(clock)
    }

    /// Patients who did not drop out.
    #[must_use]
    pub fn get_complete(&self) -> Vec<&Patient> {
        self.patients.iter().filter(|p| !p.dropped_out).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arm::Arm, helper::seeded_rng};

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("S{i}")).collect()
    }

    fn two_arm_domain(strata: usize) -> Domain {
        Domain::new("D", vec![Arm::new("A", vec![-1.0; strata])], None).unwrap()
    }

    #[test]
    fn validates_prevalence_and_rates() {
        assert!(StratifiedPatients::new(names(2), vec![0.5, 0.4], 1.0, 0.0).is_err());
        assert!(StratifiedPatients::new(names(2), vec![0.5], 1.0, 0.0).is_err());
        assert!(StratifiedPatients::new(names(2), vec![1.5, -0.5], 1.0, 0.0).is_err());
        assert!(StratifiedPatients::new(names(2), vec![0.5, 0.5], 0.0, 0.0).is_err());
        assert!(StratifiedPatients::new(names(2), vec![0.5, 0.5], 1.0, 1.5).is_err());
        assert!(StratifiedPatients::new(names(2), vec![0.5, 0.5], 1.0, 0.0)
            .unwrap()
            .with_noise_sd(-1.0)
            .is_err());
    }

    #[test]
    fn enrollment_follows_prevalence_and_accrual() {
        let prevalence = vec![0.20, 0.25, 0.15, 0.30, 0.10];
        let mut population =
            StratifiedPatients::new(names(5), prevalence.clone(), 20.0, 0.0).unwrap();
        let mut rng = seeded_rng(5);
        let last = population
            .enroll_n(10_000, 0.0, &[two_arm_domain(5)], &mut rng)
            .unwrap();

        let patients = population.patients();
        assert_eq!(patients.len(), 10_000);
        for (stratum, p) in prevalence.iter().enumerate() {
            let share = patients.iter().filter(|pt| pt.stratum == stratum).count() as f64 / 1e4;
            assert!((share - p).abs() < 0.02, "stratum {stratum}");
        }
        assert!(patients.windows(2).all(|w| w[0].arrival <= w[1].arrival));
        assert!((last / 10_000.0 - 1.0 / 20.0).abs() < 0.005);
    }

    #[test]
    fn endpoints_carry_the_assigned_effect() {
        let mut population = StratifiedPatients::new(names(1), vec![1.0], 5.0, 0.0)
            .unwrap()
            .with_noise_sd(0.0)
            .unwrap();
        let mut rng = seeded_rng(6);
        population
            .enroll_n(50, 0.0, &[two_arm_domain(1)], &mut rng)
            .unwrap();
        for patient in population.patients() {
            let expected = if patient.assignment[0] == 1 { -1.0 } else { 0.0 };
            assert_eq!(patient.endpoint, expected);
        }
    }

    #[test]
    fn effects_add_across_domains() {
        let mut population = StratifiedPatients::new(names(1), vec![1.0], 5.0, 0.0)
            .unwrap()
            .with_noise_sd(0.0)
            .unwrap();
        let second = Domain::new("E", vec![Arm::new("B", vec![-2.0])], None).unwrap();
        let mut rng = seeded_rng(7);
        population
            .enroll_n(40, 0.0, &[two_arm_domain(1), second], &mut rng)
            .unwrap();
        for patient in population.patients() {
            let expected = -1.0 * patient.assignment[0] as f64 - 2.0 * patient.assignment[1] as f64;
            assert_eq!(patient.endpoint, expected);
        }
    }

    #[test]
    fn repeated_enrollment_appends_and_dropouts_are_excluded() {
        let mut population = StratifiedPatients::new(names(2), vec![0.5, 0.5], 10.0, 0.5).unwrap();
        let mut rng = seeded_rng(8);
        let domains = [two_arm_domain(2)];
        let t = population.enroll_n(200, 0.0, &domains, &mut rng).unwrap();
        population.enroll_n(200, t, &domains, &mut rng).unwrap();
        assert_eq!(population.patients().len(), 400);
        assert_eq!(population.patients()[200].id, 200);
        assert!(population.patients()[200].arrival > t);

        let complete = population.get_complete();
        assert!(complete.iter().all(|p| !p.dropped_out));
        assert!(complete.len() > 120 && complete.len() < 280);
    }

    #[test]
    fn mismatched_domain_is_rejected() {
        let mut population = StratifiedPatients::new(names(2), vec![0.5, 0.5], 1.0, 0.0).unwrap();
        let mut rng = seeded_rng(9);
        assert!(population
            .enroll_n(5, 0.0, &[two_arm_domain(3)], &mut rng)
            .is_err());
    }
}
