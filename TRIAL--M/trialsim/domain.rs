use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{arm::Arm, errors::DesignError, randomization::allocation_sequence};

/// Prior metadata a domain hands to Bayesian estimators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    /// Sizes of exchangeable groups of active arms.
    pub groups: Vec<usize>,
    /// Prior pseudo-sample size.
    pub n0: f64,
}

/// How a domain's arm list and allocation are produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainLayout {
    /// Explicit arms; uniform allocation unless one is given (control first).
    Standard {
        /// Active arms, control excluded.
        arms: Vec<Arm>,
        /// Optional unnormalized allocation of length `arms + 1`.
        allocation: Option<Vec<f64>>,
    },
    /// Backbone arms alone plus every additive backbone+adjuvant pairing.
    Combination {
        /// Backbone arms.
        backbone: Vec<Arm>,
        /// Adjuvants layered on each backbone.
        adjuvants: Vec<Arm>,
    },
}

struct Resolved {
    arms: Vec<Arm>,
    allocation: Option<Vec<f64>>,
    groups: Vec<usize>,
}

impl DomainLayout {
    #[allow(clippy::cast_precision_loss)]
    fn resolve(self) -> Result<Resolved, DesignError> {
        match self {
            Self::Standard { arms, allocation } => {
                let groups = vec![arms.len()];
                Ok(Resolved {
                    arms,
                    allocation,
                    groups,
                })
            }
            Self::Combination {
                backbone,
                adjuvants,
            } => {
                let mut arms = backbone.clone();
                for adjuvant in &adjuvants {
                    for base in &backbone {
                        arms.push(Arm::combine(base, adjuvant)?);
                    }
                }
                let b = backbone.len() as f64;
                let a = adjuvants.len() as f64;
                let mut allocation = vec![1.0 / (1.0 + b) / (1.0 + a); arms.len() + 1];
                allocation[0] = 1.0 / (1.0 + b);
                Ok(Resolved {
                    arms,
                    allocation: Some(allocation),
                    groups: vec![backbone.len(); adjuvants.len() + 1],
                })
            }
        }
    }
}

/// Mutually exclusive arms sharing one randomization allocation.
///
/// Arm 0 is always the control arm.
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    name: String,
    arms: Vec<Arm>,
    allocation: Vec<f64>,
    strata: usize,
    prior: PriorSpec,
}

impl Domain {
    /// Standard domain over `arms` (control excluded).
    pub fn new(
        name: impl Into<String>,
        arms: Vec<Arm>,
        allocation: Option<Vec<f64>>,
    ) -> Result<Self, DesignError> {
        Self::from_layout(name, DomainLayout::Standard { arms, allocation })
    }

    /// Combination domain crossing `backbone` with `adjuvants`.
    pub fn combination(
        name: impl Into<String>,
        backbone: Vec<Arm>,
        adjuvants: Vec<Arm>,
    ) -> Result<Self, DesignError> {
        Self::from_layout(
            name,
            DomainLayout::Combination {
                backbone,
                adjuvants,
            },
        )
    }

    /// Builds and validates a domain from a layout policy.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_layout(name: impl Into<String>, layout: DomainLayout) -> Result<Self, DesignError> {
        let name = name.into();
        let Resolved {
            arms,
            allocation,
            groups,
        } = layout.resolve()?;

        let Some(first) = arms.first() else {
            return Err(DesignError::NoArms { domain: name });
        };
        let strata = first.strata();
        if strata == 0 {
            return Err(DesignError::StrataMismatch {
                arm: first.name().to_string(),
                expected: 1,
                found: 0,
            });
        }
        if let Some(bad) = arms.iter().find(|arm| arm.strata() != strata) {
            return Err(DesignError::StrataMismatch {
                arm: bad.name().to_string(),
                expected: strata,
                found: bad.strata(),
            });
        }

        let arm_count = arms.len() + 1;
        let allocation = match allocation {
            None => vec![1.0 / arm_count as f64; arm_count],
            Some(raw) => normalize_allocation(&name, &raw, arm_count)?,
        };

        let mut all_arms = Vec::with_capacity(arm_count);
        all_arms.push(Arm::control(strata));
        all_arms.extend(arms);

        Ok(Self {
            name,
            arms: all_arms,
            allocation,
            strata,
            prior: PriorSpec { groups, n0: 1.0 },
        })
    }

    /// Overrides the prior pseudo-sample size.
    #[must_use]
    pub fn with_prior_n0(mut self, n0: f64) -> Self {
        self.prior.n0 = n0;
        self
    }

    /// Domain name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arms, control first.
    #[must_use]
    pub fn arms(&self) -> &[Arm] {
        &self.arms
    }

    /// Active arms (control excluded); drug ids are their 1-based positions.
    #[must_use]
    pub fn drugs(&self) -> &[Arm] {
        &self.arms[1..]
    }

    /// Normalized allocation, control first.
    #[must_use]
    pub fn allocation(&self) -> &[f64] {
        &self.allocation
    }

    /// Number of strata.
    #[must_use]
    pub const fn strata(&self) -> usize {
        self.strata
    }

    /// Prior metadata.
    #[must_use]
    pub const fn prior(&self) -> &PriorSpec {
        &self.prior
    }

    /// Arm-effect matrix, `[arm][stratum]`.
    #[must_use]
    pub fn arm_effects(&self) -> Vec<Vec<f64>> {
        self.arms.iter().map(|arm| arm.effects().to_vec()).collect()
    }

    /// True effect of `arm` in `stratum`.
    #[must_use]
    pub fn effect(&self, arm: usize, stratum: usize) -> Option<f64> {
        self.arms.get(arm).and_then(|a| a.effect(stratum))
    }

    /// Stratified randomization: patients are assigned in arrival order to
    /// successive entries of their stratum's allocation sequence.
    pub fn randomize_patients<R: Rng + ?Sized>(
        &self,
        strata: &[usize],
        rng: &mut R,
    ) -> Result<Vec<usize>, DesignError> {
        let mut counts = vec![0usize; self.strata];
        for &stratum in strata {
            let slot = counts.get_mut(stratum).ok_or_else(|| {
                DesignError::PatientData(format!(
                    "stratum {stratum} outside 0..{} in domain `{}`",
                    self.strata, self.name
                ))
            })?;
            *slot += 1;
        }

        let sequences: Vec<Vec<usize>> = counts
            .iter()
            .map(|&n| allocation_sequence(n, &self.allocation, rng))
            .collect();

        let mut consumed = vec![0usize; self.strata];
        Ok(strata
            .iter()
            .map(|&stratum| {
                let arm = sequences[stratum][consumed[stratum]];
                consumed[stratum] += 1;
                arm
            })
            .collect())
    }

    /// Realized effect per patient, looked up from the arm-effect matrix.
    pub fn treatment_effect(
        &self,
        strata: &[usize],
        assignment: &[usize],
    ) -> Result<Vec<f64>, DesignError> {
        if strata.len() != assignment.len() {
            return Err(DesignError::PatientData(format!(
                "{} strata but {} assignments",
                strata.len(),
                assignment.len()
            )));
        }
        strata
            .iter()
            .zip(assignment)
            .map(|(&stratum, &arm)| {
                self.effect(arm, stratum).ok_or_else(|| {
                    DesignError::PatientData(format!(
                        "no effect for arm {arm} in stratum {stratum} of domain `{}`",
                        self.name
                    ))
                })
            })
            .collect()
    }
}

fn normalize_allocation(
    domain: &str,
    raw: &[f64],
    arm_count: usize,
) -> Result<Vec<f64>, DesignError> {
    if raw.len() != arm_count {
        return Err(DesignError::AllocationLength {
            domain: domain.to_string(),
            expected: arm_count,
            found: raw.len(),
        });
    }
    if let Some((index, &value)) = raw
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite() || **v < 0.0)
    {
        return Err(DesignError::AllocationEntry {
            domain: domain.to_string(),
            index,
            value,
        });
    }
    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return Err(DesignError::AllocationZero {
            domain: domain.to_string(),
        });
    }
    Ok(raw.iter().map(|v| v / total).collect())
}
