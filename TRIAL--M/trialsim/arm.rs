use serde::{Deserialize, Serialize};

use crate::errors::DesignError;

/// Name of the implicit control arm every domain prepends.
pub const CONTROL_NAME: &str = "Placebo";

/// One treatment option with an additive effect per stratum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    name: String,
    effects: Vec<f64>,
}

impl Arm {
    /// Creates an arm.
    #[must_use]
    pub fn new(name: impl Into<String>, effects: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            effects,
        }
    }

    /// Control arm with zero effect in every stratum.
    #[must_use]
    pub fn control(strata: usize) -> Self {
        Self::new(CONTROL_NAME, vec![0.0; strata])
    }

    /// Additive `backbone+adjuvant` combination.
    pub fn combine(backbone: &Self, adjuvant: &Self) -> Result<Self, DesignError> {
        if backbone.strata() != adjuvant.strata() {
            return Err(DesignError::StrataMismatch {
                arm: adjuvant.name.clone(),
                expected: backbone.strata(),
                found: adjuvant.strata(),
            });
        }
        let effects = backbone
            .effects
            .iter()
            .zip(&adjuvant.effects)
            .map(|(b, a)| b + a)
            .collect();
        Ok(Self::new(
            format!("{}+{}", backbone.name, adjuvant.name),
            effects,
        ))
    }

    /// Arm name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-stratum effects.
    #[must_use]
    pub fn effects(&self) -> &[f64] {
        &self.effects
    }

    /// Effect in `stratum`, if it exists.
    #[must_use]
    pub fn effect(&self, stratum: usize) -> Option<f64> {
        self.effects.get(stratum).copied()
    }

    /// Number of strata covered.
    #[must_use]
    pub fn strata(&self) -> usize {
        self.effects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_is_all_zero() {
        let control = Arm::control(3);
        assert_eq!(control.name(), CONTROL_NAME);
        assert_eq!(control.effects(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn combination_adds_effects() {
        let backbone = Arm::new("Cetirizine", vec![0.0, -0.5]);
        let adjuvant = Arm::new("Famotidine", vec![-0.25, -0.25]);
        let combo = Arm::combine(&backbone, &adjuvant).unwrap();
        assert_eq!(combo.name(), "Cetirizine+Famotidine");
        assert_eq!(combo.effects(), &[-0.25, -0.75]);
    }

    #[test]
    fn combination_rejects_mismatched_strata() {
        let backbone = Arm::new("B", vec![0.0, 0.0]);
        let adjuvant = Arm::new("A", vec![0.0]);
        assert!(matches!(
            Arm::combine(&backbone, &adjuvant),
            Err(DesignError::StrataMismatch { found: 1, .. })
        ));
    }
}
