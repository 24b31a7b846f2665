use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    arm::Arm,
    domain::{Domain, DomainLayout},
    errors::DesignError,
    patients::StratifiedPatients,
};

/// Trial design document, usually loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialDesign {
    /// Schema version (informational).
    #[serde(default = "default_version")]
    pub version: u32,
    /// Expected enrollments per unit time.
    #[serde(default = "default_accrual_rate")]
    pub accrual_rate: f64,
    /// Per-patient dropout probability.
    #[serde(default = "default_dropout_rate")]
    pub dropout_rate: f64,
    /// Observation noise standard deviation.
    #[serde(default = "default_noise_sd")]
    pub noise_sd: f64,
    /// Prior pseudo-sample size for Bayesian estimators.
    #[serde(default = "default_n0")]
    pub n0: f64,
    /// Domain whose arms are analysed; the first domain when absent.
    #[serde(default)]
    pub analysis_domain: Option<String>,
    /// Strata in order.
    pub strata: Vec<StratumConfig>,
    /// Domains in order.
    pub domains: Vec<DomainConfig>,
}

/// One stratum and its prevalence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumConfig {
    /// Display name.
    pub name: String,
    /// Probability that a patient belongs to this stratum.
    pub prevalence: f64,
}

/// One arm as written in the design file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmConfig {
    /// Arm name.
    pub name: String,
    /// Per-stratum effects.
    pub effects: Vec<f64>,
}

impl From<&ArmConfig> for Arm {
    fn from(config: &ArmConfig) -> Self {
        Self::new(config.name.clone(), config.effects.clone())
    }
}

/// Domain declaration, tagged by `layout`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum DomainConfig {
    /// Explicit arm list.
    Standard {
        /// Domain name.
        name: String,
        /// Active arms.
        arms: Vec<ArmConfig>,
        /// Unnormalized allocation, control first.
        #[serde(default)]
        allocation: Option<Vec<f64>>,
    },
    /// Backbone arms crossed with adjuvants.
    Combination {
        /// Domain name.
        name: String,
        /// Backbone arms.
        backbone: Vec<ArmConfig>,
        /// Adjuvant arms.
        adjuvants: Vec<ArmConfig>,
    },
}

impl DomainConfig {
    /// Domain name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Standard { name, .. } | Self::Combination { name, .. } => name,
        }
    }

    fn layout(&self) -> DomainLayout {
        let arms = |configs: &[ArmConfig]| -> Vec<Arm> { configs.iter().map(Arm::from).collect() };
        match self {
            Self::Standard {
                arms: declared,
                allocation,
                ..
            } => DomainLayout::Standard {
                arms: arms(declared),
                allocation: allocation.clone(),
            },
            Self::Combination {
                backbone,
                adjuvants,
                ..
            } => DomainLayout::Combination {
                backbone: arms(backbone),
                adjuvants: arms(adjuvants),
            },
        }
    }
}

/// Validated design: built domains and an empty population template.
#[derive(Debug, Clone)]
pub struct BuiltDesign {
    /// Domains in declaration order.
    pub domains: Vec<Domain>,
    /// Index of the analysed domain.
    pub analysis: usize,
    /// Population generator with nobody enrolled yet.
    pub population: StratifiedPatients,
}

impl BuiltDesign {
    /// Analysed domain.
    #[must_use]
    pub fn analysis_domain(&self) -> &Domain {
        &self.domains[self.analysis]
    }
}

impl TrialDesign {
    /// Loads a design from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading trial design {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a design from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Validates the design and builds its domains and population.
    pub fn build(&self) -> Result<BuiltDesign, DesignError> {
        if self.domains.is_empty() {
            return Err(DesignError::Design("no domains declared".into()));
        }
        let domains = self
            .domains
            .iter()
            .map(|config| {
                Domain::from_layout(config.name(), config.layout())
                    .map(|domain| domain.with_prior_n0(self.n0))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let analysis = match &self.analysis_domain {
            None => 0,
            Some(name) => self
                .domains
                .iter()
                .position(|d| d.name() == name)
                .ok_or_else(|| DesignError::Design(format!("unknown analysis domain `{name}`")))?,
        };

        if !(self.n0.is_finite() && self.n0 >= 0.0) {
            return Err(DesignError::Parameter {
                name: "n0",
                value: self.n0,
                expected: ">= 0",
            });
        }

        let population = StratifiedPatients::new(
            self.strata.iter().map(|s| s.name.clone()).collect(),
            self.strata.iter().map(|s| s.prevalence).collect(),
            self.accrual_rate,
            self.dropout_rate,
        )?
        .with_noise_sd(self.noise_sd)?;

        if let Some(domain) = domains.iter().find(|d| d.strata() != self.strata.len()) {
            return Err(DesignError::Design(format!(
                "domain `{}` has {} stratum effects but {} strata are declared",
                domain.name(),
                domain.strata(),
                self.strata.len()
            )));
        }

        Ok(BuiltDesign {
            domains,
            analysis,
            population,
        })
    }
}

impl Default for TrialDesign {
    /// Antihistamine domain over five symptom strata.
    fn default() -> Self {
        let strata = [
            ("Brain Fog", 0.20),
            ("PEM", 0.25),
            ("Dyspnea", 0.15),
            ("Fatigue", 0.30),
            ("Headache", 0.10),
        ]
        .into_iter()
        .map(|(name, prevalence)| StratumConfig {
            name: name.into(),
            prevalence,
        })
        .collect();
        let arm = |name: &str, effects: [f64; 5]| ArmConfig {
            name: name.into(),
            effects: effects.to_vec(),
        };
        Self {
            version: default_version(),
            accrual_rate: default_accrual_rate(),
            dropout_rate: default_dropout_rate(),
            noise_sd: default_noise_sd(),
            n0: default_n0(),
            analysis_domain: None,
            strata,
            domains: vec![DomainConfig::Standard {
                name: "Antihistamine".into(),
                arms: vec![
                    arm("Cetirizine", [0.0; 5]),
                    arm("Loratidine", [-0.5; 5]),
                    arm("+Famotidine (C)", [0.0, 0.0, 0.0, -0.5, -0.5]),
                    arm("+Famotidine (L)", [-0.5, -0.5, -0.5, 0.0, 0.0]),
                ],
                allocation: Some(vec![2.0, 1.0, 1.0, 1.0, 1.0]),
            }],
        }
    }
}

const fn default_version() -> u32 {
    1
}

const fn default_accrual_rate() -> f64 {
    20.0
}

const fn default_dropout_rate() -> f64 {
    1e-8
}

const fn default_noise_sd() -> f64 {
    1.0
}

const fn default_n0() -> f64 {
    1.0
}
