use thiserror::Error;

/// Invalid trial design: raised at construction, before any replicate runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DesignError {
    /// A domain was declared without active arms.
    #[error("domain `{domain}` needs at least one active arm")]
    NoArms {
        /// Domain name.
        domain: String,
    },
    /// Arms disagree on the number of strata.
    #[error("arm `{arm}` has {found} stratum effects, expected {expected}")]
    StrataMismatch {
        /// Offending arm.
        arm: String,
        /// Stratum count of the first arm.
        expected: usize,
        /// Stratum count of the offending arm.
        found: usize,
    },
    /// Explicit allocation does not cover control plus every arm.
    #[error("allocation for `{domain}` has {found} entries, expected {expected} (arms + control)")]
    AllocationLength {
        /// Domain name.
        domain: String,
        /// Arm count including control.
        expected: usize,
        /// Supplied length.
        found: usize,
    },
    /// Allocation entry negative or not finite.
    #[error("allocation for `{domain}` has invalid entry {value} at position {index}")]
    AllocationEntry {
        /// Domain name.
        domain: String,
        /// Position in the vector.
        index: usize,
        /// Offending value.
        value: f64,
    },
    /// Allocation entries sum to zero.
    #[error("allocation for `{domain}` sums to zero")]
    AllocationZero {
        /// Domain name.
        domain: String,
    },
    /// Prevalence vector malformed.
    #[error("invalid prevalence: {0}")]
    Prevalence(String),
    /// Scalar parameter out of range.
    #[error("parameter `{name}` = {value} is out of range ({expected})")]
    Parameter {
        /// Parameter name.
        name: &'static str,
        /// Supplied value.
        value: f64,
        /// Accepted range.
        expected: &'static str,
    },
    /// Patient-level inputs disagree in length or reference unknown arms/strata.
    #[error("invalid patient data: {0}")]
    PatientData(String),
    /// Design document references an unknown domain or is otherwise inconsistent.
    #[error("invalid design: {0}")]
    Design(String),
}

/// Failure while fitting an estimator to one replicate's data.
#[derive(Debug, Error)]
pub enum FitError {
    /// A (drug, stratum) cell cannot be estimated from the completers.
    #[error("not enough data for drug {drug} in stratum {stratum}: {reason}")]
    InsufficientData {
        /// 1-based drug index.
        drug: usize,
        /// Stratum index.
        stratum: usize,
        /// What was missing.
        reason: String,
    },
    /// No stratum carries both treatment and control data for a drug.
    #[error("drug {drug} has no stratum with estimable treatment and control data")]
    NoInformation {
        /// 1-based drug index.
        drug: usize,
    },
    /// The external modelling toolchain failed.
    #[error("model toolchain failed: {0}")]
    Toolchain(String),
    /// Model output lacked an expected parameter.
    #[error("model output is missing parameter `{0}`")]
    MissingParameter(String),
    /// Scratch files could not be written or read.
    #[error("model io error: {0}")]
    Io(#[from] std::io::Error),
    /// Payload serialization failed.
    #[error("model payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Failure inside a single replicate.
#[derive(Debug, Error)]
pub enum ReplicateError {
    /// Randomization or effect lookup rejected its inputs.
    #[error(transparent)]
    Design(#[from] DesignError),
    /// An estimator failed.
    #[error("estimator `{estimator}` failed: {source}")]
    Fit {
        /// Estimator label.
        estimator: String,
        /// Underlying failure.
        #[source]
        source: FitError,
    },
}

/// Batch-level failure.
#[derive(Debug, Error)]
pub enum TrialError {
    /// Design rejected before the batch started.
    #[error(transparent)]
    Design(#[from] DesignError),
    /// A replicate failed; the batch was aborted.
    #[error("replicate {index} (seed {seed}) failed: {source}")]
    Replicate {
        /// Replicate index.
        index: usize,
        /// Seed that reproduces the failure.
        seed: u64,
        /// Underlying failure.
        #[source]
        source: ReplicateError,
    },
    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),
    /// Results could not be written.
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrialError {
    /// Seed of the failing replicate, when the failure came from one.
    #[must_use]
    pub const fn seed(&self) -> Option<u64> {
        match self {
            Self::Replicate { seed, .. } => Some(*seed),
            _ => None,
        }
    }
}
