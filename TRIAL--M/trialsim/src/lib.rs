#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Trial simulator – enrolls stratified patient populations into multi-arm
//! platform trials and compares how estimators recover the true effects.

/// Telemetry, seeding and distribution helpers.
#[path = "../helper.rs"]
pub mod helper;

/// Error taxonomy.
#[path = "../errors.rs"]
pub mod errors;

/// Treatment arms and combination arms.
#[path = "../arm.rs"]
pub mod arm;

/// Block randomization.
#[path = "../randomization.rs"]
pub mod randomization;

/// Randomization domains.
#[path = "../domain.rs"]
pub mod domain;

/// Stratified patient populations.
#[path = "../patients.rs"]
pub mod patients;

/// Declarative trial designs.
#[path = "../design.rs"]
pub mod design;

/// Estimators fitted to completed trials.
#[path = "../models/main.rs"]
pub mod models;

/// Per-replicate result rows.
#[path = "../summary.rs"]
pub mod summary;

/// CSV output.
#[path = "../output.rs"]
pub mod output;

/// Single replicate runner.
#[path = "../simulator.rs"]
pub mod simulator;

/// Batch engine & worker pool.
#[path = "../main.rs"]
pub mod runtime;

pub use arm::Arm;
pub use design::{BuiltDesign, TrialDesign};
pub use domain::{Domain, DomainLayout};
pub use errors::{DesignError, FitError, ReplicateError, TrialError};
pub use helper::{TrialTelemetry, TrialTelemetryBuilder};
pub use models::{
    CmdStanConfig, CmdStanEstimator, Estimator, HierarchicalEstimator, LinearEstimator,
};
pub use output::ResultTable;
pub use patients::StratifiedPatients;
pub use runtime::{TrialEngine, TrialEngineBuilder};
