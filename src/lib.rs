//! Testground local Docker runner.
//!
//! Launches distributed test plans as fleets of local Docker containers:
//! a long-lived control network carries rendezvous traffic to the sync
//! service, a per-run data network carries instance-to-instance traffic,
//! and every instance's output lands in a deterministic directory tree.

pub mod api;
pub mod docker;
pub mod error;
pub mod runner;
pub mod runtime;

pub use api::{
    Group, HealthcheckItem, HealthcheckReport, HealthcheckStatus, RunInput, RunOutput,
    RunnerConfigPatch, TestCase, TestPlan,
};
pub use error::RunnerError;
pub use runner::{LocalDockerRunner, RunnerConfig, COMPATIBLE_BUILDERS, RUNNER_ID};
