//! Published contracts between the runner and its callers.
//!
//! A run is described by a [`RunInput`]: which plan, which test case, how
//! many instances split into which groups, and per-run configuration
//! overrides. These types are deserialisable so the CLI can read a run
//! composition from a JSON file.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A compiled test plan: a name plus its ordered list of test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub name: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// A named unit of work within a plan, selected by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
}

/// A homogeneous subset of a run's instances sharing parameters and
/// artefact.
///
/// `instances` is signed so that a non-positive count can be received and
/// rejected by validation rather than failing at the serde boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub instances: i64,
    /// Image reference of the compiled test artefact.
    pub artifact_path: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Everything needed to execute one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInput {
    pub test_plan: TestPlan,
    /// Index into the plan's test-case list. Signed: out-of-range values,
    /// including negatives, are rejected with `InvalidInput`.
    pub seq: i64,
    #[serde(default)]
    pub run_id: String,
    pub total_instances: i64,
    pub groups: Vec<Group>,
    #[serde(default)]
    pub runner_config: RunnerConfigPatch,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub run_id: String,
}

/// Per-run configuration overrides.
///
/// Merged over the runner defaults with override semantics: a field set
/// here replaces the default, an absent field keeps it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfigPatch {
    /// Retain test containers even after they exit.
    pub keep_containers: Option<bool>,
    /// Log level exported to the test containers.
    pub log_level: Option<String>,
    /// Create the containers without starting them.
    pub unstarted: Option<bool>,
    /// Do not tail container output.
    pub background: Option<bool>,
}

/// Outcome of a single healthcheck item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthcheckStatus {
    /// The object is present and healthy.
    Ok,
    /// The object is missing or in the wrong state.
    Failed,
    /// The check itself errored.
    Aborted,
    /// The fix was skipped because a dependency is unavailable.
    Omitted,
}

impl fmt::Display for HealthcheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthcheckStatus::Ok => "OK",
            HealthcheckStatus::Failed => "Failed",
            HealthcheckStatus::Aborted => "Aborted",
            HealthcheckStatus::Omitted => "Omitted",
        };
        f.write_str(s)
    }
}

/// One line of a healthcheck report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckItem {
    pub name: String,
    pub status: HealthcheckStatus,
    pub message: String,
}

impl HealthcheckItem {
    pub fn new(
        name: impl Into<String>,
        status: HealthcheckStatus,
        message: impl Into<String>,
    ) -> Self {
        HealthcheckItem {
            name: name.into(),
            status,
            message: message.into(),
        }
    }
}

/// The ordered outcome of a healthcheck, plus fix attempts when repair was
/// requested.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckReport {
    pub checks: Vec<HealthcheckItem>,
    pub fixes: Vec<HealthcheckItem>,
}

impl HealthcheckReport {
    /// Whether every check passed.
    pub fn all_ok(&self) -> bool {
        self.checks
            .iter()
            .all(|c| c.status == HealthcheckStatus::Ok)
    }
}
