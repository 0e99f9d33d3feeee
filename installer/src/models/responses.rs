// Orchestration reports
//
// Serialized as camelCase JSON for `--json` output and for any UI sitting on top of the runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    /// `skip()` held for this task.
    Skipped,
    /// `run()` reported success and `test()` confirmed it.
    Completed,
    /// `run()` or the follow-up `test()` reported failure.
    Failed,
    /// The operator declined the verification prompt.
    Declined,
    /// Submitted input failed validation.
    InputRejected,
    /// A configuration error stopped the task.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PassOutcome {
    Complete,
    Failed,
    Declined,
    InputRejected,
    ConfigurationError,
}

impl PassOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            PassOutcome::Complete => 0,
            PassOutcome::Failed | PassOutcome::Declined | PassOutcome::InputRejected => 1,
            PassOutcome::ConfigurationError => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub task_id: String,
    pub title: String,
    pub status: StepStatus,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub field_errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub outcome: PassOutcome,
    /// True when a task with `skip_complete` short-circuited the pass.
    pub halted_early: bool,
    #[serde(default)]
    pub steps: Vec<StepReport>,
}

impl PassReport {
    pub fn step(&self, task_id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.task_id == task_id)
    }
}

/// Read-only view of one task, produced without mutating anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub task_id: String,
    pub title: String,
    pub skip: bool,
    pub skip_complete: bool,
    pub in_desired_state: bool,
    pub needs_input: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
