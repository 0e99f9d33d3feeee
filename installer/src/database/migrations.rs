// Migration driver
//
// Drives the external migrator through the command gateway in its two modes:
// - plan:  `migrate/new --interactive=0 1000` (lists up to 1000 outstanding migrations)
// - apply: `migrate/up --interactive=0`
//
// Migration semantics stay inside the migrator; this only reads its verdict.

use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::database::migration_output::{classify_apply, classify_plan, MigrationFact};
use crate::installation::CommandGateway;

/// Upper bound on candidate migrations requested in plan mode.
pub const PLAN_CANDIDATE_LIMIT: u32 = 1000;

/// Outcome of a plan-mode probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum MigrationState {
    InSync,
    Pending { count: u32 },
    /// Plan output did not carry the expected phrase.
    Unknown,
}

impl MigrationState {
    fn from_fact(fact: MigrationFact) -> Self {
        match fact {
            MigrationFact::PendingCount { count: 0 } => MigrationState::InSync,
            MigrationFact::PendingCount { count } => MigrationState::Pending { count },
            MigrationFact::Applied { .. } | MigrationFact::Unrecognized => MigrationState::Unknown,
        }
    }
}

pub fn plan_args() -> Vec<String> {
    vec![
        "migrate/new".to_string(),
        "--interactive=0".to_string(),
        PLAN_CANDIDATE_LIMIT.to_string(),
    ]
}

pub fn apply_args() -> Vec<String> {
    vec!["migrate/up".to_string(), "--interactive=0".to_string()]
}

pub struct MigrationDriver {
    gateway: Arc<dyn CommandGateway>,
}

impl MigrationDriver {
    pub fn new(gateway: Arc<dyn CommandGateway>) -> Self {
        Self { gateway }
    }

    /// Ask the migrator how many migrations are outstanding. Side-effect free.
    pub async fn probe(&self) -> Result<MigrationState> {
        let output = self.gateway.invoke(&plan_args(), "migrate_plan").await?;
        let state = MigrationState::from_fact(classify_plan(&output.stdout));

        match state {
            MigrationState::Unknown => warn!(
                "[PHASE: database] [STEP: migrate_plan] Plan output not recognised (exit_code={:?}, stdout_len={}, stderr_len={})",
                output.exit_code,
                output.stdout.len(),
                output.stderr.len()
            ),
            _ => info!(
                "[PHASE: database] [STEP: migrate_plan] Migration state probed (state={:?}, duration_ms={})",
                state, output.duration_ms
            ),
        }
        Ok(state)
    }

    /// Apply every outstanding migration. True only when the migrator reports success.
    pub async fn apply(&self) -> Result<bool> {
        let output = self.gateway.invoke(&apply_args(), "migrate_apply").await?;
        let success = matches!(
            classify_apply(&output.stdout),
            MigrationFact::Applied { success: true }
        );

        if success {
            info!(
                "[PHASE: database] [STEP: migrate_apply] Migrations applied (duration_ms={})",
                output.duration_ms
            );
        } else {
            warn!(
                "[PHASE: database] [STEP: migrate_apply] Migrator did not report success (exit_code={:?}, stderr={})",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(success)
    }
}
