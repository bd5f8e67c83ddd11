//! Durable run history.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{AutomationStatus, INTERRUPTED_ERROR, RunOutcome, RunRecord};
use crate::error::{AutomationError, Result};
use crate::store::Database;

/// What `recover_interrupted` cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub runs_failed: usize,
    pub automations_reset: usize,
}

/// Run record lifecycle on top of the [`Database`].
pub struct RunHistoryStore {
    db: Arc<dyn Database>,
}

impl RunHistoryStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Create a record in `running`. Only call after gate admission.
    pub async fn begin(&self, automation_id: Uuid) -> Result<RunRecord> {
        let run = RunRecord::start(automation_id);
        self.db.create_run(&run).await?;
        debug!(automation = %automation_id, run_id = %run.id, "Run started");
        Ok(run)
    }

    /// Move a run to its terminal state. Returns false if it already was terminal.
    pub async fn complete(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<bool> {
        let (result, error) = match outcome {
            RunOutcome::Success { result } => (result.as_ref(), None),
            RunOutcome::Failed { error } => (None, Some(error.as_str())),
        };
        let changed = self
            .db
            .complete_run(run_id, outcome.run_status(), Utc::now(), result, error)
            .await?;
        if !changed {
            debug!(run_id = %run_id, "Run already terminal, completion ignored");
        }
        Ok(changed)
    }

    /// Runs for an automation, newest first.
    pub async fn list(&self, automation_id: Uuid, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(self.db.list_runs(automation_id, limit).await?)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<RunRecord> {
        self.db
            .get_run(run_id)
            .await?
            .ok_or_else(|| AutomationError::RunNotFound { id: run_id }.into())
    }

    /// Attach analysis text to a finished run.
    pub async fn annotate(&self, run_id: Uuid, analysis: &str) -> Result<()> {
        if self.db.set_run_analysis(run_id, analysis).await? {
            Ok(())
        } else {
            Err(AutomationError::RunNotFound { id: run_id }.into())
        }
    }

    /// Fail runs orphaned by a previous process and unstick their definitions.
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport> {
        let runs_failed = self
            .db
            .fail_running_runs(INTERRUPTED_ERROR, Utc::now())
            .await?;
        let automations_reset = self
            .db
            .reset_automation_statuses(AutomationStatus::Running, AutomationStatus::Failed)
            .await?;

        if runs_failed > 0 || automations_reset > 0 {
            info!(runs_failed, automations_reset, "Recovered interrupted runs");
        }
        Ok(RecoveryReport {
            runs_failed,
            automations_reset,
        })
    }
}
