//! Unified `Database` trait: single async interface for automation persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::automation::model::{AutomationDefinition, AutomationStatus, RunRecord, RunStatus};
use crate::error::DatabaseError;

/// Backend-agnostic database trait covering automation definitions and run history.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Automations ─────────────────────────────────────────────────

    /// Insert a new automation definition.
    async fn create_automation(&self, automation: &AutomationDefinition)
    -> Result<(), DatabaseError>;

    /// Get an automation by ID.
    async fn get_automation(&self, id: Uuid) -> Result<Option<AutomationDefinition>, DatabaseError>;

    /// All automations, ordered by name.
    async fn list_automations(&self) -> Result<Vec<AutomationDefinition>, DatabaseError>;

    /// Update the user-editable fields of an automation.
    async fn update_automation(&self, automation: &AutomationDefinition)
    -> Result<(), DatabaseError>;

    /// Delete an automation. Returns false if it did not exist.
    async fn delete_automation(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Set the `last_status` column only.
    async fn set_automation_status(
        &self,
        id: Uuid,
        status: AutomationStatus,
    ) -> Result<(), DatabaseError>;

    /// Record the end of a run on the definition (`last_status` + `last_run`).
    async fn record_automation_run(
        &self,
        id: Uuid,
        status: AutomationStatus,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Move every definition stuck in `from` to `to`. Returns the number changed.
    async fn reset_automation_statuses(
        &self,
        from: AutomationStatus,
        to: AutomationStatus,
    ) -> Result<usize, DatabaseError>;

    // ── Run history ─────────────────────────────────────────────────

    /// Insert a new run record.
    async fn create_run(&self, run: &RunRecord) -> Result<(), DatabaseError>;

    /// Move a run from `running` to a terminal status.
    ///
    /// Returns false without touching the row if the run is not `running`
    /// (already terminal, or unknown).
    async fn complete_run(
        &self,
        id: Uuid,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        result: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Get a run by ID.
    async fn get_run(&self, id: Uuid) -> Result<Option<RunRecord>, DatabaseError>;

    /// Runs for one automation, newest first.
    async fn list_runs(
        &self,
        automation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RunRecord>, DatabaseError>;

    /// Attach analysis text to a run. Returns false if the run does not exist.
    async fn set_run_analysis(&self, id: Uuid, analysis: &str) -> Result<bool, DatabaseError>;

    /// Fail every run still marked `running`. Returns the number of runs changed.
    async fn fail_running_runs(
        &self,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;
}
