//! Request/response facade used by the HTTP routes and the desktop shell.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::coordinator::{ExecutionCoordinator, RunOverrides, StopOutcome, TriggerOutcome};
use super::cron;
use super::gate::{GateStatus, RejectReason};
use super::manager::{LoadReport, ScheduleManager};
use super::model::{AutomationDefinition, RunRecord, RunStatus, TriggerSource};
use crate::error::{AutomationError, Result};

/// Per-run settings sent with an execute request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteConfig {
    #[serde(default)]
    pub headless: Option<bool>,
    #[serde(default)]
    pub profile_reference: Option<String>,
}

/// Editable fields of an automation, used for both create and update.
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationInput {
    pub name: String,
    pub task_description: String,
    #[serde(default)]
    pub profile_reference: Option<String>,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub run_on_startup: bool,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AutomationInput {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AutomationError::validation("name", "must not be empty").into());
        }
        if self.task_description.trim().is_empty() {
            return Err(AutomationError::validation("task_description", "must not be empty").into());
        }
        if let Some(expr) = self.cron_expression.as_deref().filter(|e| !e.trim().is_empty()) {
            cron::parse(expr).map_err(|reason| AutomationError::validation("cron_expression", reason))?;
        }
        Ok(())
    }

    fn apply(self, definition: &mut AutomationDefinition) {
        definition.name = self.name.trim().to_string();
        definition.task_description = self.task_description;
        definition.profile_reference = self.profile_reference.filter(|p| !p.trim().is_empty());
        definition.headless = self.headless;
        definition.run_on_startup = self.run_on_startup;
        definition.cron_expression = self.cron_expression.filter(|e| !e.trim().is_empty());
        definition.enabled = self.enabled;
    }
}

/// Reply to an execute request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
}

impl ExecuteResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            run_id: None,
            output: None,
            error: Some(error.into()),
            queued: None,
        }
    }

    fn from_record(record: RunRecord) -> Self {
        Self {
            success: record.status == RunStatus::Success,
            run_id: Some(record.id),
            output: record.result,
            error: record.error_message,
            queued: None,
        }
    }
}

fn rejection_message(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::AlreadyRunning => "Automation is already running",
        RejectReason::AtCapacity => "Scheduler is at capacity",
        RejectReason::QueueFull => "Execution queue is full",
    }
}

pub struct AutomationControl {
    manager: Arc<ScheduleManager>,
    history_limit: usize,
}

impl AutomationControl {
    pub fn new(manager: Arc<ScheduleManager>, history_limit: usize) -> Self {
        Self {
            manager,
            history_limit,
        }
    }

    fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        self.manager.coordinator()
    }

    pub async fn list_automations(&self) -> Result<Vec<AutomationDefinition>> {
        Ok(self.coordinator().database().list_automations().await?)
    }

    /// Store a new automation and put it on its timer.
    pub async fn create_automation(&self, input: AutomationInput) -> Result<AutomationDefinition> {
        input.validate()?;
        let mut definition = AutomationDefinition::new(String::new(), String::new());
        input.apply(&mut definition);

        self.coordinator().database().create_automation(&definition).await?;
        self.sync_schedule(&definition).await?;
        info!(automation = %definition.id, name = %definition.name, "Automation created");
        Ok(definition)
    }

    /// Replace an automation's editable fields and re-time it. A run already
    /// in flight keeps the definition it started with.
    pub async fn update_automation(
        &self,
        automation_id: Uuid,
        input: AutomationInput,
    ) -> Result<AutomationDefinition> {
        input.validate()?;
        let db = self.coordinator().database();
        let mut definition = db
            .get_automation(automation_id)
            .await?
            .ok_or(AutomationError::NotFound { id: automation_id })?;
        input.apply(&mut definition);
        definition.updated_at = Utc::now();

        db.update_automation(&definition).await?;
        self.sync_schedule(&definition).await?;
        info!(automation = %automation_id, name = %definition.name, "Automation updated");
        Ok(definition)
    }

    /// Remove an automation: its timer, any queued or running trigger, then
    /// the stored definition.
    pub async fn delete_automation(&self, automation_id: Uuid) -> Result<()> {
        let db = self.coordinator().database();
        if db.get_automation(automation_id).await?.is_none() {
            return Err(AutomationError::NotFound { id: automation_id }.into());
        }

        self.manager.unschedule_task(automation_id);
        self.coordinator().stop(automation_id).await?;
        if !db.delete_automation(automation_id).await? {
            return Err(AutomationError::NotFound { id: automation_id }.into());
        }
        info!(automation = %automation_id, "Automation deleted");
        Ok(())
    }

    async fn sync_schedule(&self, definition: &AutomationDefinition) -> Result<()> {
        match definition.active_schedule() {
            Some(expr) => self.manager.schedule_task(definition.id, expr).await,
            None => {
                self.manager.unschedule_task(definition.id);
                Ok(())
            }
        }
    }

    pub fn is_scheduled(&self, automation_id: Uuid) -> bool {
        self.manager.is_scheduled(automation_id)
    }

    /// Run an automation now. Waits for a started run to finish; a queued
    /// run is reported as such and finishes on its own.
    pub async fn execute(&self, automation_id: Uuid, config: ExecuteConfig) -> Result<ExecuteResponse> {
        let overrides = RunOverrides {
            headless: config.headless,
            profile_reference: config.profile_reference,
        };
        let outcome = self
            .coordinator()
            .trigger_with(automation_id, TriggerSource::Manual, overrides)
            .await?;

        Ok(match outcome {
            TriggerOutcome::Started { completion, .. } => match completion.wait().await {
                Some(record) => ExecuteResponse::from_record(record),
                None => ExecuteResponse::failure("Run ended without a result"),
            },
            TriggerOutcome::Queued { .. } => ExecuteResponse {
                success: true,
                run_id: None,
                output: None,
                error: None,
                queued: Some(true),
            },
            TriggerOutcome::Rejected(reason) | TriggerOutcome::Skipped(reason) => {
                ExecuteResponse::failure(rejection_message(reason))
            }
            TriggerOutcome::Disabled => ExecuteResponse::failure("Automation is disabled"),
        })
    }

    pub async fn stop(&self, automation_id: Uuid) -> Result<StopOutcome> {
        self.coordinator().stop(automation_id).await
    }

    pub fn is_running(&self, automation_id: Uuid) -> bool {
        self.coordinator().is_running(automation_id)
    }

    pub fn get_scheduler_status(&self) -> GateStatus {
        self.coordinator().status()
    }

    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<()> {
        self.coordinator().set_max_concurrent(max_concurrent)?;
        info!(max_concurrent, "Max concurrent automations updated");
        Ok(())
    }

    pub async fn reload_schedules(&self) -> Result<LoadReport> {
        self.manager.load_schedules().await
    }

    /// Recent runs for an automation, newest first.
    pub async fn get_history(&self, automation_id: Uuid, limit: Option<usize>) -> Result<Vec<RunRecord>> {
        if self
            .coordinator()
            .database()
            .get_automation(automation_id)
            .await?
            .is_none()
        {
            return Err(AutomationError::NotFound { id: automation_id }.into());
        }
        self.coordinator()
            .history()
            .list(automation_id, limit.unwrap_or(self.history_limit))
            .await
    }
}
