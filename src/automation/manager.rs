//! Keeps the cron registry in line with the stored definitions.

use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::coordinator::{ExecutionCoordinator, TriggerOutcome};
use super::cron::{CronRegistry, FireCallback, ScheduleOutcome};
use super::model::TriggerSource;
use crate::error::{AutomationError, Result};

/// A definition whose cron expression was rejected during a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidSchedule {
    pub automation_id: Uuid,
    pub reason: String,
}

/// Outcome of [`ScheduleManager::load_schedules`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub scheduled: Vec<Uuid>,
    pub invalid: Vec<InvalidSchedule>,
}

pub struct ScheduleManager {
    coordinator: Arc<ExecutionCoordinator>,
    cron: CronRegistry,
}

impl ScheduleManager {
    pub fn new(coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self {
            coordinator,
            cron: CronRegistry::new(),
        }
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    /// Timer callback: a scheduled trigger for whatever id fired.
    fn on_fire(&self) -> FireCallback {
        let coordinator = Arc::clone(&self.coordinator);
        Arc::new(move |automation_id| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                if let Err(e) = coordinator
                    .trigger(automation_id, TriggerSource::Scheduled)
                    .await
                {
                    warn!(automation = %automation_id, error = %e, "Scheduled trigger failed");
                }
            }
            .boxed()
        })
    }

    /// Rebuild every timer from the store. A bad expression only affects its
    /// own automation.
    pub async fn load_schedules(&self) -> Result<LoadReport> {
        let definitions = self.coordinator.database().list_automations().await?;
        self.cron.stop_all();

        let mut report = LoadReport::default();
        for definition in &definitions {
            let Some(expr) = definition.active_schedule() else {
                continue;
            };
            match self.cron.schedule(definition.id, expr, self.on_fire()) {
                ScheduleOutcome::Scheduled => report.scheduled.push(definition.id),
                ScheduleOutcome::Invalid { reason } => report.invalid.push(InvalidSchedule {
                    automation_id: definition.id,
                    reason,
                }),
            }
        }

        info!(
            definitions = definitions.len(),
            scheduled = report.scheduled.len(),
            invalid = report.invalid.len(),
            "Schedules loaded"
        );
        Ok(report)
    }

    /// Put one automation on a timer, replacing any previous one.
    pub async fn schedule_task(&self, automation_id: Uuid, expr: &str) -> Result<()> {
        if self
            .coordinator
            .database()
            .get_automation(automation_id)
            .await?
            .is_none()
        {
            return Err(AutomationError::NotFound { id: automation_id }.into());
        }

        match self.cron.schedule(automation_id, expr, self.on_fire()) {
            ScheduleOutcome::Scheduled => Ok(()),
            ScheduleOutcome::Invalid { reason } => {
                Err(AutomationError::validation("cron_expression", reason).into())
            }
        }
    }

    pub fn unschedule_task(&self, automation_id: Uuid) -> bool {
        self.cron.unschedule(automation_id)
    }

    pub fn is_scheduled(&self, automation_id: Uuid) -> bool {
        self.cron.is_scheduled(automation_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.cron.scheduled_ids().len()
    }

    pub async fn run_now(&self, automation_id: Uuid) -> Result<TriggerOutcome> {
        self.coordinator
            .trigger(automation_id, TriggerSource::Manual)
            .await
    }

    /// Trigger every definition flagged to run at startup. Returns the ids
    /// that were started or queued.
    pub async fn run_startup_automations(&self) -> Result<Vec<Uuid>> {
        let definitions = self.coordinator.database().list_automations().await?;
        let mut triggered = Vec::new();

        for definition in definitions.iter().filter(|d| d.run_on_startup) {
            match self.run_now(definition.id).await {
                Ok(TriggerOutcome::Started { .. }) | Ok(TriggerOutcome::Queued { .. }) => {
                    triggered.push(definition.id);
                }
                Ok(TriggerOutcome::Rejected(reason)) | Ok(TriggerOutcome::Skipped(reason)) => {
                    warn!(automation = %definition.id, %reason, "Startup run not started");
                }
                Ok(TriggerOutcome::Disabled) => {
                    warn!(automation = %definition.id, "Startup run skipped: automation disabled");
                }
                Err(e) => {
                    error!(automation = %definition.id, error = %e, "Startup run failed to trigger");
                }
            }
        }

        if !triggered.is_empty() {
            info!(count = triggered.len(), "Startup automations triggered");
        }
        Ok(triggered)
    }

    /// Stop every timer. Runs already in flight are left alone.
    pub fn shutdown(&self) {
        self.cron.stop_all();
    }
}
