//! Core types for the automation system.
//!
//! An automation is a persisted browser task plus its trigger policy. Each
//! admitted execution produces exactly one [`RunRecord`] that moves from
//! `running` to a terminal state once.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error message recorded on runs stopped by the user.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Error message recorded on runs orphaned by a previous process.
pub const INTERRUPTED_ERROR: &str = "interrupted";

/// Mirror of the most recent run of an automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for AutomationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AutomationStatus::Idle => "idle",
            AutomationStatus::Running => "running",
            AutomationStatus::Completed => "completed",
            AutomationStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AutomationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AutomationStatus::Idle),
            "running" => Ok(AutomationStatus::Running),
            "completed" => Ok(AutomationStatus::Completed),
            "failed" => Ok(AutomationStatus::Failed),
            other => Err(format!("unknown automation status: {other}")),
        }
    }
}

/// A persisted automation definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDefinition {
    pub id: Uuid,
    pub name: String,
    /// Natural-language instruction handed to the task runner.
    pub task_description: String,
    /// Browser profile the runner should use, if any.
    pub profile_reference: Option<String>,
    pub headless: bool,
    pub run_on_startup: bool,
    /// 5-field cron expression; `None` means manual-only.
    pub cron_expression: Option<String>,
    /// Disabled automations are never put on a cron timer.
    pub enabled: bool,

    // Runtime state (written by the coordinator)
    pub status: AutomationStatus,
    pub last_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationDefinition {
    pub fn new(name: impl Into<String>, task_description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_description: task_description.into(),
            profile_reference: None,
            headless: true,
            run_on_startup: false,
            cron_expression: None,
            enabled: true,
            status: AutomationStatus::Idle,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_cron(mut self, expr: impl Into<String>) -> Self {
        self.cron_expression = Some(expr.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile_reference = Some(profile.into());
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_run_on_startup(mut self, run_on_startup: bool) -> Self {
        self.run_on_startup = run_on_startup;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The cron expression this automation should be timed by, if any.
    pub fn active_schedule(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.cron_expression
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// What caused a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// A cron timer fired.
    Scheduled,
    /// A caller asked for an immediate run.
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Scheduled => write!(f, "scheduled"),
            TriggerSource::Manual => write!(f, "manual"),
        }
    }
}

/// Status of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A single execution attempt of an automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque runner output.
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Free-form analysis attached after the fact.
    pub analysis: Option<String>,
}

impl RunRecord {
    /// A fresh record in the `running` state.
    pub fn start(automation_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error_message: None,
            analysis: None,
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success { result: Option<serde_json::Value> },
    Failed { error: String },
}

impl RunOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        RunOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(CANCELLED_ERROR)
    }

    pub fn run_status(&self) -> RunStatus {
        match self {
            RunOutcome::Success { .. } => RunStatus::Success,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    /// The definition status this outcome leaves behind.
    pub fn automation_status(&self) -> AutomationStatus {
        match self {
            RunOutcome::Success { .. } => AutomationStatus::Completed,
            RunOutcome::Failed { .. } => AutomationStatus::Failed,
        }
    }
}
