//! Automation scheduling and bounded execution.
//!
//! Layout, leaves first: `cron` (timers), `history` (run records), `gate`
//! (admission), `coordinator` (run lifecycle), `manager` (cron wiring), plus
//! the `control` facade and its HTTP `routes`.

pub mod control;
pub mod coordinator;
pub mod cron;
pub mod gate;
pub mod history;
pub mod manager;
pub mod model;
pub mod routes;
pub mod runner;

pub use control::{AutomationControl, AutomationInput, ExecuteConfig, ExecuteResponse};
pub use coordinator::{ExecutionCoordinator, RunOverrides, StopOutcome, TriggerOutcome};
pub use gate::{ConcurrencyGate, GateStatus, RejectReason};
pub use history::RunHistoryStore;
pub use manager::{LoadReport, ScheduleManager};
pub use model::{AutomationDefinition, AutomationStatus, RunOutcome, RunRecord, RunStatus, TriggerSource};
pub use runner::{ScriptTaskRunner, TaskOutcome, TaskRequest, TaskRunner};
