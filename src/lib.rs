//! AI Automations: cron-triggered browser automations with a bounded run queue.

pub mod automation;
pub mod config;
pub mod error;
pub mod store;
