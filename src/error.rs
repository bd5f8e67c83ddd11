//! Error types for the automation engine.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    #[error("Task runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced to callers of the scheduling and execution API.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    /// Bad cron string, missing required field, or out-of-range setting.
    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Automation {id} not found")]
    NotFound { id: Uuid },

    #[error("Run {id} not found")]
    RunNotFound { id: Uuid },
}

impl AutomationError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failures raised by a task runner. These are recorded on the run record,
/// never propagated past the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn task runner: {0}")]
    Spawn(String),

    #[error("Invalid task runner output: {0}")]
    InvalidOutput(String),

    #[error("Task runner IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
