//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Scheduler and service configuration.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Port for the HTTP control surface.
    pub port: u16,
    /// Global ceiling on concurrently executing automations.
    pub max_concurrent: usize,
    /// Maximum number of manual triggers waiting for a slot.
    pub max_queue_len: usize,
    /// How long a cancelled run may take to acknowledge before its slot is freed anyway.
    pub cancel_grace: Duration,
    /// Default number of run records returned by history queries.
    pub history_limit: usize,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/ai-automations.db"),
            port: 8090,
            max_concurrent: 3,
            max_queue_len: 32,
            cancel_grace: Duration::from_secs(10),
            history_limit: 50,
        }
    }
}

impl AutomationConfig {
    /// Load from process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrent = parse_or(&lookup, "AUTOMATION_MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AUTOMATION_MAX_CONCURRENT".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            db_path: lookup("AI_AUTOMATIONS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: parse_or(&lookup, "AI_AUTOMATIONS_PORT", defaults.port)?,
            max_concurrent,
            max_queue_len: parse_or(&lookup, "AUTOMATION_MAX_QUEUE", defaults.max_queue_len)?,
            cancel_grace: Duration::from_secs(parse_or(
                &lookup,
                "AUTOMATION_CANCEL_GRACE_SECS",
                defaults.cancel_grace.as_secs(),
            )?),
            history_limit: parse_or(&lookup, "AUTOMATION_HISTORY_LIMIT", defaults.history_limit)?,
        })
    }
}

/// LLM backend the browser-automation script drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Gemini,
    OpenRouter,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "gemini",
            LlmProvider::OpenRouter => "openrouter",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" => Ok(LlmProvider::Gemini),
            "openrouter" => Ok(LlmProvider::OpenRouter),
            other => Err(format!("unsupported provider: {other}")),
        }
    }
}

/// Configuration for the script-backed task runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Python interpreter used to launch the automation script.
    pub python: PathBuf,
    /// Browser-automation script path.
    pub script: PathBuf,
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: SecretString,
    /// Hard limit for a single run (None = unlimited).
    pub run_timeout: Option<Duration>,
}

impl RunnerConfig {
    /// Load from process environment. Returns `Ok(None)` when no script is configured.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(script) = lookup("AUTOMATION_SCRIPT") else {
            return Ok(None);
        };

        let provider = lookup("AUTOMATION_LLM_PROVIDER")
            .unwrap_or_else(|| "gemini".to_string())
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                key: "AUTOMATION_LLM_PROVIDER".into(),
                message,
            })?;

        let api_key = lookup("AUTOMATION_LLM_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTOMATION_LLM_API_KEY".into()))?;

        let run_timeout = match lookup("AUTOMATION_RUN_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value(
                "AUTOMATION_RUN_TIMEOUT_SECS",
                &raw,
            )?)),
            None => None,
        };

        Ok(Some(Self {
            python: lookup("AUTOMATION_PYTHON")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("python3")),
            script: PathBuf::from(script),
            provider,
            model: lookup("AUTOMATION_LLM_MODEL").unwrap_or_else(|| "gemini-2.5-flash".to_string()),
            api_key: SecretString::from(api_key),
            run_timeout,
        }))
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{raw}'"),
    })
}
