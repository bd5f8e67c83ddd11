//! Task runner seam and the script-backed browser runner.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::CANCELLED_ERROR;
use crate::config::RunnerConfig;
use crate::error::RunnerError;

/// Error recorded when a run exceeds the configured time limit.
pub const TIMEOUT_ERROR: &str = "timeout";

/// Maximum stdout/stderr captured per run.
const MAX_OUTPUT_SIZE: usize = 256 * 1024;

/// How long to wait for output pipes to drain after the process exits.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the runner is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub task_description: String,
    pub profile_reference: Option<String>,
    pub headless: bool,
}

/// What the runner reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { output: Value },
    Failed { error: String },
}

/// Executes a single automation run out of process.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn execute(&self, run_id: Uuid, request: TaskRequest)
    -> Result<TaskOutcome, RunnerError>;

    /// Best-effort cancellation. Returns true if the runner acknowledged it.
    async fn cancel(&self, run_id: Uuid) -> bool;
}

/// Runner used when no automation script is configured. Every run fails.
pub struct UnavailableRunner {
    reason: String,
}

impl UnavailableRunner {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TaskRunner for UnavailableRunner {
    async fn execute(&self, _run_id: Uuid, _request: TaskRequest) -> Result<TaskOutcome, RunnerError> {
        Err(RunnerError::Spawn(self.reason.clone()))
    }

    async fn cancel(&self, _run_id: Uuid) -> bool {
        true
    }
}

/// Last line the script prints.
#[derive(Debug, Deserialize)]
struct ScriptResult {
    success: bool,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

enum ProcessExit {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Launches the browser-automation script as `<python> <script> <config-json>`.
pub struct ScriptTaskRunner {
    config: RunnerConfig,
    kill_switches: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl ScriptTaskRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            kill_switches: Mutex::new(HashMap::new()),
        }
    }

    fn switches(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<()>>> {
        self.kill_switches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn script_config(&self, request: &TaskRequest) -> Value {
        json!({
            "task": request.task_description,
            "headless": request.headless,
            "chrome_profile_path": request.profile_reference,
            "llm": {
                "provider": self.config.provider.as_str(),
                "model": self.config.model,
                "api_key": self.config.api_key.expose_secret(),
            },
        })
    }
}

#[async_trait]
impl TaskRunner for ScriptTaskRunner {
    async fn execute(
        &self,
        run_id: Uuid,
        request: TaskRequest,
    ) -> Result<TaskOutcome, RunnerError> {
        let mut child = Command::new(&self.config.python)
            .arg(&self.config.script)
            .arg(self.script_config(&request).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RunnerError::Spawn(format!(
                    "{} {}: {e}",
                    self.config.python.display(),
                    self.config.script.display()
                ))
            })?;

        info!(run_id = %run_id, pid = child.id(), "Automation script started");

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.switches().insert(run_id, kill_tx);

        let deadline = self.config.run_timeout;
        let exit = tokio::select! {
            status = child.wait() => ProcessExit::Exited(status),
            _ = &mut kill_rx => ProcessExit::Cancelled,
            _ = sleep_or_forever(deadline) => ProcessExit::TimedOut,
        };
        self.switches().remove(&run_id);

        let status = match exit {
            ProcessExit::Exited(status) => status?,
            ProcessExit::Cancelled => {
                return Ok(kill_child(run_id, &mut child, [stdout, stderr], CANCELLED_ERROR).await);
            }
            ProcessExit::TimedOut => {
                return Ok(kill_child(run_id, &mut child, [stdout, stderr], TIMEOUT_ERROR).await);
            }
        };

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;
        debug!(run_id = %run_id, code = status.code(), "Automation script exited");

        match parse_output(&stdout) {
            Some(result) => Ok(interpret(result)),
            None if !status.success() => {
                let detail = stderr.trim();
                let error = if detail.is_empty() {
                    format!("script exited with code {}", status.code().unwrap_or(-1))
                } else {
                    last_lines(detail, 5)
                };
                Ok(TaskOutcome::Failed { error })
            }
            None => Err(RunnerError::InvalidOutput(
                "script printed no JSON result".to_string(),
            )),
        }
    }

    async fn cancel(&self, run_id: Uuid) -> bool {
        match self.switches().remove(&run_id) {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }
}

async fn kill_child(
    run_id: Uuid,
    child: &mut Child,
    readers: [JoinHandle<String>; 2],
    error: &str,
) -> TaskOutcome {
    if let Err(e) = child.kill().await {
        warn!(run_id = %run_id, error = %e, "Failed to kill automation script");
    }
    for reader in readers {
        reader.abort();
    }
    debug!(run_id = %run_id, error, "Automation script killed");
    TaskOutcome::Failed {
        error: error.to_string(),
    }
}

async fn sleep_or_forever(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else {
            return String::new();
        };
        let mut buf = Vec::new();
        let _ = pipe.take(MAX_OUTPUT_SIZE as u64).read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(reader: JoinHandle<String>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A child process (the browser) may still hold the pipe open.
            warn!("Timed out draining automation script output");
            String::new()
        }
    }
}

/// Find the last stdout line that is a script result.
fn parse_output(stdout: &str) -> Option<ScriptResult> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

fn interpret(result: ScriptResult) -> TaskOutcome {
    if result.success {
        TaskOutcome::Completed {
            output: result.output.unwrap_or(Value::Null),
        }
    } else {
        TaskOutcome::Failed {
            error: result
                .error
                .unwrap_or_else(|| "automation reported failure".to_string()),
        }
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
