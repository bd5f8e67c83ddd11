//! Execution coordinator: admission, run lifecycle, cancellation.
//!
//! Every admitted trigger becomes one spawned run task. That task is the only
//! place a run is finished: it completes the history record, updates the
//! definition, and releases the gate slot. `stop()` never finishes a run
//! itself; it signals the run task and waits for the release, which carries
//! how the run actually ended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gate::{Admission, ConcurrencyGate, GateStatus, RejectReason};
use super::history::RunHistoryStore;
use super::model::{
    AutomationDefinition, AutomationStatus, CANCELLED_ERROR, RunOutcome, RunRecord, RunStatus,
    TriggerSource,
};
use super::runner::{TaskOutcome, TaskRequest, TaskRunner};
use crate::error::{AutomationError, Result, RunnerError};
use crate::store::Database;

/// Per-run overrides for manual executions.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub headless: Option<bool>,
    pub profile_reference: Option<String>,
}

/// Resolves with the final run record once the run is terminal.
#[derive(Debug)]
pub struct RunCompletion {
    rx: oneshot::Receiver<RunRecord>,
}

impl RunCompletion {
    /// Wait for the run to finish. `None` if it was removed from the queue
    /// before it started, or could not be started.
    pub async fn wait(self) -> Option<RunRecord> {
        self.rx.await.ok()
    }
}

/// Result of a trigger.
#[derive(Debug)]
pub enum TriggerOutcome {
    Started {
        run_id: Uuid,
        completion: RunCompletion,
    },
    /// Waiting for a slot; starts on its own once admitted.
    Queued { completion: RunCompletion },
    /// A scheduled fire that the gate dropped.
    Skipped(RejectReason),
    /// A scheduled fire for a disabled automation; the gate is not consulted.
    Disabled,
    /// A manual trigger that was turned away.
    Rejected(RejectReason),
}

/// Result of [`ExecutionCoordinator::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The run was cancelled, recorded as failed, and its slot released.
    Cancelled,
    /// The trigger was still queued and has been dropped without a record.
    Dequeued,
    /// The run had already finished on its own before the cancellation
    /// reached it; carries the status that was recorded.
    Finished(RunStatus),
    NotRunning,
}

struct ActiveRun {
    cancel: CancellationToken,
    /// `None` until the slot is released.
    finished: watch::Sender<Option<StopOutcome>>,
}

impl ActiveRun {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            finished: watch::channel(None).0,
        }
    }
}

enum RunnerStep {
    Finished(std::result::Result<std::result::Result<TaskOutcome, RunnerError>, JoinError>),
    Cancelled,
}

/// Turns triggers into runs, bounded by the [`ConcurrencyGate`].
pub struct ExecutionCoordinator {
    db: Arc<dyn Database>,
    history: Arc<RunHistoryStore>,
    gate: Arc<ConcurrencyGate>,
    runner: Arc<dyn TaskRunner>,
    cancel_grace: Duration,
    /// Cancellation bookkeeping; slot release happens under this lock too.
    active: Mutex<HashMap<Uuid, ActiveRun>>,
}

impl ExecutionCoordinator {
    pub fn new(
        db: Arc<dyn Database>,
        history: Arc<RunHistoryStore>,
        gate: Arc<ConcurrencyGate>,
        runner: Arc<dyn TaskRunner>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            db,
            history,
            gate,
            runner,
            cancel_grace,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn history(&self) -> &Arc<RunHistoryStore> {
        &self.history
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn trigger(
        self: &Arc<Self>,
        automation_id: Uuid,
        source: TriggerSource,
    ) -> Result<TriggerOutcome> {
        self.trigger_with(automation_id, source, RunOverrides::default())
            .await
    }

    /// Trigger a run, applying per-run overrides to the definition.
    pub async fn trigger_with(
        self: &Arc<Self>,
        automation_id: Uuid,
        source: TriggerSource,
        overrides: RunOverrides,
    ) -> Result<TriggerOutcome> {
        let definition = self
            .db
            .get_automation(automation_id)
            .await?
            .ok_or(AutomationError::NotFound { id: automation_id })?;

        if source == TriggerSource::Scheduled && !definition.enabled {
            info!(automation = %automation_id, "skipped: disabled");
            return Ok(TriggerOutcome::Disabled);
        }

        match self.gate.try_acquire(automation_id, source) {
            Admission::Rejected(reason) => match source {
                TriggerSource::Scheduled => {
                    info!(automation = %automation_id, name = %definition.name, "skipped: {reason}");
                    Ok(TriggerOutcome::Skipped(reason))
                }
                TriggerSource::Manual => {
                    info!(automation = %automation_id, %reason, "Manual trigger rejected");
                    Ok(TriggerOutcome::Rejected(reason))
                }
            },
            Admission::Admitted => {
                let (tx, rx) = oneshot::channel();
                let run_id = self.start_run(definition, overrides, tx).await?;
                Ok(TriggerOutcome::Started {
                    run_id,
                    completion: RunCompletion { rx },
                })
            }
            Admission::Queued(ticket) => {
                info!(automation = %automation_id, "Queued until a slot frees up");
                let (tx, rx) = oneshot::channel();
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if !ticket.admitted().await {
                        debug!(automation = %automation_id, "Queued trigger dropped before start");
                        return;
                    }
                    // The definition may have changed while it waited.
                    let definition = match this.db.get_automation(automation_id).await {
                        Ok(Some(definition)) => definition,
                        Ok(None) => {
                            warn!(automation = %automation_id, "Automation deleted while queued");
                            this.release_slot(automation_id, StopOutcome::NotRunning);
                            return;
                        }
                        Err(e) => {
                            error!(automation = %automation_id, error = %e, "Failed to load queued automation");
                            this.release_slot(automation_id, StopOutcome::NotRunning);
                            return;
                        }
                    };
                    if let Err(e) = this.start_run(definition, overrides, tx).await {
                        error!(automation = %automation_id, error = %e, "Failed to start queued run");
                    }
                });
                Ok(TriggerOutcome::Queued {
                    completion: RunCompletion { rx },
                })
            }
        }
    }

    /// Begin history and hand the run to its own task. The gate slot must
    /// already be held; it is released here if the run cannot start.
    async fn start_run(
        self: &Arc<Self>,
        definition: AutomationDefinition,
        overrides: RunOverrides,
        completion: oneshot::Sender<RunRecord>,
    ) -> Result<Uuid> {
        let automation_id = definition.id;
        let run = match self.history.begin(automation_id).await {
            Ok(run) => run,
            Err(e) => {
                self.release_slot(automation_id, StopOutcome::NotRunning);
                return Err(e);
            }
        };

        if let Err(e) = self
            .db
            .set_automation_status(automation_id, AutomationStatus::Running)
            .await
        {
            warn!(automation = %automation_id, error = %e, "Failed to mark automation running");
        }

        let cancel = self.active().entry(automation_id).or_insert_with(ActiveRun::new).cancel.clone();
        let request = TaskRequest {
            task_description: definition.task_description,
            profile_reference: overrides.profile_reference.or(definition.profile_reference),
            headless: overrides.headless.unwrap_or(definition.headless),
        };

        info!(automation = %automation_id, run_id = %run.id, name = %definition.name, "Run started");

        let run_id = run.id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = if cancel.is_cancelled() {
                RunOutcome::cancelled()
            } else {
                this.execute(run.id, request, &cancel).await
            };
            this.finish(run, outcome, completion).await;
        });

        Ok(run_id)
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: TaskRequest,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let runner = Arc::clone(&self.runner);
        // Separate task so a panicking runner is observed as a JoinError.
        let mut handle = tokio::spawn(async move { runner.execute(run_id, request).await });

        let step = tokio::select! {
            joined = &mut handle => RunnerStep::Finished(joined),
            _ = cancel.cancelled() => RunnerStep::Cancelled,
        };

        match step {
            RunnerStep::Finished(Ok(Ok(TaskOutcome::Completed { output }))) => RunOutcome::Success {
                result: (!output.is_null()).then_some(output),
            },
            RunnerStep::Finished(Ok(Ok(TaskOutcome::Failed { error }))) => RunOutcome::failed(error),
            RunnerStep::Finished(Ok(Err(e))) => RunOutcome::failed(e.to_string()),
            RunnerStep::Finished(Err(e)) => RunOutcome::failed(e.to_string()),
            RunnerStep::Cancelled => {
                self.wait_for_cancel(run_id, handle).await;
                RunOutcome::cancelled()
            }
        }
    }

    /// Ask the runner to stop and wait, up to the grace period, for it to
    /// acknowledge or wind down.
    async fn wait_for_cancel(
        &self,
        run_id: Uuid,
        mut handle: JoinHandle<std::result::Result<TaskOutcome, RunnerError>>,
    ) {
        info!(run_id = %run_id, "Cancelling run");
        let acknowledged = async {
            if !self.runner.cancel(run_id).await {
                let _ = (&mut handle).await;
            }
        };
        if tokio::time::timeout(self.cancel_grace, acknowledged)
            .await
            .is_err()
        {
            warn!(
                run_id = %run_id,
                grace_secs = self.cancel_grace.as_secs_f64(),
                "Runner did not acknowledge cancellation, releasing slot anyway"
            );
            handle.abort();
        }
    }

    /// The single resolution path of a run.
    async fn finish(
        &self,
        run: RunRecord,
        outcome: RunOutcome,
        completion: oneshot::Sender<RunRecord>,
    ) {
        let automation_id = run.automation_id;
        let completed_at = Utc::now();

        match self.history.complete(run.id, &outcome).await {
            Ok(true) => {}
            Ok(false) => warn!(run_id = %run.id, "Run was already terminal"),
            Err(e) => error!(run_id = %run.id, error = %e, "Failed to complete run record"),
        }
        if let Err(e) = self
            .db
            .record_automation_run(automation_id, outcome.automation_status(), completed_at)
            .await
        {
            error!(automation = %automation_id, error = %e, "Failed to update automation status");
        }

        let status = outcome.run_status();
        let ended = match &outcome {
            RunOutcome::Failed { error } if error == CANCELLED_ERROR => StopOutcome::Cancelled,
            _ => StopOutcome::Finished(status),
        };
        self.release_slot(automation_id, ended);

        let (result, error_message) = match outcome {
            RunOutcome::Success { result } => (result, None),
            RunOutcome::Failed { error } => (None, Some(error)),
        };
        let record = RunRecord {
            status,
            completed_at: Some(completed_at),
            result,
            error_message,
            ..run
        };
        info!(
            automation = %automation_id,
            run_id = %record.id,
            status = %record.status,
            error = record.error_message.as_deref().unwrap_or(""),
            "Run finished"
        );
        let _ = completion.send(record);
    }

    /// Free the gate slot and hand `ended` to anyone blocked in `stop()`.
    fn release_slot(&self, automation_id: Uuid, ended: StopOutcome) {
        let mut active = self.active();
        let admitted = self.gate.release(automation_id);
        if let Some(run) = active.remove(&automation_id) {
            run.finished.send_replace(Some(ended));
        }
        drop(active);

        if !admitted.is_empty() {
            debug!(released = %automation_id, admitted = ?admitted, "Slot handed to queued triggers");
        }
    }

    /// Cancel a running automation or drop a queued one.
    ///
    /// For a running automation this returns once the run is terminal and
    /// its slot has been released. A run that completed before the signal
    /// landed is reported as [`StopOutcome::Finished`] with its real status.
    pub async fn stop(&self, automation_id: Uuid) -> Result<StopOutcome> {
        if self.gate.cancel_queued(automation_id) {
            info!(automation = %automation_id, "Removed queued trigger");
            return Ok(StopOutcome::Dequeued);
        }

        let finished = {
            let mut active = self.active();
            if self.gate.is_running(automation_id) {
                let run = active.entry(automation_id).or_insert_with(ActiveRun::new);
                run.cancel.cancel();
                Some(run.finished.subscribe())
            } else {
                None
            }
        };

        match finished {
            Some(mut finished) => {
                let ended = finished
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|ended| *ended);
                Ok(ended.unwrap_or(StopOutcome::Cancelled))
            }
            None => {
                if self.db.get_automation(automation_id).await?.is_none() {
                    return Err(AutomationError::NotFound { id: automation_id }.into());
                }
                Ok(StopOutcome::NotRunning)
            }
        }
    }

    pub fn is_running(&self, automation_id: Uuid) -> bool {
        self.gate.is_running(automation_id)
    }

    pub fn is_queued(&self, automation_id: Uuid) -> bool {
        self.gate.is_queued(automation_id)
    }

    pub fn status(&self) -> GateStatus {
        self.gate.status()
    }

    /// Change the concurrency ceiling. Running work is never evicted.
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<()> {
        if max_concurrent == 0 {
            return Err(AutomationError::validation("max_concurrent", "must be at least 1").into());
        }
        self.gate.configure(max_concurrent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::Error;
    use crate::store::LibSqlBackend;

    /// Behaviour keyed by task description.
    #[derive(Default)]
    struct FakeRunner {
        requests: Mutex<Vec<TaskRequest>>,
        cancels: Mutex<HashMap<Uuid, CancellationToken>>,
        cancel_calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for FakeRunner {
        async fn execute(
            &self,
            run_id: Uuid,
            request: TaskRequest,
        ) -> std::result::Result<TaskOutcome, RunnerError> {
            self.requests.lock().unwrap().push(request.clone());
            match request.task_description.as_str() {
                "ok" => Ok(TaskOutcome::Completed {
                    output: json!({"done": true}),
                }),
                "report failure" => Ok(TaskOutcome::Failed {
                    error: "captcha".to_string(),
                }),
                "error" => Err(RunnerError::InvalidOutput("garbled".to_string())),
                "panic" => panic!("runner exploded"),
                "wait" => {
                    let token = CancellationToken::new();
                    self.cancels.lock().unwrap().insert(run_id, token.clone());
                    token.cancelled().await;
                    Ok(TaskOutcome::Failed {
                        error: "killed".to_string(),
                    })
                }
                // Never finishes and never acknowledges cancellation.
                _ => std::future::pending().await,
            }
        }

        async fn cancel(&self, run_id: Uuid) -> bool {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            match self.cancels.lock().unwrap().get(&run_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            }
        }
    }

    async fn setup(max: usize) -> (Arc<ExecutionCoordinator>, Arc<dyn Database>, Arc<FakeRunner>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runner = Arc::new(FakeRunner::default());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&db),
            Arc::new(RunHistoryStore::new(Arc::clone(&db))),
            Arc::new(ConcurrencyGate::new(max, 8)),
            runner.clone(),
            Duration::from_millis(300),
        ));
        (coordinator, db, runner)
    }

    async fn add(db: &Arc<dyn Database>, task: &str) -> AutomationDefinition {
        let def = AutomationDefinition::new(format!("{task} automation"), task);
        db.create_automation(&def).await.unwrap();
        def
    }

    async fn run_to_end(coordinator: &Arc<ExecutionCoordinator>, id: Uuid) -> RunRecord {
        let outcome = coordinator.trigger(id, TriggerSource::Manual).await.unwrap();
        let TriggerOutcome::Started { completion, .. } = outcome else {
            panic!("expected the run to start");
        };
        tokio::time::timeout(Duration::from_secs(5), completion.wait())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn successful_run_updates_history_and_definition() {
        let (coordinator, db, _runner) = setup(2).await;
        let def = add(&db, "ok").await;

        let record = run_to_end(&coordinator, def.id).await;
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.result, Some(json!({"done": true})));

        let stored = coordinator.history().get(record.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Success);

        let def = db.get_automation(def.id).await.unwrap().unwrap();
        assert_eq!(def.status, AutomationStatus::Completed);
        assert!(def.last_run_at.is_some());
        assert!(!coordinator.is_running(def.id));
        assert_eq!(coordinator.status().running_count, 0);
    }

    #[tokio::test]
    async fn runner_failures_are_recorded_not_propagated() {
        let (coordinator, db, _runner) = setup(3).await;

        let reported = add(&db, "report failure").await;
        let record = run_to_end(&coordinator, reported.id).await;
        assert_eq!(record.error_message.as_deref(), Some("captcha"));

        let errored = add(&db, "error").await;
        let record = run_to_end(&coordinator, errored.id).await;
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.unwrap().contains("garbled"));

        let panicked = add(&db, "panic").await;
        let record = run_to_end(&coordinator, panicked.id).await;
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.unwrap().contains("panic"));

        let def = db.get_automation(panicked.id).await.unwrap().unwrap();
        assert_eq!(def.status, AutomationStatus::Failed);
        assert_eq!(coordinator.status().running_count, 0);
    }

    #[tokio::test]
    async fn overrides_reach_the_runner() {
        let (coordinator, db, runner) = setup(1).await;
        let def = AutomationDefinition::new("ok", "ok").with_profile("/profiles/default");
        db.create_automation(&def).await.unwrap();

        let outcome = coordinator
            .trigger_with(
                def.id,
                TriggerSource::Manual,
                RunOverrides {
                    headless: Some(false),
                    profile_reference: Some("/profiles/other".to_string()),
                },
            )
            .await
            .unwrap();
        let TriggerOutcome::Started { completion, .. } = outcome else {
            panic!("expected start");
        };
        completion.wait().await.unwrap();

        let requests = runner.requests.lock().unwrap();
        assert_eq!(requests[0].profile_reference.as_deref(), Some("/profiles/other"));
        assert!(!requests[0].headless);
    }

    #[tokio::test]
    async fn stop_cancels_running_run() {
        let (coordinator, db, runner) = setup(1).await;
        let def = add(&db, "wait").await;

        let outcome = coordinator.trigger(def.id, TriggerSource::Manual).await.unwrap();
        let TriggerOutcome::Started { run_id, completion } = outcome else {
            panic!("expected start");
        };
        // Let the runner register its cancel handle.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coordinator.stop(def.id).await.unwrap(), StopOutcome::Cancelled);
        assert!(!coordinator.is_running(def.id));
        assert_eq!(runner.cancel_calls.load(Ordering::SeqCst), 1);

        let stored = coordinator.history().get(run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_ERROR));
        assert_eq!(completion.wait().await.unwrap().id, run_id);
    }

    #[tokio::test]
    async fn unresponsive_runner_released_after_grace() {
        let (coordinator, db, _runner) = setup(1).await;
        let def = add(&db, "ignore everything").await;

        coordinator.trigger(def.id, TriggerSource::Manual).await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), coordinator.stop(def.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stopped, StopOutcome::Cancelled);
        assert_eq!(coordinator.status().running_count, 0);

        let runs = coordinator.history().list(def.id, 10).await.unwrap();
        assert_eq!(runs[0].error_message.as_deref(), Some(CANCELLED_ERROR));
    }

    #[tokio::test]
    async fn stop_racing_a_finished_run_reports_its_status() {
        let (coordinator, db, _runner) = setup(1).await;
        let def = add(&db, "ok").await;

        // Hold the slot by hand so the run's finish can be sequenced after
        // the stop request.
        assert!(matches!(
            coordinator.gate.try_acquire(def.id, TriggerSource::Manual),
            Admission::Admitted
        ));
        let run = coordinator.history().begin(def.id).await.unwrap();
        let run_id = run.id;

        let id = def.id;
        let stopping = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.stop(id).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !coordinator.active().contains_key(&def.id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (tx, _rx) = oneshot::channel();
        coordinator
            .finish(run, RunOutcome::Success { result: None }, tx)
            .await;

        let stopped = tokio::time::timeout(Duration::from_secs(5), stopping)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stopped, StopOutcome::Finished(RunStatus::Success));
        let stored = coordinator.history().get(run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert!(!coordinator.is_running(def.id));
    }

    #[tokio::test]
    async fn stop_idle_and_unknown() {
        let (coordinator, db, _runner) = setup(1).await;
        let def = add(&db, "ok").await;

        assert_eq!(coordinator.stop(def.id).await.unwrap(), StopOutcome::NotRunning);
        assert!(matches!(
            coordinator.stop(Uuid::new_v4()).await,
            Err(Error::Automation(AutomationError::NotFound { .. }))
        ));
        assert!(matches!(
            coordinator.trigger(Uuid::new_v4(), TriggerSource::Manual).await,
            Err(Error::Automation(AutomationError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn scheduled_fire_of_disabled_automation_is_skipped() {
        let (coordinator, db, runner) = setup(1).await;
        let def = AutomationDefinition::new("off", "ok").with_enabled(false);
        db.create_automation(&def).await.unwrap();

        let outcome = coordinator.trigger(def.id, TriggerSource::Scheduled).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Disabled));
        assert!(runner.requests.lock().unwrap().is_empty());

        // Manual runs ignore the flag.
        let record = run_to_end(&coordinator, def.id).await;
        assert_eq!(record.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn zero_ceiling_is_rejected() {
        let (coordinator, _db, _runner) = setup(2).await;
        assert!(matches!(
            coordinator.set_max_concurrent(0),
            Err(Error::Automation(AutomationError::Validation { .. }))
        ));
        coordinator.set_max_concurrent(5).unwrap();
        assert_eq!(coordinator.status().max_concurrent, 5);
    }
}
