//! End-to-end scheduling scenarios against an in-memory database.
//!
//! A scripted task runner holds every run open until the test finishes it,
//! so admission, queueing and cancellation can be observed step by step.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

use ai_automations::automation::{
    AutomationDefinition, AutomationStatus, ConcurrencyGate, ExecutionCoordinator, RejectReason,
    RunHistoryStore, RunStatus, ScheduleManager, StopOutcome, TaskOutcome, TaskRequest,
    TaskRunner, TriggerOutcome, TriggerSource,
};
use ai_automations::error::RunnerError;
use ai_automations::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Runner that parks each run until the test calls `finish`.
#[derive(Default)]
struct ScriptedRunner {
    waiting: Mutex<HashMap<String, (Uuid, oneshot::Sender<TaskOutcome>)>>,
    requests: Mutex<Vec<TaskRequest>>,
}

impl ScriptedRunner {
    /// Resolve the parked run for `task`, waiting for it to start if needed.
    async fn finish(&self, task: &str, outcome: TaskOutcome) {
        timeout(TEST_TIMEOUT, async {
            loop {
                if let Some((_, tx)) = self.waiting.lock().unwrap().remove(task) {
                    let _ = tx.send(outcome);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("run for '{task}' never started"));
    }

    fn started(&self, task: &str) -> bool {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.task_description == task)
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn execute(&self, run_id: Uuid, request: TaskRequest) -> Result<TaskOutcome, RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap()
            .insert(request.task_description.clone(), (run_id, tx));
        self.requests.lock().unwrap().push(request);
        rx.await
            .map_err(|_| RunnerError::InvalidOutput("runner dropped".to_string()))
    }

    async fn cancel(&self, run_id: Uuid) -> bool {
        let mut waiting = self.waiting.lock().unwrap();
        let task = waiting
            .iter()
            .find(|(_, (id, _))| *id == run_id)
            .map(|(task, _)| task.clone());
        match task.and_then(|task| waiting.remove(&task)) {
            Some((_, tx)) => tx
                .send(TaskOutcome::Failed {
                    error: "killed".to_string(),
                })
                .is_ok(),
            None => false,
        }
    }
}

struct Harness {
    db: Arc<dyn Database>,
    coordinator: Arc<ExecutionCoordinator>,
    runner: Arc<ScriptedRunner>,
}

impl Harness {
    async fn new(max_concurrent: usize) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runner = Arc::new(ScriptedRunner::default());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&db),
            Arc::new(RunHistoryStore::new(Arc::clone(&db))),
            Arc::new(ConcurrencyGate::new(max_concurrent, 16)),
            runner.clone(),
            Duration::from_millis(500),
        ));
        Self {
            db,
            coordinator,
            runner,
        }
    }

    /// An automation whose task description is its name.
    async fn automation(&self, name: &str) -> Uuid {
        let def = AutomationDefinition::new(name, name);
        self.db.create_automation(&def).await.unwrap();
        def.id
    }

    async fn runs(&self, id: Uuid) -> usize {
        self.coordinator.history().list(id, 100).await.unwrap().len()
    }
}

fn success() -> TaskOutcome {
    TaskOutcome::Completed {
        output: json!({"ok": true}),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn queued_manual_trigger_starts_when_slot_frees() {
    let h = Harness::new(2).await;
    let a = h.automation("A").await;
    let b = h.automation("B").await;
    let c = h.automation("C").await;

    let ta = h.coordinator.trigger(a, TriggerSource::Manual).await.unwrap();
    let tb = h.coordinator.trigger(b, TriggerSource::Manual).await.unwrap();
    let tc = h.coordinator.trigger(c, TriggerSource::Manual).await.unwrap();
    assert!(matches!(ta, TriggerOutcome::Started { .. }));
    assert!(matches!(tb, TriggerOutcome::Started { .. }));
    let TriggerOutcome::Queued { completion } = tc else {
        panic!("C should be queued");
    };

    let status = h.coordinator.status();
    assert_eq!(status.running_count, 2);
    assert_eq!(status.queue_length, 1);
    assert!(!h.coordinator.is_running(c));
    assert_eq!(h.runs(c).await, 0);

    h.runner.finish("A", success()).await;
    wait_until(|| h.coordinator.is_running(c)).await;
    assert!(!h.coordinator.is_queued(c));
    assert_eq!(h.coordinator.status().running_count, 2);

    h.runner.finish("C", success()).await;
    let record = timeout(TEST_TIMEOUT, completion.wait())
        .await
        .unwrap()
        .expect("queued run should complete");
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.automation_id, c);

    h.runner.finish("B", success()).await;
    wait_until(|| h.coordinator.status().running_count == 0).await;
}

#[tokio::test]
async fn second_tick_while_running_is_skipped() {
    let h = Harness::new(3).await;
    let def = AutomationDefinition::new("X", "X").with_cron("*/5 * * * *");
    h.db.create_automation(&def).await.unwrap();

    let first = h.coordinator.trigger(def.id, TriggerSource::Scheduled).await.unwrap();
    assert!(matches!(first, TriggerOutcome::Started { .. }));

    let second = h.coordinator.trigger(def.id, TriggerSource::Scheduled).await.unwrap();
    assert!(matches!(second, TriggerOutcome::Skipped(RejectReason::AlreadyRunning)));
    assert_eq!(h.runs(def.id).await, 1);
    assert_eq!(h.coordinator.status().queue_length, 0);

    h.runner.finish("X", success()).await;
    wait_until(|| !h.coordinator.is_running(def.id)).await;
    assert_eq!(h.runs(def.id).await, 1);
}

#[tokio::test]
async fn stopping_queued_trigger_leaves_no_record() {
    let h = Harness::new(1).await;
    let p = h.automation("P").await;
    let y = h.automation("Y").await;

    h.coordinator.trigger(p, TriggerSource::Manual).await.unwrap();
    let ty = h.coordinator.trigger(y, TriggerSource::Manual).await.unwrap();
    let TriggerOutcome::Queued { completion } = ty else {
        panic!("Y should be queued");
    };

    assert_eq!(h.coordinator.stop(y).await.unwrap(), StopOutcome::Dequeued);
    assert!(!h.coordinator.is_running(y));
    assert!(!h.coordinator.is_queued(y));
    assert_eq!(h.runs(y).await, 0);
    assert!(timeout(TEST_TIMEOUT, completion.wait()).await.unwrap().is_none());

    h.runner.finish("P", success()).await;
    wait_until(|| h.coordinator.status().running_count == 0).await;
    assert_eq!(h.runs(y).await, 0);
    assert!(!h.runner.started("Y"));
}

#[tokio::test]
async fn stopping_running_trigger_records_cancellation() {
    let h = Harness::new(1).await;
    let r = h.automation("R").await;

    let TriggerOutcome::Started { run_id, .. } =
        h.coordinator.trigger(r, TriggerSource::Manual).await.unwrap()
    else {
        panic!("R should start");
    };
    wait_until(|| h.runner.started("R")).await;

    let stopped = timeout(TEST_TIMEOUT, h.coordinator.stop(r)).await.unwrap().unwrap();
    assert_eq!(stopped, StopOutcome::Cancelled);
    assert!(!h.coordinator.is_running(r));

    let record = h.coordinator.history().get(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("cancelled"));

    // The slot is free again.
    let again = h.coordinator.trigger(r, TriggerSource::Scheduled).await.unwrap();
    assert!(matches!(again, TriggerOutcome::Started { .. }));
}

#[tokio::test]
async fn lowering_ceiling_drains_without_cancelling() {
    let h = Harness::new(3).await;
    let ids = [
        h.automation("D1").await,
        h.automation("D2").await,
        h.automation("D3").await,
    ];
    let fourth = h.automation("D4").await;
    for id in ids {
        h.coordinator.trigger(id, TriggerSource::Manual).await.unwrap();
    }

    h.coordinator.set_max_concurrent(1).unwrap();
    assert_eq!(h.coordinator.status().running_count, 3);
    assert_eq!(h.coordinator.status().max_concurrent, 1);
    for id in ids {
        assert!(h.coordinator.is_running(id));
    }

    for (done, remaining) in [("D1", 2), ("D2", 1)] {
        h.runner.finish(done, success()).await;
        wait_until(|| h.coordinator.status().running_count == remaining).await;
        let skipped = h.coordinator.trigger(fourth, TriggerSource::Scheduled).await.unwrap();
        assert!(matches!(skipped, TriggerOutcome::Skipped(RejectReason::AtCapacity)));
    }

    h.runner.finish("D3", success()).await;
    wait_until(|| h.coordinator.status().running_count == 0).await;
    let admitted = h.coordinator.trigger(fourth, TriggerSource::Scheduled).await.unwrap();
    assert!(matches!(admitted, TriggerOutcome::Started { .. }));

    for id in ids {
        let runs = h.coordinator.history().list(id, 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Success);
    }
}

#[tokio::test]
async fn runner_timeout_is_recorded_and_slot_released() {
    let h = Harness::new(1).await;
    let z = h.automation("Z").await;

    let TriggerOutcome::Started { run_id, completion } =
        h.coordinator.trigger(z, TriggerSource::Manual).await.unwrap()
    else {
        panic!("Z should start");
    };
    h.runner
        .finish(
            "Z",
            TaskOutcome::Failed {
                error: "timeout".to_string(),
            },
        )
        .await;
    timeout(TEST_TIMEOUT, completion.wait()).await.unwrap().unwrap();

    let record = h.coordinator.history().get(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("timeout"));
    assert!(record.completed_at.is_some());

    let def = h.db.get_automation(z).await.unwrap().unwrap();
    assert_eq!(def.status, AutomationStatus::Failed);
    assert!(def.last_run_at.is_some());
    assert_eq!(h.coordinator.status().running_count, 0);
}

#[tokio::test]
async fn scheduled_fire_reads_current_definition() {
    let h = Harness::new(1).await;
    let mut def = AutomationDefinition::new("edit me", "old task").with_cron("0 6 * * *");
    h.db.create_automation(&def).await.unwrap();

    let manager = ScheduleManager::new(Arc::clone(&h.coordinator));
    manager.load_schedules().await.unwrap();

    def.task_description = "new task".to_string();
    h.db.update_automation(&def).await.unwrap();

    h.coordinator.trigger(def.id, TriggerSource::Scheduled).await.unwrap();
    wait_until(|| h.runner.started("new task")).await;
    assert!(!h.runner.started("old task"));
    h.runner.finish("new task", success()).await;
    manager.shutdown();
}

/// Runner that finishes on its own and records overlap.
#[derive(Default)]
struct CountingRunner {
    active: AtomicUsize,
    peak: AtomicUsize,
    in_flight: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
}

#[async_trait]
impl TaskRunner for CountingRunner {
    async fn execute(&self, _run_id: Uuid, request: TaskRequest) -> Result<TaskOutcome, RunnerError> {
        if !self.in_flight.lock().unwrap().insert(request.task_description.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(10)).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.lock().unwrap().remove(&request.task_description);
        Ok(TaskOutcome::Completed { output: json!(null) })
    }

    async fn cancel(&self, _run_id: Uuid) -> bool {
        false
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ceiling_and_exclusivity_hold_under_load() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let runner = Arc::new(CountingRunner::default());
    let coordinator = Arc::new(ExecutionCoordinator::new(
        Arc::clone(&db),
        Arc::new(RunHistoryStore::new(Arc::clone(&db))),
        Arc::new(ConcurrencyGate::new(3, 64)),
        runner.clone(),
        Duration::from_secs(1),
    ));

    let mut ids = Vec::new();
    for i in 0..8 {
        let def = AutomationDefinition::new(format!("load-{i}"), format!("load-{i}"));
        db.create_automation(&def).await.unwrap();
        ids.push(def.id);
    }

    let mut handles = Vec::new();
    for round in 0..40 {
        let coordinator = Arc::clone(&coordinator);
        let id = ids[round % ids.len()];
        let source = if round % 2 == 0 {
            TriggerSource::Scheduled
        } else {
            TriggerSource::Manual
        };
        handles.push(tokio::spawn(async move {
            let outcome = coordinator.trigger(id, source).await.unwrap();
            let status = coordinator.status();
            assert!(status.running_count <= status.max_concurrent);
            match outcome {
                TriggerOutcome::Started { completion, .. } | TriggerOutcome::Queued { completion } => {
                    completion.wait().await;
                }
                TriggerOutcome::Skipped(_) | TriggerOutcome::Rejected(_) | TriggerOutcome::Disabled => {}
            }
        }));
    }
    timeout(Duration::from_secs(20), async {
        for handle in handles {
            handle.await.unwrap();
        }
    })
    .await
    .expect("load test hung");

    assert!(runner.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(runner.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.status().running_count, 0);
    assert_eq!(coordinator.status().queue_length, 0);

    for id in ids {
        for run in coordinator.history().list(id, 100).await.unwrap() {
            assert!(run.status.is_terminal());
        }
    }
}

#[tokio::test]
async fn restart_fails_runs_left_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("automations.db");

    let (automation_id, run_id) = {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let def = AutomationDefinition::new("long", "long");
        db.create_automation(&def).await.unwrap();
        let history = RunHistoryStore::new(Arc::clone(&db));
        let run = history.begin(def.id).await.unwrap();
        db.set_automation_status(def.id, AutomationStatus::Running)
            .await
            .unwrap();
        (def.id, run.id)
    };

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let history = RunHistoryStore::new(Arc::clone(&db));
    let report = history.recover_interrupted().await.unwrap();
    assert_eq!(report.runs_failed, 1);

    let run = history.get(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("interrupted"));
    let def = db.get_automation(automation_id).await.unwrap().unwrap();
    assert_eq!(def.status, AutomationStatus::Failed);
}
