//! Admission control for automation runs.
//!
//! The gate owns the only shared scheduling state: the running set, the FIFO
//! wait queue and the concurrency ceiling. Every decision and mutation happens
//! under one mutex, so the ceiling check and the per-automation exclusivity
//! check are a single atomic step.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::TriggerSource;

/// Why an admission request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The automation is already running or waiting in the queue.
    AlreadyRunning,
    /// No free slot, and the trigger source is never queued.
    AtCapacity,
    /// No free slot and the wait queue is full.
    QueueFull,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::AlreadyRunning => write!(f, "already running"),
            RejectReason::AtCapacity => write!(f, "at capacity"),
            RejectReason::QueueFull => write!(f, "queue full"),
        }
    }
}

/// Resolves once a queued trigger has been moved into the running set.
#[derive(Debug)]
pub struct AdmissionTicket {
    rx: oneshot::Receiver<()>,
}

impl AdmissionTicket {
    /// Wait for admission. Returns false if the entry was cancelled while queued.
    pub async fn admitted(self) -> bool {
        self.rx.await.is_ok()
    }
}

/// Result of [`ConcurrencyGate::try_acquire`].
#[derive(Debug)]
pub enum Admission {
    /// A slot is held for the automation; the caller must `release` it.
    Admitted,
    /// Waiting in the FIFO queue.
    Queued(AdmissionTicket),
    Rejected(RejectReason),
}

/// Snapshot of the gate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStatus {
    pub max_concurrent: usize,
    pub running_count: usize,
    pub queue_length: usize,
}

struct Waiter {
    automation_id: Uuid,
    admit: oneshot::Sender<()>,
}

struct GateState {
    max_concurrent: usize,
    max_queue_len: usize,
    running: HashSet<Uuid>,
    queue: VecDeque<Waiter>,
}

impl GateState {
    /// Move queue heads into the running set while capacity allows.
    fn admit_waiters(&mut self) -> Vec<Uuid> {
        let mut admitted = Vec::new();
        while self.running.len() < self.max_concurrent {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.running.insert(waiter.automation_id);
            if waiter.admit.send(()).is_ok() {
                admitted.push(waiter.automation_id);
            } else {
                // Nobody is waiting on this ticket any more.
                self.running.remove(&waiter.automation_id);
                debug!(automation = %waiter.automation_id, "Dropped abandoned queue entry");
            }
        }
        admitted
    }
}

/// Concurrency ceiling plus per-automation exclusivity with a FIFO wait queue.
pub struct ConcurrencyGate {
    state: Mutex<GateState>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize, max_queue_len: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                max_concurrent,
                max_queue_len,
                running: HashSet::new(),
                queue: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // State is only mutated inside short critical sections without
        // user callbacks, so a poisoned lock still holds consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the ceiling. Lowering it never evicts running work; raising it
    /// admits queued entries. Returns the automations admitted as a result.
    pub fn configure(&self, max_concurrent: usize) -> Vec<Uuid> {
        let mut state = self.lock();
        let previous = state.max_concurrent;
        state.max_concurrent = max_concurrent;
        let admitted = state.admit_waiters();
        info!(
            previous,
            max_concurrent,
            running = state.running.len(),
            admitted = admitted.len(),
            "Concurrency ceiling updated"
        );
        admitted
    }

    /// Decide whether `automation_id` may start now, wait, or is turned away.
    ///
    /// Scheduled triggers are never queued; manual ones wait in FIFO order.
    pub fn try_acquire(&self, automation_id: Uuid, source: TriggerSource) -> Admission {
        let mut state = self.lock();

        if state.running.contains(&automation_id)
            || state.queue.iter().any(|w| w.automation_id == automation_id)
        {
            return Admission::Rejected(RejectReason::AlreadyRunning);
        }

        if state.running.len() < state.max_concurrent {
            state.running.insert(automation_id);
            return Admission::Admitted;
        }

        match source {
            TriggerSource::Scheduled => Admission::Rejected(RejectReason::AtCapacity),
            TriggerSource::Manual => {
                if state.queue.len() >= state.max_queue_len {
                    return Admission::Rejected(RejectReason::QueueFull);
                }
                let (admit, rx) = oneshot::channel();
                state.queue.push_back(Waiter {
                    automation_id,
                    admit,
                });
                debug!(
                    automation = %automation_id,
                    position = state.queue.len(),
                    "Queued for a free slot"
                );
                Admission::Queued(AdmissionTicket { rx })
            }
        }
    }

    /// Free the slot held by `automation_id` and admit queue heads into it.
    /// Returns the automations admitted as a result.
    pub fn release(&self, automation_id: Uuid) -> Vec<Uuid> {
        let mut state = self.lock();
        if !state.running.remove(&automation_id) {
            warn!(automation = %automation_id, "Release for an automation that holds no slot");
            return Vec::new();
        }
        state.admit_waiters()
    }

    /// Remove a queued entry without ever starting it.
    pub fn cancel_queued(&self, automation_id: Uuid) -> bool {
        let mut state = self.lock();
        match state
            .queue
            .iter()
            .position(|w| w.automation_id == automation_id)
        {
            Some(index) => {
                // Dropping the waiter resolves its ticket as not admitted.
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, automation_id: Uuid) -> bool {
        self.lock().running.contains(&automation_id)
    }

    pub fn is_queued(&self, automation_id: Uuid) -> bool {
        self.lock()
            .queue
            .iter()
            .any(|w| w.automation_id == automation_id)
    }

    pub fn status(&self) -> GateStatus {
        let state = self.lock();
        GateStatus {
            max_concurrent: state.max_concurrent,
            running_count: state.running.len(),
            queue_length: state.queue.len(),
        }
    }

    /// Queued automation ids, head first.
    pub fn queued_ids(&self) -> Vec<Uuid> {
        self.lock().queue.iter().map(|w| w.automation_id).collect()
    }
}
