//! Task Records
//!
//! The live, shared state of an accepted task: its lifecycle state, its
//! outcome once terminal, timestamps, and a pending cancellation flag.
//!
//! Every state change goes through [`TaskRecord::transition`] or
//! [`TaskRecord::finish`], which enforce the lifecycle rules under a short
//! lock and then publish the new state on a `watch` channel so that waiters
//! wake up. The outcome is stored before the terminal state is published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::aggregate::CompositeResult;
use crate::domain::Domain;
use crate::error::{TaskFailure, TransitionError};
use crate::task::{ExecutionMode, Task, TaskId, TaskState};

/// Terminal outcome of a task. The `Arc` makes repeated reads hand out the
/// identical result.
pub type TaskOutcome = Result<Arc<CompositeResult>, TaskFailure>;

#[derive(Debug)]
struct Slot {
    state: TaskState,
    outcome: Option<TaskOutcome>,
    dispatched_at: Option<Instant>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// Shared lifecycle state of one task
#[derive(Debug)]
pub struct TaskRecord {
    task: Task,
    /// Submission order, for FIFO within a priority
    sequence: u64,
    submitted_wall: DateTime<Utc>,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<TaskState>,
    cancel_requested: AtomicBool,
}

impl TaskRecord {
    /// Create a record for a freshly accepted task
    #[must_use]
    pub fn new(task: Task, sequence: u64) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Queued);
        Self {
            task,
            sequence,
            submitted_wall: Utc::now(),
            slot: Mutex::new(Slot {
                state: TaskState::Queued,
                outcome: None,
                dispatched_at: None,
                started_at: None,
                finished_at: None,
            }),
            state_tx,
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Task identifier
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    /// The immutable task
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Submission sequence number
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.slot.lock().state
    }

    /// Outcome, once terminal
    #[must_use]
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.slot.lock().outcome.clone()
    }

    /// When the task reached a terminal state
    #[must_use]
    pub fn finished_at(&self) -> Option<Instant> {
        self.slot.lock().finished_at
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }

    /// Move to a non-terminal state
    pub fn transition(&self, next: TaskState) -> Result<(), TransitionError> {
        let mut slot = self.slot.lock();
        Self::check(&slot, next)?;

        let now = Instant::now();
        slot.state = next;
        match next {
            TaskState::Dispatched => slot.dispatched_at = Some(now),
            TaskState::Running => slot.started_at = Some(now),
            _ => {}
        }
        drop(slot);

        self.state_tx.send_replace(next);
        Ok(())
    }

    /// Move to the terminal state matching `outcome` and store it
    ///
    /// A pending cancellation wins over whatever the task produced. The flag
    /// is read under the slot lock, so a `cancel` that saw the task still
    /// running is never lost.
    pub fn finish(&self, outcome: TaskOutcome) -> Result<TaskState, TransitionError> {
        let mut slot = self.slot.lock();
        let outcome = if self.cancel_requested() {
            Err(TaskFailure::Cancelled)
        } else {
            outcome
        };
        let next = match &outcome {
            Ok(_) => TaskState::Completed,
            Err(failure) => failure.terminal_state(),
        };
        Self::check(&slot, next)?;
        slot.state = next;
        slot.outcome = Some(outcome);
        slot.finished_at = Some(Instant::now());
        drop(slot);

        self.state_tx.send_replace(next);
        Ok(next)
    }

    fn check(slot: &Slot, next: TaskState) -> Result<(), TransitionError> {
        if slot.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(TransitionError {
                from: slot.state,
                to: next,
            })
        }
    }

    /// Cancel the task
    ///
    /// A queued task is cancelled on the spot. A dispatched or running task
    /// is flagged and its worker honors the flag at the next transition
    /// boundary; in-flight provider calls are never interrupted.
    pub fn cancel(&self) -> CancelDisposition {
        self.cancel_requested.store(true, Ordering::Release);

        let mut slot = self.slot.lock();
        match slot.state {
            TaskState::Queued => {
                slot.state = TaskState::Cancelled;
                slot.outcome = Some(Err(TaskFailure::Cancelled));
                slot.finished_at = Some(Instant::now());
                drop(slot);
                self.state_tx.send_replace(TaskState::Cancelled);
                CancelDisposition::Cancelled
            }
            TaskState::Dispatched | TaskState::Running => CancelDisposition::Requested,
            terminal => CancelDisposition::AlreadyFinished(terminal),
        }
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Progress report
    #[must_use]
    pub fn progress(&self) -> TaskProgress {
        let slot = self.slot.lock();
        let now = Instant::now();
        let submitted = self.task.submitted_at;
        let ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);

        let queue_wait = slot
            .dispatched_at
            .or(slot.finished_at)
            .unwrap_or(now)
            .saturating_duration_since(submitted);
        let run_time = slot
            .started_at
            .map(|start| slot.finished_at.unwrap_or(now).saturating_duration_since(start));

        TaskProgress {
            id: self.task.id.clone(),
            state: slot.state,
            domain: self.task.domain,
            priority: self.task.priority,
            mode: self.task.mode,
            submitted_at: self.submitted_wall,
            queue_wait_ms: ms(queue_wait),
            run_time_ms: run_time.map(ms),
            cancel_requested: self.cancel_requested(),
        }
    }
}

/// What a cancellation request did
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CancelDisposition {
    /// Task was queued and is now cancelled
    Cancelled,
    /// Task is with a worker; cancellation happens at the next boundary
    Requested,
    /// Task had already finished
    AlreadyFinished(TaskState),
}

/// Snapshot of a task's lifecycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    /// Task identifier
    pub id: TaskId,
    /// Current state
    pub state: TaskState,
    /// Assigned domain
    pub domain: Domain,
    /// Priority
    pub priority: i32,
    /// Execution mode
    pub mode: ExecutionMode,
    /// Wall-clock submission time
    pub submitted_at: DateTime<Utc>,
    /// Time spent queued (so far, if still queued)
    pub queue_wait_ms: u64,
    /// Time spent running, once started
    pub run_time_ms: Option<u64>,
    /// Whether cancellation is pending
    pub cancel_requested: bool,
}

// ============================================================================
// Task Handle
// ============================================================================

/// Caller's handle on a submitted task
#[derive(Clone, Debug)]
pub struct TaskHandle {
    record: Arc<TaskRecord>,
}

impl TaskHandle {
    pub(crate) fn new(record: Arc<TaskRecord>) -> Self {
        Self { record }
    }

    /// Task identifier
    #[must_use]
    pub fn id(&self) -> &TaskId {
        self.record.id()
    }

    /// Assigned domain
    #[must_use]
    pub fn domain(&self) -> Domain {
        self.record.task().domain
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.record.state()
    }

    /// Outcome if already terminal
    #[must_use]
    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        self.record.outcome()
    }

    /// Wait for the task to reach a terminal state
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.record.subscribe();
        loop {
            if let Some(outcome) = self.record.outcome() {
                return outcome;
            }
            // The record owns the sender, so the channel outlives this handle
            if rx.wait_for(TaskState::is_terminal).await.is_err() {
                return Err(TaskFailure::Cancelled);
            }
        }
    }
}
