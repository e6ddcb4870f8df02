//! Error Taxonomy
//!
//! - [`SubmitError`]: a task was never accepted
//! - [`TaskFailure`]: an accepted task ended without a composite result
//! - [`CancelError`]: a cancellation request could not be honored
//! - [`TransitionError`]: an illegal lifecycle transition was attempted
//!
//! Partial failure is not an error: it is a [`crate::CompositeResult`] whose
//! status is `PartialFailure`.

use serde::Serialize;

use crate::aggregate::ProviderFailure;
use crate::provider::{ErrorClass, ProviderId};
use crate::task::{TaskId, TaskState};

/// Rejection at submission time. The task never enters the queue.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Queue is at capacity; apply backpressure
    #[error("Dispatch queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity
        capacity: usize,
    },

    /// Deadline already passed
    #[error("Task deadline has already passed")]
    DeadlineExceeded,

    /// Orchestrator is shutting down or not started
    #[error("Orchestrator is not accepting tasks")]
    ShuttingDown,

    /// Task names a provider that is not configured
    #[error("Unknown provider: {0}")]
    UnknownProvider(ProviderId),
}

/// Terminal failure of an accepted task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// Single mode: every candidate in the chain failed or was skipped
    #[error("Provider chain exhausted ({} providers failed)", .failures.len())]
    ProviderChainExhausted {
        /// One entry per attempted (or skipped) provider
        failures: Vec<ProviderFailure>,
    },

    /// Multi mode: no provider succeeded
    #[error("All {} providers failed", .failures.len())]
    AllProvidersFailed {
        /// One entry per provider
        failures: Vec<ProviderFailure>,
    },

    /// Deadline passed while queued or running
    #[error("Task deadline exceeded")]
    DeadlineExceeded {
        /// Provider failures observed before the deadline
        failures: Vec<ProviderFailure>,
    },

    /// Cancelled by the caller
    #[error("Task cancelled")]
    Cancelled,
}

impl TaskFailure {
    /// Provider diagnostics carried by this failure
    #[must_use]
    pub fn failures(&self) -> &[ProviderFailure] {
        match self {
            Self::ProviderChainExhausted { failures }
            | Self::AllProvidersFailed { failures }
            | Self::DeadlineExceeded { failures } => failures,
            Self::Cancelled => &[],
        }
    }

    /// Lifecycle state a task with this failure ends in
    #[must_use]
    pub fn terminal_state(&self) -> TaskState {
        match self {
            Self::ProviderChainExhausted { .. } | Self::AllProvidersFailed { .. } => {
                TaskState::Failed
            }
            Self::DeadlineExceeded { .. } => TaskState::TimedOut,
            Self::Cancelled => TaskState::Cancelled,
        }
    }

    /// Whether every provider failure is transient ("temporarily
    /// unavailable" rather than "misconfigured")
    #[must_use]
    pub fn is_transient(&self) -> bool {
        let failures = self.failures();
        !failures.is_empty() && failures.iter().all(|f| f.class == ErrorClass::Transient)
    }
}

/// Cancellation could not be honored
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    /// No such task (never submitted, or already taken/pruned)
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// Task already reached a terminal state
    #[error("Task already finished ({state})")]
    AlreadyFinished {
        /// Terminal state
        state: TaskState,
    },
}

/// Illegal lifecycle transition
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Invalid task transition {from} -> {to}")]
pub struct TransitionError {
    /// Current state
    pub from: TaskState,
    /// Rejected target state
    pub to: TaskState,
}
