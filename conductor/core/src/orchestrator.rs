//! Orchestrator
//!
//! The submission API. Owns the dispatch queue, the worker pool and the
//! record of every task it accepted.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry);
//! orchestrator.start();
//!
//! let handle = orchestrator.submit(
//!     TaskRequest::new("Compare AAPL and MSFT")
//!         .with_domain(Domain::Financial)
//!         .with_mode(ExecutionMode::Multi),
//! )?;
//! let outcome = handle.wait().await;
//! ```
//!
//! Tasks submitted before [`Orchestrator::start`] wait in the queue.
//!
//! # Ordering
//!
//! Higher priority always wins the next free worker; there is no aging, so a
//! steady stream of urgent work can starve low-priority tasks indefinitely.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::dispatch::{
    CancelDisposition, PriorityDispatchQueue, TaskExecutor, TaskHandle, TaskOutcome,
    TaskProgress, TaskRecord, WorkerPool,
};
use crate::error::{CancelError, SubmitError};
use crate::routing::{
    ExecutionPolicy, HealthSnapshot, MetricsSnapshot, OrchestratorMetrics, ProviderRegistry,
};
use crate::task::{Task, TaskId, TaskRequest, TaskState};

// ============================================================================
// Configuration
// ============================================================================

/// Runtime parameters of an orchestrator
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    /// Worker pool size (maximum concurrently running tasks)
    pub workers: usize,
    /// Maximum queued tasks
    pub queue_capacity: usize,
    /// Timeouts, fan-out and retries
    pub policy: ExecutionPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 1000,
            policy: ExecutionPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Set the pool size
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the queue capacity
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the execution policy
    #[must_use]
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Answer to a result query
#[derive(Clone, Debug)]
pub enum ResultStatus {
    /// Not terminal yet
    Pending(TaskState),
    /// Terminal; the same outcome is returned on every call
    Finished(TaskOutcome),
}

impl ResultStatus {
    /// Outcome, if finished
    #[must_use]
    pub fn outcome(&self) -> Option<&TaskOutcome> {
        match self {
            Self::Finished(outcome) => Some(outcome),
            Self::Pending(_) => None,
        }
    }
}

/// Queue and pool occupancy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Tasks waiting
    pub queued: usize,
    /// Tasks running
    pub running: u64,
    /// Pool size
    pub workers: usize,
    /// Queue capacity
    pub capacity: usize,
    /// Whether submissions are accepted
    pub accepting: bool,
    /// Tasks whose records are retained
    pub tracked: usize,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Multi-provider task orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ProviderRegistry>,
    queue: Arc<PriorityDispatchQueue>,
    pool: WorkerPool,
    metrics: Arc<OrchestratorMetrics>,
    tasks: DashMap<TaskId, Arc<TaskRecord>>,
    sequence: AtomicU64,
    accepting: AtomicBool,
}

impl Orchestrator {
    /// Create an orchestrator. Workers are not started yet.
    pub fn new(config: OrchestratorConfig, registry: ProviderRegistry) -> Self {
        let registry = Arc::new(registry);
        let metrics = Arc::new(OrchestratorMetrics::default());
        let queue = Arc::new(PriorityDispatchQueue::new(config.queue_capacity));
        let executor = Arc::new(TaskExecutor::new(
            registry.clone(),
            config.policy.clone(),
            metrics.clone(),
        ));
        let pool = WorkerPool::new(queue.clone(), executor, metrics.clone());

        Self {
            config,
            registry,
            queue,
            pool,
            metrics,
            tasks: DashMap::new(),
            sequence: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    /// Spawn the worker pool
    pub fn start(&self) {
        self.pool.start(self.config.workers);
    }

    /// Configuration in force
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Provider registry
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Accept a task
    pub fn submit(&self, request: TaskRequest) -> Result<TaskHandle, SubmitError> {
        let result = self.try_submit(request);
        if let Err(ref e) = result {
            self.metrics.rejected.inc();
            tracing::warn!(error = %e, "Task rejected");
        }
        result
    }

    fn try_submit(&self, request: TaskRequest) -> Result<TaskHandle, SubmitError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        if let Some(unknown) = self.registry.find_unknown(&request.requested_providers) {
            return Err(SubmitError::UnknownProvider(unknown.clone()));
        }

        let task = Task::from_request(request);
        if task.is_expired_at(Instant::now()) {
            return Err(SubmitError::DeadlineExceeded);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        let record = Arc::new(TaskRecord::new(task, sequence));
        let id = record.id().clone();

        self.tasks.insert(id.clone(), record.clone());
        if let Err(e) = self.queue.enqueue(record.clone()) {
            self.tasks.remove(&id);
            return Err(e);
        }

        self.metrics.submitted.inc();
        let task = record.task();
        tracing::info!(
            task_id = %id,
            domain = %task.domain,
            priority = task.priority,
            mode = ?task.mode,
            "Task submitted"
        );
        Ok(TaskHandle::new(record))
    }

    /// Result of a task, or its pending state
    ///
    /// Idempotent: repeated calls after completion return the identical
    /// outcome. `None` for unknown (or already taken) tasks.
    #[must_use]
    pub fn result(&self, id: &TaskId) -> Option<ResultStatus> {
        let record = self.tasks.get(id)?.clone();
        Some(match record.outcome() {
            Some(outcome) => ResultStatus::Finished(outcome),
            None => ResultStatus::Pending(record.state()),
        })
    }

    /// Hand over a finished task's outcome and forget the task
    pub fn take_result(&self, id: &TaskId) -> Option<TaskOutcome> {
        let (_, record) = self
            .tasks
            .remove_if(id, |_, record| record.state().is_terminal())?;
        record.outcome()
    }

    /// Forget finished tasks older than `max_age`. Returns how many.
    pub fn prune_finished(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.tasks.len();
        self.tasks.retain(|_, record| {
            record
                .finished_at()
                .map_or(true, |at| now.saturating_duration_since(at) < max_age)
        });
        let pruned = before.saturating_sub(self.tasks.len());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned finished tasks");
        }
        pruned
    }

    /// Lifecycle details of a task
    #[must_use]
    pub fn task_status(&self, id: &TaskId) -> Option<TaskProgress> {
        self.tasks.get(id).map(|record| record.progress())
    }

    /// Cancel a task
    ///
    /// Queued tasks are cancelled immediately. Dispatched and running tasks
    /// are cancelled at the worker's next transition boundary.
    pub fn cancel(&self, id: &TaskId) -> Result<CancelDisposition, CancelError> {
        let record = self
            .tasks
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| CancelError::NotFound(id.clone()))?;

        match record.cancel() {
            CancelDisposition::Cancelled => {
                self.queue.remove(id);
                self.metrics.cancelled.inc();
                tracing::info!(task_id = %id, "Queued task cancelled");
                Ok(CancelDisposition::Cancelled)
            }
            CancelDisposition::Requested => {
                tracing::info!(task_id = %id, "Cancellation requested for in-flight task");
                Ok(CancelDisposition::Requested)
            }
            CancelDisposition::AlreadyFinished(state) => {
                Err(CancelError::AlreadyFinished { state })
            }
        }
    }

    /// Queue and pool occupancy
    #[must_use]
    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.queue.len(),
            running: self.metrics.running.get(),
            workers: self.pool.size(),
            capacity: self.queue.capacity(),
            accepting: self.accepting.load(Ordering::Acquire),
            tracked: self.tasks.len(),
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        let expired = self.queue.expired_count();
        if expired > 0 {
            snapshot.timed_out += expired;
            let succeeded = snapshot.completed + snapshot.partial;
            let finished = succeeded
                + snapshot.failed
                + snapshot.timed_out
                + snapshot.cancelled;
            snapshot.success_rate = succeeded as f64 / finished as f64;
        }
        snapshot
    }

    /// Health of every provider
    #[must_use]
    pub fn provider_status(&self) -> Vec<HealthSnapshot> {
        self.registry.health().snapshots()
    }

    /// Stop accepting tasks, let in-flight tasks finish, cancel the rest
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        tracing::info!("Orchestrator shutting down");

        self.pool.stop().await;

        let mut cancelled = 0usize;
        for record in self.queue.drain() {
            if record.cancel() == CancelDisposition::Cancelled {
                self.metrics.cancelled.inc();
                cancelled += 1;
            }
        }
        tracing::info!(cancelled, "Orchestrator stopped");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("queue_status", &self.queue_status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::provider::{FailureReason, ProviderId, ScriptedProvider};

    fn orchestrator(workers: usize) -> Orchestrator {
        let registry = ProviderRegistry::builder()
            .provider(Arc::new(ScriptedProvider::new("echo")))
            .build()
            .unwrap();
        Orchestrator::new(OrchestratorConfig::default().with_workers(workers), registry)
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let orchestrator = orchestrator(2);
        orchestrator.start();

        let handle = orchestrator
            .submit(TaskRequest::new("hello").with_domain(Domain::General))
            .unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.primary().unwrap().text, "[echo] hello");
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(orchestrator.metrics().completed, 1);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let orchestrator = orchestrator(1);
        let err = orchestrator
            .submit(TaskRequest::new("x").with_provider("ghost"))
            .unwrap_err();

        assert_eq!(err, SubmitError::UnknownProvider(ProviderId::from("ghost")));
        assert_eq!(orchestrator.metrics().rejected, 1);
        assert_eq!(orchestrator.queue_status().queued, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let orchestrator = orchestrator(1);
        let handle = orchestrator.submit(TaskRequest::new("x")).unwrap();

        assert_eq!(
            orchestrator.cancel(handle.id()),
            Ok(CancelDisposition::Cancelled)
        );
        assert_eq!(
            orchestrator.cancel(handle.id()),
            Err(CancelError::AlreadyFinished {
                state: TaskState::Cancelled
            })
        );
        assert_eq!(orchestrator.queue_status().queued, 0);
        assert!(matches!(
            handle.wait().await,
            Err(crate::error::TaskFailure::Cancelled)
        ));
        assert_eq!(
            orchestrator.cancel(&TaskId::new("missing")),
            Err(CancelError::NotFound(TaskId::new("missing")))
        );
    }

    #[tokio::test]
    async fn test_take_and_prune() {
        let orchestrator = orchestrator(1);
        orchestrator.start();

        let first = orchestrator.submit(TaskRequest::new("a")).unwrap();
        let second = orchestrator.submit(TaskRequest::new("b")).unwrap();
        first.wait().await.unwrap();
        second.wait().await.unwrap();

        assert!(orchestrator.take_result(first.id()).is_some());
        assert!(orchestrator.result(first.id()).is_none());
        assert!(orchestrator.take_result(first.id()).is_none());

        assert_eq!(orchestrator.prune_finished(Duration::ZERO), 1);
        assert!(orchestrator.result(second.id()).is_none());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_and_rejects_new() {
        let registry = ProviderRegistry::builder()
            .provider(Arc::new(
                ScriptedProvider::new("down").always_fail(FailureReason::InvalidRequest),
            ))
            .build()
            .unwrap();
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry);

        // never started: everything stays queued
        let handles: Vec<_> = (0..3)
            .map(|i| orchestrator.submit(TaskRequest::new(format!("t{i}"))).unwrap())
            .collect();

        orchestrator.shutdown().await;

        for handle in &handles {
            assert_eq!(handle.state(), TaskState::Cancelled);
        }
        assert_eq!(
            orchestrator.submit(TaskRequest::new("late")).unwrap_err(),
            SubmitError::ShuttingDown
        );
        assert!(!orchestrator.queue_status().accepting);
        assert_eq!(orchestrator.metrics().cancelled, 3);
    }
}
