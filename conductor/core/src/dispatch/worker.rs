//! Worker Pool
//!
//! A fixed set of tokio tasks sharing one [`PriorityDispatchQueue`]. Each
//! worker owns the task it dequeued from start to finish:
//!
//! ```text
//! dequeue ─► Dispatched ─► (cancelled? expired?) ─► Running ─► execute ─► terminal
//! ```
//!
//! At most one task runs per worker, so the number of running tasks never
//! exceeds the pool size.
//!
//! [`TaskExecutor`] holds the execution rules:
//! - **single**: walk the chain; first success wins; failures fall through
//! - **multi**: invoke every healthy candidate concurrently (bounded by the
//!   fan-out limit) and keep every outcome

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::aggregate::{CompositeResult, ProviderOutcome, ResultAggregator};
use crate::dispatch::queue::PriorityDispatchQueue;
use crate::dispatch::record::{TaskOutcome, TaskRecord};
use crate::error::TaskFailure;
use crate::provider::{FailureReason, ProviderClient, ProviderError, ProviderId};
use crate::routing::{ExecutionPolicy, OrchestratorMetrics, ProviderRegistry, Resolution};
use crate::task::{ExecutionMode, Task, TaskState};

// ============================================================================
// Task Executor
// ============================================================================

/// Runs one task against the registry under an [`ExecutionPolicy`]
pub struct TaskExecutor {
    registry: Arc<ProviderRegistry>,
    policy: ExecutionPolicy,
    aggregator: ResultAggregator,
    metrics: Arc<OrchestratorMetrics>,
}

impl TaskExecutor {
    /// Create an executor
    pub fn new(
        registry: Arc<ProviderRegistry>,
        policy: ExecutionPolicy,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            registry,
            policy,
            aggregator: ResultAggregator,
            metrics,
        }
    }

    /// Execution policy in force
    #[must_use]
    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Run a task that is already `Running`
    pub async fn execute(&self, record: &TaskRecord) -> Result<CompositeResult, TaskFailure> {
        let task = record.task();
        let resolution = self
            .registry
            .resolve_for(task.domain, &task.requested_providers);

        if resolution.is_empty() {
            tracing::warn!(
                task_id = %task.id,
                domain = %task.domain,
                excluded = ?resolution.excluded,
                "No healthy provider available, failing fast"
            );
        }

        let executed = match task.mode {
            ExecutionMode::Single => self.run_chain(record, &resolution.eligible).await?,
            ExecutionMode::Multi => self.run_fan_out(record, &resolution.eligible).await,
        };
        let outcomes = merge_skipped(task.mode, &resolution, executed);

        match self.aggregator.aggregate(task, outcomes) {
            Err(
                TaskFailure::ProviderChainExhausted { failures }
                | TaskFailure::AllProvidersFailed { failures },
            ) if task.is_expired_at(Instant::now()) => {
                Err(TaskFailure::DeadlineExceeded { failures })
            }
            other => other,
        }
    }

    async fn run_chain(
        &self,
        record: &TaskRecord,
        chain: &[Arc<dyn ProviderClient>],
    ) -> Result<Vec<ProviderOutcome>, TaskFailure> {
        let task = record.task();
        let mut outcomes: Vec<ProviderOutcome> = Vec::with_capacity(chain.len());

        for provider in chain {
            if record.cancel_requested() {
                return Err(TaskFailure::Cancelled);
            }
            if task.is_expired_at(Instant::now()) {
                break;
            }
            if let Some(previous) = outcomes.last() {
                self.metrics.fallbacks.inc();
                tracing::warn!(
                    task_id = %task.id,
                    from = %previous.provider,
                    to = %provider.id(),
                    "Falling back to next provider"
                );
            }

            let outcome = self.invoke_with_retry(task, provider.as_ref()).await;
            let succeeded = outcome.is_success();
            outcomes.push(outcome);
            if succeeded {
                break;
            }
        }

        Ok(outcomes)
    }

    async fn run_fan_out(
        &self,
        record: &TaskRecord,
        candidates: &[Arc<dyn ProviderClient>],
    ) -> Vec<ProviderOutcome> {
        let task = record.task();
        let mut calls = Vec::with_capacity(candidates.len());
        for provider in candidates {
            calls.push(self.invoke_with_retry(task, provider.as_ref()));
        }
        futures::stream::iter(calls)
            .buffered(self.policy.fan_out_limit.max(1))
            .collect()
            .await
    }

    /// Invoke one provider, retrying transient failures per policy
    async fn invoke_with_retry(&self, task: &Task, provider: &dyn ProviderClient) -> ProviderOutcome {
        let id = provider.id().clone();
        let health = self.registry.health();
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut retries = 0u32;

        let result = loop {
            let Some(timeout) = self
                .policy
                .call_timeout_within(task.deadline, Instant::now())
            else {
                break Err(ProviderError::new(
                    FailureReason::Timeout,
                    "task deadline reached before the call",
                ));
            };

            let admission = health.try_admit(&id);
            if !admission.is_admitted() {
                if attempts == 0 {
                    return ProviderOutcome::skipped(id);
                }
                break Err(ProviderError::new(
                    FailureReason::CircuitOpen,
                    format!("circuit opened for {id} during retries"),
                ));
            }

            attempts += 1;
            self.metrics.provider_calls.inc();
            let call_started = Instant::now();
            let result =
                match tokio::time::timeout(timeout, provider.invoke(&task.payload, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(timeout)),
                };
            let latency = call_started.elapsed();
            health.record(&id, admission, result.is_ok(), latency);

            let error = match result {
                Ok(response) => {
                    tracing::debug!(
                        task_id = %task.id,
                        provider = %id,
                        attempt = attempts,
                        latency_ms = latency.as_millis() as u64,
                        "Provider call succeeded"
                    );
                    break Ok(response);
                }
                Err(error) => error,
            };

            if !self.policy.retry.should_retry(&error, retries) {
                tracing::warn!(
                    task_id = %task.id,
                    provider = %id,
                    attempt = attempts,
                    class = %error.class(),
                    error = %error,
                    "Provider call failed"
                );
                break Err(error);
            }

            let backoff = self.policy.retry.backoff_for_attempt(retries);
            if task
                .deadline
                .is_some_and(|deadline| Instant::now() + backoff >= deadline)
            {
                break Err(error);
            }

            retries += 1;
            self.metrics.retries.inc();
            tracing::warn!(
                task_id = %task.id,
                provider = %id,
                attempt = attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Transient provider failure, retrying"
            );
            tokio::time::sleep(backoff).await;
        };

        ProviderOutcome {
            provider: id,
            attempts,
            latency: started.elapsed(),
            result,
        }
    }
}

/// Put open-circuit skips back at their chain positions
///
/// A single-mode chain stops at its first success, so skips behind the
/// winner were never reached and are dropped.
fn merge_skipped(
    mode: ExecutionMode,
    resolution: &Resolution,
    executed: Vec<ProviderOutcome>,
) -> Vec<ProviderOutcome> {
    let rank = |id: &ProviderId| resolution.position(id).unwrap_or(usize::MAX);
    let cutoff = match mode {
        ExecutionMode::Single => executed
            .iter()
            .find(|outcome| outcome.is_success())
            .map(|winner| rank(&winner.provider)),
        ExecutionMode::Multi => None,
    };

    let mut outcomes = executed;
    outcomes.extend(
        resolution
            .excluded
            .iter()
            .filter(|id| cutoff.map_or(true, |limit| rank(id) < limit))
            .cloned()
            .map(ProviderOutcome::skipped),
    );
    outcomes.sort_by_key(|outcome| rank(&outcome.provider));
    outcomes
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Fixed-size pool of workers draining a [`PriorityDispatchQueue`]
pub struct WorkerPool {
    queue: Arc<PriorityDispatchQueue>,
    executor: Arc<TaskExecutor>,
    metrics: Arc<OrchestratorMetrics>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: AtomicUsize,
}

impl WorkerPool {
    /// Create an idle pool
    pub fn new(
        queue: Arc<PriorityDispatchQueue>,
        executor: Arc<TaskExecutor>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            queue,
            executor,
            metrics,
            handles: Mutex::new(Vec::new()),
            size: AtomicUsize::new(0),
        }
    }

    /// Spawn `n` workers. Does nothing if the pool is already running.
    pub fn start(&self, n: usize) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            tracing::warn!(workers = handles.len(), "Worker pool already started");
            return;
        }

        let n = n.max(1);
        for worker_id in 0..n {
            let worker = Worker {
                id: worker_id,
                queue: self.queue.clone(),
                executor: self.executor.clone(),
                metrics: self.metrics.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        self.size.store(n, Ordering::Release);
        tracing::info!(workers = n, "Worker pool started");
    }

    /// Stop dequeuing and wait for in-flight tasks to finish
    pub async fn stop(&self) {
        self.queue.close();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker terminated abnormally");
            }
        }
        self.size.store(0, Ordering::Release);
        tracing::info!("Worker pool stopped");
    }

    /// Number of workers
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }
}

struct Worker {
    id: usize,
    queue: Arc<PriorityDispatchQueue>,
    executor: Arc<TaskExecutor>,
    metrics: Arc<OrchestratorMetrics>,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker = self.id, "Worker started");
        while let Some(record) = self.queue.dequeue().await {
            self.process(&record).await;
        }
        tracing::debug!(worker = self.id, "Worker exiting");
    }

    async fn process(&self, record: &TaskRecord) {
        // Lost a race with cancellation
        if record.transition(TaskState::Dispatched).is_err() {
            return;
        }

        let task = record.task();
        let outcome: TaskOutcome = if record.cancel_requested() {
            Err(TaskFailure::Cancelled)
        } else if task.is_expired_at(Instant::now()) {
            Err(TaskFailure::DeadlineExceeded {
                failures: Vec::new(),
            })
        } else if record.transition(TaskState::Running).is_err() {
            return;
        } else {
            self.metrics.running.inc();
            tracing::debug!(
                worker = self.id,
                task_id = %task.id,
                priority = task.priority,
                domain = %task.domain,
                "Task running"
            );
            let result = self.executor.execute(record).await;
            self.metrics.running.dec();
            result.map(Arc::new)
        };

        self.finish(record, outcome);
    }

    fn finish(&self, record: &TaskRecord, outcome: TaskOutcome) {
        let task = record.task();
        let partial = matches!(&outcome, Ok(result) if result.is_partial());

        match record.finish(outcome) {
            Ok(state) => {
                let elapsed = task.submitted_at.elapsed();
                self.metrics
                    .task_latency
                    .record(elapsed.as_millis() as f64);
                match state {
                    TaskState::Completed if partial => self.metrics.partial.inc(),
                    TaskState::Completed => self.metrics.completed.inc(),
                    TaskState::Failed => self.metrics.failed.inc(),
                    TaskState::TimedOut => self.metrics.timed_out.inc(),
                    TaskState::Cancelled => self.metrics.cancelled.inc(),
                    _ => {}
                }
                tracing::info!(
                    worker = self.id,
                    task_id = %task.id,
                    state = %state,
                    partial,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task finished"
                );
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Could not record task outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::Domain;
    use crate::provider::{ProviderId, ScriptedProvider};
    use crate::routing::{CircuitState, RetryPolicy};
    use crate::task::TaskRequest;

    fn executor(registry: ProviderRegistry, retry: RetryPolicy) -> TaskExecutor {
        TaskExecutor::new(
            Arc::new(registry),
            ExecutionPolicy::default()
                .with_call_timeout(Duration::from_secs(5))
                .with_retry(RetryPolicy {
                    use_jitter: false,
                    ..retry
                }),
            Arc::new(OrchestratorMetrics::default()),
        )
    }

    fn running(request: TaskRequest) -> TaskRecord {
        let record = TaskRecord::new(Task::from_request(request), 1);
        record.transition(TaskState::Dispatched).unwrap();
        record.transition(TaskState::Running).unwrap();
        record
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_once() {
        let flaky = Arc::new(
            ScriptedProvider::new("flaky")
                .then_fail(FailureReason::RateLimited)
                .then_succeed("ok"),
        );
        let registry = ProviderRegistry::builder()
            .provider(flaky.clone())
            .build()
            .unwrap();
        let executor = executor(registry, RetryPolicy::default());

        let record = running(TaskRequest::new("q"));
        let result = executor.execute(&record).await.unwrap();

        assert_eq!(flaky.call_count(), 2);
        assert_eq!(result.outputs[0].attempts, 2);
        assert!(result.failures.is_empty());
        assert_eq!(executor.metrics.retries.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let broken = Arc::new(ScriptedProvider::new("broken").always_fail(FailureReason::Unauthorized));
        let backup = Arc::new(ScriptedProvider::new("backup"));
        let registry = ProviderRegistry::builder()
            .provider(broken.clone())
            .provider(backup.clone())
            .chain(Domain::General, ["broken", "backup"])
            .build()
            .unwrap();
        let executor = executor(registry, RetryPolicy::default());

        let record = running(TaskRequest::new("q").with_domain(Domain::General));
        let result = executor.execute(&record).await.unwrap();

        assert_eq!(broken.call_count(), 1);
        assert_eq!(result.primary().unwrap().provider, ProviderId::from("backup"));
        assert_eq!(result.failures[0].reason, FailureReason::Unauthorized);
        assert_eq!(executor.metrics.fallbacks.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out_and_falls_through() {
        let slow = Arc::new(ScriptedProvider::new("slow").with_latency(Duration::from_secs(60)));
        let fast = Arc::new(ScriptedProvider::new("fast").always_succeed("quick"));
        let registry = ProviderRegistry::builder()
            .provider(slow.clone())
            .provider(fast)
            .build()
            .unwrap();
        let executor = executor(registry, RetryPolicy::no_retries());

        let record = running(TaskRequest::new("q"));
        let result = executor.execute(&record).await.unwrap();

        assert_eq!(result.primary().unwrap().text, "quick");
        assert_eq!(result.failures[0].reason, FailureReason::Timeout);
        assert_eq!(result.failures[0].provider, ProviderId::from("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_respects_limit() {
        let ids = ["a", "b", "c"];
        let mut builder = ProviderRegistry::builder();
        for id in ids {
            builder = builder
                .provider(Arc::new(ScriptedProvider::new(id).with_latency(Duration::from_millis(100))));
        }
        let executor = TaskExecutor::new(
            Arc::new(builder.build().unwrap()),
            ExecutionPolicy::default().with_fan_out_limit(2),
            Arc::new(OrchestratorMetrics::default()),
        );

        let record = running(TaskRequest::new("q").with_mode(ExecutionMode::Multi));
        let started = Instant::now();
        let result = executor.execute(&record).await.unwrap();

        // two calls in the first wave, one in the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
        let providers: Vec<_> = result.outputs.iter().map(|o| o.provider.as_str()).collect();
        assert_eq!(providers, ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_mode_drops_duplicate_requests() {
        let a = Arc::new(ScriptedProvider::new("a"));
        let registry = ProviderRegistry::builder()
            .provider(a.clone())
            .build()
            .unwrap();
        let executor = executor(registry, RetryPolicy::default());

        let record = running(
            TaskRequest::new("q")
                .with_mode(ExecutionMode::Multi)
                .with_provider("a")
                .with_provider("a"),
        );
        let result = executor.execute(&record).await.unwrap();
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_chain_steps() {
        let failing = Arc::new(ScriptedProvider::new("failing").always_fail(FailureReason::InvalidRequest));
        let never = Arc::new(ScriptedProvider::new("never"));
        let registry = ProviderRegistry::builder()
            .provider(failing)
            .provider(never.clone())
            .build()
            .unwrap();
        let executor = executor(registry, RetryPolicy::default());

        let record = running(TaskRequest::new("q"));
        record.cancel();
        let failure = executor.execute(&record).await.unwrap_err();

        assert_eq!(failure, TaskFailure::Cancelled);
        assert_eq!(never.call_count(), 0);
    }

    fn open_circuit(registry: &ProviderRegistry, id: &str) {
        registry
            .health()
            .register(&ProviderId::from(id))
            .force_state(CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_mode_reports_only_skips_before_winner() {
        let first = Arc::new(ScriptedProvider::new("first"));
        let second = Arc::new(ScriptedProvider::new("second").always_succeed("answer"));
        let third = Arc::new(ScriptedProvider::new("third"));
        let registry = ProviderRegistry::builder()
            .provider(first.clone())
            .provider(second)
            .provider(third.clone())
            .chain(Domain::General, ["first", "second", "third"])
            .build()
            .unwrap();
        open_circuit(&registry, "first");
        open_circuit(&registry, "third");
        let executor = executor(registry, RetryPolicy::default());

        let record = running(TaskRequest::new("q").with_domain(Domain::General));
        let result = executor.execute(&record).await.unwrap();

        assert_eq!(result.primary().unwrap().provider, ProviderId::from("second"));
        let failed: Vec<_> = result.failures.iter().map(|f| f.provider.as_str()).collect();
        assert_eq!(failed, ["first"]);
        assert_eq!(result.failures[0].reason, FailureReason::CircuitOpen);
        assert_eq!(result.failures[0].attempts, 0);
        assert_eq!(first.call_count() + third.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_mode_failures_in_chain_order() {
        let registry = ProviderRegistry::builder()
            .provider(Arc::new(ScriptedProvider::new("a")))
            .provider(Arc::new(ScriptedProvider::new("b")))
            .provider(Arc::new(
                ScriptedProvider::new("c").always_fail(FailureReason::InvalidRequest),
            ))
            .provider(Arc::new(ScriptedProvider::new("d")))
            .chain(Domain::General, ["c", "a", "b", "d"])
            .build()
            .unwrap();
        open_circuit(&registry, "b");
        open_circuit(&registry, "d");
        let executor = executor(registry, RetryPolicy::default());

        let record = running(
            TaskRequest::new("q")
                .with_domain(Domain::General)
                .with_mode(ExecutionMode::Multi),
        );
        let result = executor.execute(&record).await.unwrap();

        let failed: Vec<_> = result
            .failures
            .iter()
            .map(|f| (f.provider.as_str(), f.reason))
            .collect();
        assert_eq!(
            failed,
            [
                ("c", FailureReason::InvalidRequest),
                ("b", FailureReason::CircuitOpen),
                ("d", FailureReason::CircuitOpen),
            ]
        );
        assert_eq!(result.outputs[0].provider, ProviderId::from("a"));
    }
}
