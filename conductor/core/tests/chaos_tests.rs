//! Chaos tests for the orchestration core
//!
//! Each scenario injects a failure mode and checks the one guarantee that
//! matters most: every accepted task reaches a terminal state, and the
//! orchestrator's counters account for all of them.
//!
//! Scenarios:
//! - Providers failing intermittently under mixed load
//! - A provider that hangs forever
//! - Shutdown while tasks are in flight
//! - Concurrent submission and cancellation from many tasks

use std::sync::Arc;
use std::time::Duration;

use operator_conductor::{
    CancelDisposition, CircuitState, CompositeStatus, Domain, ExecutionMode, ExecutionPolicy,
    FailureReason, MetricsSnapshot, Orchestrator, OrchestratorConfig, ProviderId,
    ProviderRegistry, RetryPolicy, ScriptedProvider, SubmitError, TaskHandle, TaskRequest,
    TaskState,
};

fn finished(metrics: &MetricsSnapshot) -> u64 {
    metrics.completed + metrics.partial + metrics.failed + metrics.timed_out + metrics.cancelled
}

fn quick_policy() -> ExecutionPolicy {
    ExecutionPolicy::default()
        .with_call_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy {
            use_jitter: false,
            ..RetryPolicy::default()
        })
}

async fn wait_for_running(handles: &[TaskHandle], count: usize) {
    for _ in 0..1_000 {
        let running = handles
            .iter()
            .filter(|h| h.state() == TaskState::Running)
            .count();
        if running >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("fewer than {count} tasks started");
}

// =============================================================================
// Chaos Test 1: Intermittent Provider Failures
// =============================================================================

/// Providers alternate between transient failures, permanent failures and
/// success while tasks of every mode and priority compete for four workers.
#[tokio::test(start_paused = true)]
async fn chaos_intermittent_failures_every_task_terminates() {
    let mut alpha = ScriptedProvider::new("alpha").with_latency(Duration::from_millis(30));
    let mut beta = ScriptedProvider::new("beta").with_latency(Duration::from_millis(70));
    for i in 0..40 {
        alpha = if i % 3 == 0 {
            alpha.then_fail(FailureReason::RateLimited)
        } else {
            alpha.then_succeed(format!("alpha {i}"))
        };
        beta = if i % 4 == 0 {
            beta.then_fail(FailureReason::InvalidRequest)
        } else {
            beta.then_succeed(format!("beta {i}"))
        };
    }
    let gamma = ScriptedProvider::new("gamma").always_fail(FailureReason::ServerError);

    let registry = ProviderRegistry::builder()
        .provider(Arc::new(alpha))
        .provider(Arc::new(beta))
        .provider(Arc::new(gamma))
        .chain(Domain::Financial, ["gamma", "alpha", "beta"])
        .chain(Domain::General, ["alpha", "beta"])
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default()
            .with_workers(4)
            .with_policy(quick_policy()),
        registry,
    );
    orchestrator.start();

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let mut request = TaskRequest::new(format!("task {i}"))
                .with_priority(i % 5)
                .with_domain(if i % 2 == 0 {
                    Domain::Financial
                } else {
                    Domain::General
                });
            if i % 3 == 0 {
                request = request.with_mode(ExecutionMode::Multi);
            }
            orchestrator.submit(request).unwrap()
        })
        .collect();

    for handle in &handles {
        let _ = handle.wait().await;
        assert!(handle.state().is_terminal(), "{} not terminal", handle.id());
    }

    let metrics = orchestrator.metrics();
    assert_eq!(metrics.submitted, 40);
    assert_eq!(finished(&metrics), 40);
    assert!(metrics.peak_running <= 4);
    assert!(metrics.fallbacks > 0);
    assert_eq!(orchestrator.queue_status().queued, 0);

    orchestrator.shutdown().await;
}

// =============================================================================
// Chaos Test 2: Provider Hang
// =============================================================================

/// A provider that never answers is cut off by the per-call timeout, then by
/// its circuit breaker, while the healthy provider keeps answering.
#[tokio::test(start_paused = true)]
async fn chaos_provider_hang() {
    let healthy = Arc::new(ScriptedProvider::new("healthy"));
    let hung = Arc::new(ScriptedProvider::new("hung").with_latency(Duration::from_secs(3600)));
    let registry = ProviderRegistry::builder()
        .provider(healthy.clone())
        .provider(hung.clone())
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default()
            .with_workers(1)
            .with_policy(quick_policy()),
        registry,
    );
    orchestrator.start();

    for i in 0..5 {
        let handle = orchestrator
            .submit(TaskRequest::new(format!("q{i}")).with_mode(ExecutionMode::Multi))
            .unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, CompositeStatus::PartialFailure);
        assert_eq!(result.outputs[0].provider, ProviderId::from("healthy"));
    }

    // two timed-out attempts per task until the fifth failure opens the circuit
    assert_eq!(hung.call_count(), 5);
    assert_eq!(healthy.call_count(), 5);
    assert_eq!(
        orchestrator.registry().health().circuit_state(&ProviderId::from("hung")),
        CircuitState::Open
    );

    orchestrator.shutdown().await;
}

// =============================================================================
// Chaos Test 3: Shutdown Mid-Flight
// =============================================================================

/// Shutdown lets running tasks finish and cancels everything still queued.
#[tokio::test(start_paused = true)]
async fn chaos_shutdown_mid_flight() {
    let slow = Arc::new(ScriptedProvider::new("slow").with_latency(Duration::from_secs(1)));
    let registry = ProviderRegistry::builder()
        .provider(slow.clone())
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default().with_workers(2),
        registry,
    );
    orchestrator.start();

    let handles: Vec<_> = (0..6)
        .map(|i| orchestrator.submit(TaskRequest::new(format!("t{i}"))).unwrap())
        .collect();
    wait_for_running(&handles, 2).await;

    orchestrator.shutdown().await;

    let completed = handles
        .iter()
        .filter(|h| h.state() == TaskState::Completed)
        .count();
    let cancelled = handles
        .iter()
        .filter(|h| h.state() == TaskState::Cancelled)
        .count();
    assert_eq!(completed, 2);
    assert_eq!(cancelled, 4);
    assert_eq!(slow.call_count(), 2);

    assert_eq!(
        orchestrator.submit(TaskRequest::new("late")).unwrap_err(),
        SubmitError::ShuttingDown
    );
    let metrics = orchestrator.metrics();
    assert_eq!(finished(&metrics), 6);
    assert_eq!(metrics.rejected, 1);
}

// =============================================================================
// Chaos Test 4: Concurrent Submission and Cancellation
// =============================================================================

/// Many submitters race each other and the workers; some cancel their tasks
/// immediately. Nothing is lost and cancellations are honored.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_concurrent_submit_and_cancel() {
    let registry = ProviderRegistry::builder()
        .provider(Arc::new(
            ScriptedProvider::new("echo").with_latency(Duration::from_millis(2)),
        ))
        .build()
        .unwrap();
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorConfig::default().with_workers(3),
        registry,
    ));
    orchestrator.start();

    let mut submitters = Vec::new();
    for s in 0..4 {
        let orchestrator = orchestrator.clone();
        submitters.push(tokio::spawn(async move {
            let mut results = Vec::new();
            for i in 0..25 {
                let handle = orchestrator
                    .submit(TaskRequest::new(format!("s{s} t{i}")).with_priority(i % 3))
                    .unwrap();
                let disposition = if i % 3 == 0 {
                    orchestrator.cancel(handle.id()).ok()
                } else {
                    None
                };
                results.push((handle, disposition));
                tokio::task::yield_now().await;
            }
            results
        }));
    }

    let mut all = Vec::new();
    for submitter in submitters {
        all.extend(submitter.await.unwrap());
    }
    for (handle, disposition) in &all {
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("task never finished");
        match disposition {
            Some(CancelDisposition::Cancelled | CancelDisposition::Requested) => {
                assert!(outcome.is_err(), "{} ran despite cancellation", handle.id());
                assert_eq!(handle.state(), TaskState::Cancelled);
            }
            _ => assert!(handle.state().is_terminal()),
        }
    }

    let metrics = orchestrator.metrics();
    assert_eq!(metrics.submitted, 100);
    assert_eq!(finished(&metrics), 100);
    assert!(metrics.peak_running <= 3);

    orchestrator.shutdown().await;
}
