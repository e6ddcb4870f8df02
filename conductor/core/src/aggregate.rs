//! Result Aggregation
//!
//! Folds the outcomes of every provider invocation made for one task into a
//! single [`CompositeResult`], or into a typed [`TaskFailure`] when nothing
//! usable came back.
//!
//! Outputs are kept verbatim with attribution. No cross-provider synthesis
//! happens here; that is the caller's business.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::Domain;
use crate::error::TaskFailure;
use crate::provider::{
    ErrorClass, FailureReason, ProviderError, ProviderId, ProviderResponse, Usage,
};
use crate::task::{ExecutionMode, Task, TaskId};

/// Everything that happened with one provider for one task
#[derive(Clone, Debug)]
pub struct ProviderOutcome {
    /// Provider invoked (or skipped)
    pub provider: ProviderId,
    /// Calls made, including retries (0 = skipped)
    pub attempts: u32,
    /// Wall time spent on this provider
    pub latency: Duration,
    /// Final result after retries
    pub result: Result<ProviderResponse, ProviderError>,
}

impl ProviderOutcome {
    /// Provider skipped because its circuit is open
    #[must_use]
    pub fn skipped(provider: ProviderId) -> Self {
        let message = format!("circuit open for {provider}");
        Self {
            provider,
            attempts: 0,
            latency: Duration::ZERO,
            result: Err(ProviderError::new(FailureReason::CircuitOpen, message)),
        }
    }

    /// Whether the provider produced output
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// One provider's output, with attribution
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttributedOutput {
    /// Provider that produced it
    pub provider: ProviderId,
    /// Model that produced it
    pub model: String,
    /// Output text, verbatim
    pub text: String,
    /// Token usage
    pub usage: Usage,
    /// Time spent on this provider, retries included
    pub latency_ms: u64,
    /// Calls made
    pub attempts: u32,
}

/// One provider's failure, as reported to the caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    /// Provider that failed
    pub provider: ProviderId,
    /// Why
    pub reason: FailureReason,
    /// Transient, permanent or auth
    pub class: ErrorClass,
    /// Provider-specific detail
    pub message: String,
    /// Calls made (0 = skipped)
    pub attempts: u32,
}

impl ProviderFailure {
    fn from_error(provider: ProviderId, error: ProviderError, attempts: u32) -> Self {
        Self {
            provider,
            reason: error.reason,
            class: error.class(),
            message: error.message,
            attempts,
        }
    }
}

/// Completion status of a composite result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CompositeStatus {
    /// Every invoked provider contributed (single mode: the chain found one)
    Complete,
    /// Multi mode: at least one provider succeeded and at least one did not
    PartialFailure,
}

/// Aggregated outcome of a task
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompositeResult {
    /// Task this result belongs to
    pub task_id: TaskId,
    /// Task domain
    pub domain: Domain,
    /// Execution mode used
    pub mode: ExecutionMode,
    /// Complete or partial
    pub status: CompositeStatus,
    /// Successful outputs, in chain order
    pub outputs: Vec<AttributedOutput>,
    /// Failures, in chain order (diagnostics in single mode)
    pub failures: Vec<ProviderFailure>,
    /// When the result was assembled
    pub completed_at: DateTime<Utc>,
}

impl CompositeResult {
    /// First output (the only one in single mode)
    #[must_use]
    pub fn primary(&self) -> Option<&AttributedOutput> {
        self.outputs.first()
    }

    /// Whether some providers failed
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.status == CompositeStatus::PartialFailure
    }

    /// Providers that contributed output
    #[must_use]
    pub fn contributors(&self) -> Vec<&ProviderId> {
        self.outputs.iter().map(|o| &o.provider).collect()
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Builds composite results from provider outcomes
#[derive(Clone, Copy, Debug, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    /// Fold outcomes (in chain order) into a result or a typed failure
    pub fn aggregate(
        &self,
        task: &Task,
        outcomes: Vec<ProviderOutcome>,
    ) -> Result<CompositeResult, TaskFailure> {
        let mut outputs = Vec::new();
        let mut failures = Vec::new();

        for outcome in outcomes {
            let latency_ms = u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX);
            match outcome.result {
                Ok(response) => outputs.push(AttributedOutput {
                    provider: outcome.provider,
                    model: response.model,
                    text: response.text,
                    usage: response.usage,
                    latency_ms,
                    attempts: outcome.attempts,
                }),
                Err(error) => failures.push(ProviderFailure::from_error(
                    outcome.provider,
                    error,
                    outcome.attempts,
                )),
            }
        }

        if outputs.is_empty() {
            return Err(match task.mode {
                ExecutionMode::Single => TaskFailure::ProviderChainExhausted { failures },
                ExecutionMode::Multi => TaskFailure::AllProvidersFailed { failures },
            });
        }

        let status = match task.mode {
            ExecutionMode::Single => CompositeStatus::Complete,
            ExecutionMode::Multi if failures.is_empty() => CompositeStatus::Complete,
            ExecutionMode::Multi => CompositeStatus::PartialFailure,
        };

        Ok(CompositeResult {
            task_id: task.id.clone(),
            domain: task.domain,
            mode: task.mode,
            status,
            outputs,
            failures,
            completed_at: Utc::now(),
        })
    }
}
