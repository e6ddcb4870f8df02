//! Scripted Provider
//!
//! An in-process provider whose behavior is fully scripted. It backs the
//! offline `echo` provider kind and is the test double for everything that
//! sits above [`ProviderClient`].
//!
//! # Example
//!
//! ```rust,ignore
//! let flaky = ScriptedProvider::new("grok")
//!     .then_fail(FailureReason::ServerError)
//!     .then_succeed("recovered");
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{FailureReason, ProviderClient, ProviderError, ProviderId, ProviderResponse};
use crate::task::Payload;

/// What a single invocation does
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Answer with fixed text
    Succeed(String),
    /// Answer with `[<id>] <prompt>`
    Echo,
    /// Fail with the given reason
    Fail(FailureReason),
    /// Wait, then perform the inner step
    Delay(Duration, Box<ScriptStep>),
}

/// Provider driven by a queue of [`ScriptStep`]s
pub struct ScriptedProvider {
    id: ProviderId,
    model: String,
    /// Steps consumed one per call, in order
    script: Mutex<VecDeque<ScriptStep>>,
    /// Behavior once the script is empty
    default_step: ScriptStep,
    /// Added before every call
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    history: Mutex<Vec<Payload>>,
}

impl ScriptedProvider {
    /// Create a provider that echoes every prompt
    pub fn new(id: impl Into<ProviderId>) -> Self {
        Self {
            id: id.into(),
            model: "scripted".to_string(),
            script: Mutex::new(VecDeque::new()),
            default_step: ScriptStep::Echo,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Set the reported model name
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Delay every call by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer with `text` once the script is exhausted
    #[must_use]
    pub fn always_succeed(mut self, text: impl Into<String>) -> Self {
        self.default_step = ScriptStep::Succeed(text.into());
        self
    }

    /// Fail with `reason` once the script is exhausted
    #[must_use]
    pub fn always_fail(mut self, reason: FailureReason) -> Self {
        self.default_step = ScriptStep::Fail(reason);
        self
    }

    /// Append a step
    #[must_use]
    pub fn then(self, step: ScriptStep) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Append a success
    #[must_use]
    pub fn then_succeed(self, text: impl Into<String>) -> Self {
        self.then(ScriptStep::Succeed(text.into()))
    }

    /// Append a failure
    #[must_use]
    pub fn then_fail(self, reason: FailureReason) -> Self {
        self.then(ScriptStep::Fail(reason))
    }

    /// Number of invocations so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous invocations observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Payloads received, in call order
    pub fn requests(&self) -> Vec<Payload> {
        self.history.lock().clone()
    }

    fn next_step(&self) -> ScriptStep {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone())
    }

    async fn perform(&self, step: ScriptStep, payload: &Payload) -> Result<ProviderResponse, ProviderError> {
        let mut step = step;
        loop {
            match step {
                ScriptStep::Succeed(text) => {
                    return Ok(ProviderResponse::new(text, self.model.clone()));
                }
                ScriptStep::Echo => {
                    let text = format!("[{}] {}", self.id, payload.prompt);
                    return Ok(ProviderResponse::new(text, self.model.clone()));
                }
                ScriptStep::Fail(reason) => {
                    return Err(ProviderError::new(
                        reason,
                        format!("scripted failure from {}", self.id),
                    ));
                }
                ScriptStep::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
            }
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn kind(&self) -> &'static str {
        "echo"
    }

    async fn invoke(
        &self,
        payload: &Payload,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(payload.clone());

        // The guard also runs when the caller drops this future on timeout
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let step = self.next_step();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.perform(step, payload).await
    }
}
