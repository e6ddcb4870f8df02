//! Task Types
//!
//! A task is one unit of orchestrated work: a payload bound to a domain, a
//! priority, an execution mode and optionally a deadline and an explicit list
//! of providers.
//!
//! # Lifecycle
//!
//! ```text
//!            +-----------+
//!  submit -> |  Queued   | ------------------------------+
//!            +-----+-----+                               |
//!                  | dequeue                             |
//!            +-----v-----+                               |
//!            | Dispatched| ---------------------------+   |
//!            +-----+-----+                            |   |
//!                  | start                            v   v
//!            +-----v-----+                        +-----------+
//!            |  Running  | ---------------------> | Cancelled |
//!            +-----+-----+                        +-----------+
//!                  |
//!      +-----------+-----------+
//!      v           v           v
//!  Completed     Failed     TimedOut
//! ```
//!
//! Queued and Dispatched tasks may also time out. Terminal states are final.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::Domain;
use crate::provider::ProviderId;

/// Task identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique task ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a task uses its providers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Walk the fallback chain; the first provider that succeeds wins
    #[default]
    Single,
    /// Invoke every healthy candidate concurrently and keep all outputs
    Multi,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Lifecycle state of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting in the dispatch queue
    Queued,
    /// Taken by a worker, not yet calling providers
    Dispatched,
    /// Provider calls in progress
    Running,
    /// Finished with a composite result (possibly partial)
    Completed,
    /// Finished without any provider output
    Failed,
    /// Cancelled by the caller
    Cancelled,
    /// Deadline passed before the task could finish
    TimedOut,
}

impl TaskState {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether `next` is a legal successor of this state
    #[must_use]
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::{Cancelled, Completed, Dispatched, Failed, Queued, Running, TimedOut};

        matches!(
            (self, next),
            (Queued, Dispatched | Cancelled | TimedOut)
                | (Dispatched, Running | Cancelled | TimedOut)
                | (Running, Completed | Failed | TimedOut | Cancelled)
        )
    }

    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Dispatched => "Dispatched",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::TimedOut => "TimedOut",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Request data forwarded to providers unchanged
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// The user prompt
    pub prompt: String,
    /// Optional system instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Free-form context rendered ahead of the prompt
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    /// Maximum tokens in the response (provider default when `None`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Payload {
    /// Create a payload from a prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set system instructions
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Add a context entry
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Context lines followed by the prompt
    #[must_use]
    pub fn render_user_message(&self) -> String {
        let mut message = String::new();
        for (key, value) in &self.context {
            message.push_str(key);
            message.push_str(": ");
            message.push_str(value);
            message.push('\n');
        }
        if !message.is_empty() {
            message.push('\n');
        }
        message.push_str(&self.prompt);
        message
    }
}

/// A submission, before it is accepted
#[derive(Clone, Debug, Default)]
pub struct TaskRequest {
    /// Domain, or `None` to classify the prompt
    pub domain: Option<Domain>,
    /// Higher is more urgent
    pub priority: i32,
    /// Data forwarded to providers
    pub payload: Payload,
    /// Providers to invoke, in order (empty = domain chain)
    pub requested_providers: Vec<ProviderId>,
    /// Single or multi provider execution
    pub mode: ExecutionMode,
    /// Abandon the task if it has not finished by then
    pub deadline: Option<Instant>,
}

impl TaskRequest {
    /// Create a request for a prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self::with_payload(Payload::new(prompt))
    }

    /// Create a request for a full payload
    #[must_use]
    pub fn with_payload(payload: Payload) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Set the domain
    #[must_use]
    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the execution mode
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Request a provider (appended to the requested list)
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.requested_providers.push(provider.into());
        self
    }

    /// Set an absolute deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// The domain this request will be assigned
    #[must_use]
    pub fn effective_domain(&self) -> Domain {
        self.domain
            .unwrap_or_else(|| Domain::classify(&self.payload.prompt))
    }
}

/// An accepted task. Immutable once created.
#[derive(Clone, Debug)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,
    /// Assigned domain
    pub domain: Domain,
    /// Higher is more urgent
    pub priority: i32,
    /// Data forwarded to providers
    pub payload: Payload,
    /// Providers to invoke, in order (empty = domain chain)
    pub requested_providers: Vec<ProviderId>,
    /// Single or multi provider execution
    pub mode: ExecutionMode,
    /// Abandon the task if it has not finished by then
    pub deadline: Option<Instant>,
    /// When the task was accepted
    pub submitted_at: Instant,
}

impl Task {
    /// Accept a request, assigning an ID and a domain
    #[must_use]
    pub fn from_request(request: TaskRequest) -> Self {
        let domain = request.effective_domain();
        Self {
            id: TaskId::generate(),
            domain,
            priority: request.priority,
            payload: request.payload,
            requested_providers: request.requested_providers,
            mode: request.mode,
            deadline: request.deadline,
            submitted_at: Instant::now(),
        }
    }

    /// Whether the deadline has passed at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Time left before the deadline (`None` = no deadline)
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use TaskState::*;

        assert!(Queued.can_transition_to(Dispatched));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Dispatched.can_transition_to(Running));
        assert!(Dispatched.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Queued.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Dispatched.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Queued));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use TaskState::*;

        for terminal in [Completed, Failed, Cancelled, TimedOut] {
            assert!(terminal.is_terminal());
            for next in [
                Queued, Dispatched, Running, Completed, Failed, Cancelled, TimedOut,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_request_builder() {
        let request = TaskRequest::new("Compare AAPL and MSFT")
            .with_domain(Domain::Financial)
            .with_priority(10)
            .with_mode(ExecutionMode::Multi)
            .with_provider("claude")
            .with_provider("grok");

        assert_eq!(request.effective_domain(), Domain::Financial);
        assert_eq!(request.priority, 10);
        assert_eq!(request.mode, ExecutionMode::Multi);
        assert_eq!(
            request.requested_providers,
            vec![ProviderId::from("claude"), ProviderId::from("grok")]
        );
    }

    #[test]
    fn test_unset_domain_is_classified() {
        let request = TaskRequest::new("my knee joint hurts after running");
        assert_eq!(request.effective_domain(), Domain::Healthcare);

        let task = Task::from_request(request);
        assert_eq!(task.domain, Domain::Healthcare);
    }

    #[test]
    fn test_render_user_message() {
        let payload = Payload::new("What now?")
            .with_context("market_conditions", "volatile")
            .with_context("company_data", "ACME");

        assert_eq!(
            payload.render_user_message(),
            "company_data: ACME\nmarket_conditions: volatile\n\nWhat now?"
        );
        assert_eq!(Payload::new("plain").render_user_message(), "plain");
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("task_"));
    }
}
