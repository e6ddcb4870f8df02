//! Operator Conductor - Multi-Provider Task Orchestration
//!
//! This crate accepts analysis requests, assigns each one a domain, routes it
//! to one or more external AI model providers with fallback, runs the work on
//! a bounded worker pool in priority order, and reconciles provider outputs
//! into a single attributed response.
//!
//! It knows nothing about HTTP routes, persistence or presentation. "Call a
//! provider" is a capability behind the [`ProviderClient`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Caller / Web layer                        │
//! │            submit(TaskRequest) ─► TaskHandle ─► result()          │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          ORCHESTRATOR                             │
//! │                               ▼                                   │
//! │                  ┌──────────────────────────┐                     │
//! │                  │  PriorityDispatchQueue   │ (priority desc,     │
//! │                  └────────────┬─────────────┘  submission asc)    │
//! │                               ▼                                   │
//! │   ┌──────────────────── WorkerPool (n) ─────────────────────┐     │
//! │   │  TaskExecutor: single = fallback chain                   │     │
//! │   │                multi  = bounded fan-out                  │     │
//! │   └──────┬───────────────────────┬───────────────────┬──────┘     │
//! │          ▼                       ▼                   ▼            │
//! │   ProviderRegistry ◄──── HealthMonitor          ResultAggregator  │
//! │   (domain chains)       (circuit breakers)      (CompositeResult) │
//! └──────────┬───────────────────────────────────────────────────────┘
//!            ▼
//!     ProviderClient: Anthropic │ OpenAI-compatible │ Echo
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: submission API, status queries, shutdown
//! - [`TaskRequest`] / [`Task`]: the unit of work
//! - [`CompositeResult`]: attributed outputs plus per-provider failures
//! - [`TaskFailure`] / [`SubmitError`]: the typed failure taxonomy
//! - [`ProviderRegistry`]: providers and per-domain fallback chains
//!
//! # Quick Start
//!
//! ```ignore
//! use operator_conductor::{load_config, Orchestrator, TaskRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let registry = config.build_registry()?;
//!     let orchestrator = Orchestrator::new(config.orchestrator.clone(), registry);
//!     orchestrator.start();
//!
//!     let handle = orchestrator.submit(TaskRequest::new("Is now a good time to refinance?"))?;
//!     let result = handle.wait().await?;
//!     println!("{}", serde_json::to_string_pretty(&*result)?);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`task`]: tasks, payloads, modes and the lifecycle state machine
//! - [`domain`]: analysis domains and keyword classification
//! - [`provider`]: the provider trait and its implementations
//! - [`routing`]: registry, health/circuit breaking, policies, metrics
//! - [`dispatch`]: priority queue, task records and the worker pool
//! - [`aggregate`]: composite results
//! - [`orchestrator`]: the submission API
//! - [`config`]: TOML/env configuration and registry construction
//! - [`error`]: error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod routing;
pub mod task;

// Core exports
pub use aggregate::{
    AttributedOutput, CompositeResult, CompositeStatus, ProviderFailure, ProviderOutcome,
    ResultAggregator,
};
pub use dispatch::{CancelDisposition, TaskHandle, TaskOutcome, TaskProgress};
pub use domain::Domain;
pub use error::{CancelError, SubmitError, TaskFailure, TransitionError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, QueueStatus, ResultStatus};
pub use task::{ExecutionMode, Payload, Task, TaskId, TaskRequest, TaskState};

// Provider exports
pub use provider::{
    ErrorClass, FailureReason, HttpProvider, ProviderClient, ProviderEndpoint, ProviderError,
    ProviderId, ProviderResponse, ScriptedProvider, Usage,
};

// Routing exports
pub use routing::{
    CircuitState, ExecutionPolicy, HealthConfig, HealthMonitor, HealthSnapshot, MetricsSnapshot,
    ProviderRegistry, RegistryError, RetryPolicy,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConductorConfig, ConductorToml,
    ConfigError, ConfigOverrides, ConfigSource, ProviderKind, ProviderSettings,
};
