//! Provider Routing
//!
//! Decides which providers a task may use and under what rules.
//!
//! # Components
//!
//! - [`ProviderRegistry`]: providers plus per-domain fallback chains
//! - [`HealthMonitor`]: per-provider sliding window and circuit breaker
//! - [`ExecutionPolicy`] / [`RetryPolicy`]: call timeouts, fan-out, retries
//! - [`OrchestratorMetrics`]: counters and latency histogram
//!
//! # Flow
//!
//! ```text
//! Task ──► ProviderRegistry::resolve_for ──► chain filtered by HealthMonitor
//!                                                      │
//!                              Worker invokes with ExecutionPolicy
//!                                                      │
//!                         HealthMonitor::record_outcome ◄┘
//! ```

pub mod health;
pub mod metrics;
pub mod policy;
pub mod registry;

pub use health::{
    Admission, AggregateHealthStats, CircuitState, HealthConfig, HealthMonitor, HealthSnapshot,
    HealthStatus, ProviderHealth,
};
pub use metrics::{MetricsSnapshot, OrchestratorMetrics};
pub use policy::{ExecutionPolicy, RetryPolicy};
pub use registry::{ProviderRegistry, ProviderRegistryBuilder, RegistryError, Resolution};
