//! Provider Health Tracking and Circuit Breaker
//!
//! Tracks, per provider:
//! - a sliding window of recent outcomes (last N invocations, aged out after T)
//! - running totals and an EMA of latency
//! - a circuit breaker that isolates a misbehaving provider
//!
//! # Circuit Breaker
//!
//! ```text
//!            N trailing failures, or
//!            failure rate >= threshold
//! +--------+   (within the window)    +------+       cooldown       +----------+
//! | Closed | -----------------------> | Open | -------------------> | HalfOpen |
//! +--------+                          +------+                      +----------+
//!     ^                                  ^          trial failure        |
//!     |                                  +-------------------------------+
//!     |                 trial success                                    |
//!     +------------------------------------------------------------------+
//! ```
//!
//! HalfOpen admits exactly one trial invocation at a time, and only the
//! trial's outcome moves the circuit out of HalfOpen.
//!
//! # Thread Safety
//!
//! All per-provider state is atomic. Window slots are overwritten without a
//! lock; a racing reader may see a slot from the previous lap, which only
//! nudges the computed rate. The monitor itself is a `DashMap`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::provider::ProviderId;

// ============================================================================
// Health Status
// ============================================================================

/// Health status of a provider, derived from the breaker and the window
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum HealthStatus {
    /// Closed circuit, low failure rate
    Healthy,
    /// Closed circuit, but failing noticeably
    Degraded,
    /// Circuit open
    Unhealthy,
    /// Circuit half-open, waiting on a trial
    Recovering,
    /// No recent data
    #[default]
    Unknown,
}

// ============================================================================
// Circuit Breaker State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Rejecting calls until the cooldown elapses
    Open,
    /// Allowing a single trial call
    HalfOpen,
}

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

impl CircuitState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Result of asking the breaker for permission to call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Allowed,
    /// Circuit half-open and this caller holds the single trial
    Trial,
    /// Circuit open (or a trial is already in flight)
    Rejected,
}

impl Admission {
    /// Whether the call may proceed
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Tunables for health tracking
#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    /// Number of recent invocations kept in the window
    pub window_size: usize,
    /// Outcomes older than this fall out of the window
    pub window: Duration,
    /// Trailing failures (inside the window) that open the circuit
    pub failure_threshold: u32,
    /// Window failure rate that opens the circuit (0.0 - 1.0)
    pub failure_rate_threshold: f64,
    /// Samples required before the failure rate is considered
    pub min_samples: u32,
    /// Time an open circuit waits before allowing a trial
    pub cooldown: Duration,
    /// Window failure rate reported as degraded (0.0 - 1.0)
    pub degraded_failure_rate: f64,
    /// EMA weight for latency samples (0.0 - 1.0)
    pub ema_alpha: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            window: Duration::from_secs(60),
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            cooldown: Duration::from_secs(30),
            degraded_failure_rate: 0.1,
            ema_alpha: 0.3,
        }
    }
}

// ============================================================================
// Sliding Window
// ============================================================================

const OUTCOME_SUCCESS: u64 = 1;
const OUTCOME_FAILURE: u64 = 2;

/// Ring of recent outcomes, each slot packed as `(timestamp_ms << 2) | outcome`
struct OutcomeWindow {
    slots: Box<[AtomicU64]>,
    cursor: AtomicUsize,
}

/// Outcome counts currently inside the window
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    /// Successful invocations
    pub successes: u32,
    /// Failed invocations
    pub failures: u32,
}

impl WindowCounts {
    /// Total samples
    #[must_use]
    pub fn total(&self) -> u32 {
        self.successes + self.failures
    }

    /// Failure rate (0.0 when empty)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(self.total())
        }
    }
}

impl OutcomeWindow {
    fn new(size: usize) -> Self {
        let slots = (0..size.max(1)).map(|_| AtomicU64::new(0)).collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    fn push(&self, now_ms: u64, success: bool) {
        let outcome = if success {
            OUTCOME_SUCCESS
        } else {
            OUTCOME_FAILURE
        };
        let idx = self.cursor.fetch_add(1, Ordering::AcqRel) % self.slots.len();
        self.slots[idx].store((now_ms << 2) | outcome, Ordering::Release);
    }

    fn counts(&self, now_ms: u64, window_ms: u64) -> WindowCounts {
        let mut counts = WindowCounts::default();
        for slot in self.slots.iter() {
            let packed = slot.load(Ordering::Acquire);
            if packed == 0 || now_ms.saturating_sub(packed >> 2) > window_ms {
                continue;
            }
            match packed & 0b11 {
                OUTCOME_SUCCESS => counts.successes += 1,
                OUTCOME_FAILURE => counts.failures += 1,
                _ => {}
            }
        }
        counts
    }

    fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Release);
        }
    }
}

// ============================================================================
// Provider Health
// ============================================================================

/// Health state for a single provider
pub struct ProviderHealth {
    /// Provider identifier
    pub provider_id: ProviderId,

    config: HealthConfig,

    /// 0 = Closed, 1 = Open, 2 = `HalfOpen`
    circuit_state: AtomicU32,

    /// Set while a half-open trial is in flight
    trial_in_flight: AtomicBool,

    consecutive_failures: AtomicU32,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    times_opened: AtomicU64,

    avg_latency_ms: AtomicU64,

    /// Millis since startup; 0 = never
    last_failure_ts: AtomicU64,
    last_transition_ts: AtomicU64,

    window: OutcomeWindow,
    startup_time: Instant,
}

impl ProviderHealth {
    /// Create health state with default configuration
    pub fn new(provider_id: impl Into<ProviderId>) -> Self {
        Self::with_config(provider_id, HealthConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(provider_id: impl Into<ProviderId>, config: HealthConfig) -> Self {
        let window = OutcomeWindow::new(config.window_size);
        Self {
            provider_id: provider_id.into(),
            config,
            circuit_state: AtomicU32::new(CLOSED),
            trial_in_flight: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
            avg_latency_ms: AtomicU64::new(0),
            last_failure_ts: AtomicU64::new(0),
            last_transition_ts: AtomicU64::new(0),
            window,
            startup_time: Instant::now(),
        }
    }

    /// Current circuit breaker state
    pub fn circuit_state(&self) -> CircuitState {
        CircuitState::from_raw(self.circuit_state.load(Ordering::Acquire))
    }

    fn cooldown_elapsed(&self) -> bool {
        let since = self
            .now_millis()
            .saturating_sub(self.last_transition_ts.load(Ordering::Acquire));
        since >= duration_ms(self.config.cooldown)
    }

    /// Whether a call would currently be admitted. Does not change state.
    pub fn admits_traffic(&self) -> bool {
        match self.circuit_state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(),
            CircuitState::HalfOpen => !self.trial_in_flight.load(Ordering::Acquire),
        }
    }

    /// Ask for permission to call the provider
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and the
    /// winning caller gets the trial. Every admitted call must be followed by
    /// [`ProviderHealth::record`] with the admission it was given.
    pub fn try_admit(&self) -> Admission {
        match self.circuit_state() {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                if !self.cooldown_elapsed() || !self.claim_trial() {
                    return Admission::Rejected;
                }
                if self.transition(OPEN, HALF_OPEN) {
                    tracing::info!(
                        provider = %self.provider_id,
                        "Circuit breaker half-open, admitting trial call"
                    );
                    Admission::Trial
                } else {
                    // Lost to another transition; give the slot back
                    self.trial_in_flight.store(false, Ordering::Release);
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if self.claim_trial() {
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    fn claim_trial(&self) -> bool {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record the outcome of a call admitted with `admission`
    pub fn record(&self, admission: Admission, success: bool, latency: Duration) {
        match admission {
            Admission::Trial => self.record_trial_outcome(success, latency),
            Admission::Allowed | Admission::Rejected => self.record_outcome(success, latency),
        }
    }

    /// Record the outcome of an ordinary (non-trial) invocation
    ///
    /// Only a closed circuit reacts. A call admitted before the circuit left
    /// `Closed` that finishes while it is open or half-open updates the
    /// statistics but cannot decide the trial.
    pub fn record_outcome(&self, success: bool, latency: Duration) {
        let now = self.record_sample(success, latency);

        if self.circuit_state() == CircuitState::Closed && !success && self.should_trip(now) {
            self.open_from(CLOSED);
        }
    }

    /// Record the outcome of the half-open trial call
    pub fn record_trial_outcome(&self, success: bool, latency: Duration) {
        self.record_sample(success, latency);

        if success {
            if self.transition(HALF_OPEN, CLOSED) {
                self.window.clear();
                tracing::info!(
                    provider = %self.provider_id,
                    "Circuit breaker closed - provider recovered"
                );
            }
        } else {
            self.open_from(HALF_OPEN);
        }
        // Release only after the state has moved on
        self.trial_in_flight.store(false, Ordering::Release);
    }

    fn record_sample(&self, success: bool, latency: Duration) -> u64 {
        let now = self.now_millis();

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.window.push(now, success);
        self.update_latency(duration_ms(latency));

        if success {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Release);
        } else {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            self.last_failure_ts.store(now, Ordering::Release);
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        }
        now
    }

    fn should_trip(&self, now: u64) -> bool {
        let counts = self.window.counts(now, duration_ms(self.config.window));

        let trailing = self.consecutive_failures.load(Ordering::Acquire);
        if trailing >= self.config.failure_threshold && counts.failures >= self.config.failure_threshold
        {
            return true;
        }

        counts.total() >= self.config.min_samples
            && counts.failure_rate() >= self.config.failure_rate_threshold
    }

    fn open_from(&self, from: u32) {
        if self.transition(from, OPEN) {
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                provider = %self.provider_id,
                consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed),
                cooldown_ms = duration_ms(self.config.cooldown),
                "Circuit breaker opened - provider excluded from routing"
            );
        }
    }

    fn transition(&self, from: u32, to: u32) -> bool {
        let swapped = self
            .circuit_state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.last_transition_ts
                .store(self.now_millis(), Ordering::Release);
        }
        swapped
    }

    fn update_latency(&self, sample_ms: u64) {
        let alpha = self.config.ema_alpha;

        loop {
            let current = self.avg_latency_ms.load(Ordering::Acquire);
            let new_avg = if self.total_requests.load(Ordering::Relaxed) <= 1 {
                sample_ms
            } else {
                (alpha * sample_ms as f64 + (1.0 - alpha) * current as f64) as u64
            };

            if self
                .avg_latency_ms
                .compare_exchange(current, new_avg, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Outcomes currently inside the window
    pub fn window_counts(&self) -> WindowCounts {
        self.window
            .counts(self.now_millis(), duration_ms(self.config.window))
    }

    /// Status derived from breaker and window
    pub fn status(&self) -> HealthStatus {
        match self.circuit_state() {
            CircuitState::Open => HealthStatus::Unhealthy,
            CircuitState::HalfOpen => HealthStatus::Recovering,
            CircuitState::Closed => {
                let counts = self.window_counts();
                if counts.total() == 0 {
                    HealthStatus::Unknown
                } else if counts.failure_rate() >= self.config.degraded_failure_rate {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }

    /// Force the breaker into a state (admin and tests)
    pub fn force_state(&self, state: CircuitState) {
        let raw = match state {
            CircuitState::Closed => CLOSED,
            CircuitState::Open => OPEN,
            CircuitState::HalfOpen => HALF_OPEN,
        };
        self.circuit_state.store(raw, Ordering::Release);
        self.last_transition_ts
            .store(self.now_millis(), Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
        if state == CircuitState::Closed {
            self.consecutive_failures.store(0, Ordering::Release);
            self.window.clear();
        }
    }

    /// Millis since startup, at least 1 so that 0 means "never"
    fn now_millis(&self) -> u64 {
        duration_ms(self.startup_time.elapsed()) + 1
    }

    /// Point-in-time copy of the health state
    pub fn snapshot(&self) -> HealthSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_successes = self.total_successes.load(Ordering::Relaxed);
        let last_failure = self.last_failure_ts.load(Ordering::Acquire);
        let window = self.window_counts();

        HealthSnapshot {
            provider_id: self.provider_id.clone(),
            status: self.status(),
            circuit_state: self.circuit_state(),
            admits_traffic: self.admits_traffic(),
            success_rate: if total_requests == 0 {
                1.0
            } else {
                total_successes as f64 / total_requests as f64
            },
            window_failure_rate: window.failure_rate(),
            window,
            avg_latency_ms: self.avg_latency_ms.load(Ordering::Acquire),
            total_requests,
            total_successes,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            times_opened: self.times_opened.load(Ordering::Relaxed),
            last_failure_ago_ms: (last_failure != 0)
                .then(|| self.now_millis().saturating_sub(last_failure)),
        }
    }
}

impl std::fmt::Debug for ProviderHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHealth")
            .field("provider_id", &self.provider_id)
            .field("status", &self.status())
            .field("circuit_state", &self.circuit_state())
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Health Snapshot
// ============================================================================

/// Immutable snapshot of a provider's health
#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    /// Provider identifier
    pub provider_id: ProviderId,
    /// Derived status
    pub status: HealthStatus,
    /// Circuit breaker state
    pub circuit_state: CircuitState,
    /// Whether a call would be admitted right now
    pub admits_traffic: bool,
    /// Lifetime success rate (1.0 before any request)
    pub success_rate: f64,
    /// Failure rate inside the window
    pub window_failure_rate: f64,
    /// Outcome counts inside the window
    pub window: WindowCounts,
    /// EMA of invocation latency
    pub avg_latency_ms: u64,
    /// Lifetime invocations
    pub total_requests: u64,
    /// Lifetime successes
    pub total_successes: u64,
    /// Lifetime failures
    pub total_failures: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// How often the circuit has opened
    pub times_opened: u64,
    /// Time since the last failure
    pub last_failure_ago_ms: Option<u64>,
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Health state for every registered provider
pub struct HealthMonitor {
    providers: DashMap<ProviderId, Arc<ProviderHealth>>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Create a monitor with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    /// Create with custom configuration
    #[must_use]
    pub fn with_config(config: HealthConfig) -> Self {
        Self {
            providers: DashMap::new(),
            config,
        }
    }

    /// Configuration applied to every provider
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Get or create the health state for a provider
    pub fn register(&self, provider_id: &ProviderId) -> Arc<ProviderHealth> {
        self.providers
            .entry(provider_id.clone())
            .or_insert_with(|| {
                Arc::new(ProviderHealth::with_config(
                    provider_id.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Health state of a provider, if registered
    pub fn get(&self, provider_id: &ProviderId) -> Option<Arc<ProviderHealth>> {
        self.providers.get(provider_id).map(|h| h.clone())
    }

    /// Record an ordinary invocation outcome
    pub fn record_outcome(&self, provider_id: &ProviderId, success: bool, latency: Duration) {
        self.register(provider_id).record_outcome(success, latency);
    }

    /// Record the outcome of a call admitted with `admission`
    pub fn record(
        &self,
        provider_id: &ProviderId,
        admission: Admission,
        success: bool,
        latency: Duration,
    ) {
        self.register(provider_id).record(admission, success, latency);
    }

    /// Ask the provider's breaker for permission to call
    pub fn try_admit(&self, provider_id: &ProviderId) -> Admission {
        self.register(provider_id).try_admit()
    }

    /// Whether a call would currently be admitted
    pub fn admits_traffic(&self, provider_id: &ProviderId) -> bool {
        self.get(provider_id).map_or(true, |h| h.admits_traffic())
    }

    /// Circuit state of a provider (Closed if unknown)
    pub fn circuit_state(&self, provider_id: &ProviderId) -> CircuitState {
        self.get(provider_id)
            .map_or(CircuitState::Closed, |h| h.circuit_state())
    }

    /// Snapshots of every provider, sorted by id
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<_> = self.providers.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    /// Roll-up across providers
    pub fn aggregate_stats(&self) -> AggregateHealthStats {
        let mut stats = AggregateHealthStats::default();
        for entry in &self.providers {
            stats.total_providers += 1;
            match entry.value().circuit_state() {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
        }
        stats
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Breaker states across all providers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AggregateHealthStats {
    /// Registered providers
    pub total_providers: usize,
    /// Providers with a closed circuit
    pub closed: usize,
    /// Providers with an open circuit
    pub open: usize,
    /// Providers with a half-open circuit
    pub half_open: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthConfig {
        HealthConfig {
            window_size: 20,
            window: Duration::from_secs(60),
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            cooldown: Duration::from_secs(30),
            ..Default::default()
        }
    }

    const LATENCY: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let health = ProviderHealth::with_config("p", config());

        for _ in 0..4 {
            health.record_outcome(false, LATENCY);
        }
        assert_eq!(health.circuit_state(), CircuitState::Closed);

        health.record_outcome(false, LATENCY);
        assert_eq!(health.circuit_state(), CircuitState::Open);
        assert_eq!(health.try_admit(), Admission::Rejected);
        assert!(!health.admits_traffic());
        assert_eq!(health.status(), HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let health = ProviderHealth::with_config("p", config());

        for _ in 0..4 {
            health.record_outcome(false, LATENCY);
        }
        health.record_outcome(true, LATENCY);
        for _ in 0..4 {
            health.record_outcome(false, LATENCY);
        }

        // 8 failures of 9 samples, below min_samples
        assert_eq!(health.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let health = ProviderHealth::with_config("p", config());

        for _ in 0..4 {
            health.record_outcome(false, LATENCY);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        health.record_outcome(false, LATENCY);

        assert_eq!(health.window_counts().failures, 1);
        assert_eq!(health.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_failure_rate() {
        let health = ProviderHealth::with_config("p", config());

        // alternate so no run of 5 consecutive failures occurs
        for i in 0..10 {
            health.record_outcome(i % 2 == 0, LATENCY);
        }
        assert_eq!(health.circuit_state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_trial_then_close() {
        let health = ProviderHealth::with_config("p", config());
        health.force_state(CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(health.try_admit(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(health.admits_traffic());
        assert_eq!(health.try_admit(), Admission::Trial);
        assert_eq!(health.circuit_state(), CircuitState::HalfOpen);

        // second caller must wait for the trial
        assert_eq!(health.try_admit(), Admission::Rejected);

        health.record(Admission::Trial, true, LATENCY);
        assert_eq!(health.circuit_state(), CircuitState::Closed);
        assert_eq!(health.try_admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let health = ProviderHealth::with_config("p", config());
        health.force_state(CircuitState::Open);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(health.try_admit(), Admission::Trial);
        health.record(Admission::Trial, false, LATENCY);

        assert_eq!(health.circuit_state(), CircuitState::Open);
        assert_eq!(health.try_admit(), Admission::Rejected);

        // cooldown restarts from the reopen
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.try_admit(), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_latency() {
        let health = ProviderHealth::with_config("p", config());
        health.record_outcome(true, Duration::from_millis(200));
        health.record_outcome(true, Duration::from_millis(100));
        health.record_outcome(false, Duration::from_millis(100));

        let snapshot = health.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.total_failures, 1);
        assert_eq!(snapshot.window.total(), 3);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(snapshot.avg_latency_ms > 100 && snapshot.avg_latency_ms < 200);
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert_eq!(snapshot.last_failure_ago_ms, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_registers_lazily() {
        let monitor = HealthMonitor::with_config(config());
        let claude = ProviderId::from("claude");
        let grok = ProviderId::from("grok");

        assert!(monitor.admits_traffic(&claude));
        monitor.record_outcome(&claude, true, LATENCY);
        for _ in 0..5 {
            monitor.record_outcome(&grok, false, LATENCY);
        }

        assert_eq!(monitor.circuit_state(&grok), CircuitState::Open);
        assert_eq!(monitor.try_admit(&claude), Admission::Allowed);

        let snapshots = monitor.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].provider_id, claude);

        let stats = monitor.aggregate_stats();
        assert_eq!(stats.total_providers, 2);
        assert_eq!(stats.open, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_does_not_decide_trial() {
        let health = ProviderHealth::with_config("p", config());

        // admitted while closed, still in flight when the circuit opens
        let early = health.try_admit();
        assert_eq!(early, Admission::Allowed);
        for _ in 0..5 {
            health.record_outcome(false, LATENCY);
        }
        assert_eq!(health.circuit_state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.try_admit(), Admission::Trial);

        health.record(early, true, LATENCY);
        assert_eq!(health.circuit_state(), CircuitState::HalfOpen);
        assert_eq!(health.try_admit(), Admission::Rejected);

        health.record(Admission::Trial, true, LATENCY);
        assert_eq!(health.circuit_state(), CircuitState::Closed);
        assert_eq!(health.try_admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_does_not_reopen_half_open() {
        let health = ProviderHealth::with_config("p", config());
        health.force_state(CircuitState::Open);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.try_admit(), Admission::Trial);

        health.record(Admission::Allowed, false, LATENCY);
        assert_eq!(health.circuit_state(), CircuitState::HalfOpen);
        assert_eq!(health.snapshot().total_failures, 1);
    }

    #[test]
    fn test_concurrent_admission_grants_one_trial() {
        let health = ProviderHealth::with_config(
            "p",
            HealthConfig {
                cooldown: Duration::ZERO,
                ..config()
            },
        );

        for _ in 0..500 {
            health.force_state(CircuitState::Open);
            let barrier = std::sync::Barrier::new(8);
            let trials = AtomicUsize::new(0);

            std::thread::scope(|scope| {
                for _ in 0..8 {
                    scope.spawn(|| {
                        barrier.wait();
                        if health.try_admit() == Admission::Trial {
                            trials.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });

            assert_eq!(trials.load(Ordering::Relaxed), 1);
            assert_eq!(health.circuit_state(), CircuitState::HalfOpen);
        }
    }
}
