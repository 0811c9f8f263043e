//! Per-store circuit breaker
//!
//! State machine:
//! - `CLOSED`: calls pass; counted failures accumulate until the threshold opens the circuit
//! - `OPEN`: calls fail fast until the recovery timeout has elapsed since the last failure
//! - `HALF_OPEN`: exactly one trial call is admitted; its outcome closes or re-opens the circuit
//!
//! The lock is only held to decide admission and to record an outcome, never
//! across the guarded call itself. Admission hands out a [`Permit`]; dropping a
//! permit without settling it (for example when the caller's future is
//! cancelled) releases a half-open trial slot instead of wedging the breaker.

use chrono::{DateTime, Utc};
use msc_store::{StoreError, StoreId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Stable label used in logs and metrics
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive counted failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is admitted
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    /// With failure threshold
    #[inline]
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// With recovery timeout
    #[inline]
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Persistable breaker record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub store_id: StoreId,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

/// Emitted on every state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub store_id: StoreId,
    pub from: BreakerState,
    pub to: BreakerState,
    pub failure_count: u32,
    pub at: DateTime<Utc>,
}

/// Call rejected or failed through a breaker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Circuit is open (or its half-open trial is taken); the store was not touched
    #[error("store {store_id} unavailable: circuit open")]
    Unavailable { store_id: StoreId },

    /// The store call ran and failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CallError {
    /// Whether the call was rejected without reaching the store
    #[inline]
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Store the error refers to, when known
    #[must_use]
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(err) => Some(err),
            Self::Unavailable { .. } => None,
        }
    }
}

/// Admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one store
#[derive(Debug)]
pub struct CircuitBreaker {
    store_id: StoreId,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    /// Create a closed breaker with its own transition channel
    #[must_use]
    pub fn new(store_id: impl Into<StoreId>, config: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self::with_channel(store_id, config, transitions)
    }

    /// Create a closed breaker publishing on a shared transition channel
    #[must_use]
    pub fn with_channel(
        store_id: impl Into<StoreId>,
        config: BreakerConfig,
        transitions: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
            transitions,
        }
    }

    /// Guarded store
    #[inline]
    #[must_use]
    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// Thresholds in force
    #[inline]
    #[must_use]
    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive counted failures
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Subscribe to state transitions of this breaker
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Decide admission at `now`
    ///
    /// An `OPEN` circuit whose recovery timeout has elapsed moves to
    /// `HALF_OPEN` here and the caller receives the single trial permit.
    pub fn try_acquire(&self, now: Instant) -> Result<Permit<'_>, Rejected> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(Permit::new(self, false)),
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.config.recovery_timeout);
                if !cooled {
                    return Err(Rejected);
                }
                inner.trial_in_flight = true;
                self.transition(&mut inner, BreakerState::HalfOpen);
                Ok(Permit::new(self, true))
            }
            BreakerState::HalfOpen if inner.trial_in_flight => Err(Rejected),
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    /// Run `operation` through the breaker
    ///
    /// Rejected calls never invoke `operation`. Only errors for which
    /// [`StoreError::counts_as_failure`] holds are recorded as failures; other
    /// errors release the permit without changing state.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let permit = self.try_acquire(Instant::now()).map_err(|Rejected| {
            metrics::counter!("msc_breaker_rejections_total", "store" => self.store_id.to_string())
                .increment(1);
            CallError::Unavailable {
                store_id: self.store_id.clone(),
            }
        })?;

        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) if err.counts_as_failure() => {
                permit.fail(Instant::now());
                Err(CallError::Store(err))
            }
            Err(err) => {
                drop(permit);
                Err(CallError::Store(err))
            }
        }
    }

    /// Force the circuit closed and clear the failure count
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
        info!(store = %self.store_id, "Circuit reset");
    }

    /// Force the circuit open as if a failure happened at `now`
    pub fn force_open(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(now);
        inner.last_failure_at = Some(Utc::now());
        inner.trial_in_flight = false;
        if inner.state != BreakerState::Open {
            self.transition(&mut inner, BreakerState::Open);
        }
        warn!(store = %self.store_id, "Circuit force-opened");
    }

    /// Persistable view of the breaker
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            store_id: self.store_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
        }
    }

    /// Reload a persisted record
    ///
    /// The monotonic failure instant is reconstructed from the wall-clock
    /// timestamp, so a circuit persisted `OPEN` long enough ago admits a trial
    /// on its next call. A half-open trial never survives a restart.
    pub fn restore(&self, saved: &CircuitBreakerState) {
        let mut inner = self.inner.lock();
        inner.state = saved.state;
        inner.failure_count = saved.failure_count;
        inner.last_failure_at = saved.last_failure_time;
        inner.trial_in_flight = false;
        inner.last_failure = saved.last_failure_time.map(|at| {
            let elapsed = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
            let now = Instant::now();
            now.checked_sub(elapsed).unwrap_or(now)
        });
        info!(store = %self.store_id, state = %saved.state, failure_count = saved.failure_count, "Circuit restored");
    }

    fn settle_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen if trial => {
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                self.transition(&mut inner, BreakerState::Closed);
            }
            // Late completion of a call admitted before the circuit tripped
            _ => {}
        }
    }

    fn settle_failure(&self, trial: bool, now: Instant) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        match inner.state {
            BreakerState::Closed => {
                inner.last_failure = Some(now);
                inner.last_failure_at = Some(Utc::now());
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen if trial => {
                inner.last_failure = Some(now);
                inner.last_failure_at = Some(Utc::now());
                inner.trial_in_flight = false;
                self.transition(&mut inner, BreakerState::Open);
            }
            _ => {}
        }
    }

    fn release(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        let failure_count = inner.failure_count;
        match to {
            BreakerState::Open if from == BreakerState::HalfOpen => {
                error!(store = %self.store_id, failure_count, "Circuit reopened");
            }
            BreakerState::Open => error!(store = %self.store_id, failure_count, "Circuit opened"),
            BreakerState::HalfOpen => info!(store = %self.store_id, "Circuit transitioned to HALF_OPEN"),
            BreakerState::Closed => info!(store = %self.store_id, "Circuit closed"),
        }
        metrics::counter!(
            "msc_breaker_transitions_total",
            "store" => self.store_id.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
        // No subscribers is fine
        let _ = self.transitions.send(BreakerTransition {
            store_id: self.store_id.clone(),
            from,
            to,
            failure_count,
            at: Utc::now(),
        });
    }
}

/// Admission ticket for one call
///
/// Settle it with [`Permit::succeed`] or [`Permit::fail`]. Dropping it
/// unsettled leaves the state untouched and frees a half-open trial slot.
#[derive(Debug)]
#[must_use = "an unsettled permit records nothing"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this is the half-open trial call
    #[inline]
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.settle_success(self.trial);
    }

    /// Record a counted failure at `now`
    pub fn fail(mut self, now: Instant) {
        self.settled = true;
        self.breaker.settle_failure(self.trial, now);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "metadata",
            BreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(Duration::from_secs(timeout_secs)),
        )
    }

    fn io() -> StoreError {
        StoreError::io(&StoreId::new("metadata"), "refused")
    }

    #[test]
    fn opens_at_threshold() {
        let cb = breaker(3, 60);
        let now = Instant::now();
        for _ in 0..2 {
            cb.try_acquire(now).unwrap().fail(now);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.try_acquire(now).unwrap().fail(now);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.try_acquire(now).is_err());
    }

    #[test]
    fn success_in_closed_resets_count() {
        let cb = breaker(3, 60);
        let now = Instant::now();
        cb.try_acquire(now).unwrap().fail(now);
        cb.try_acquire(now).unwrap().fail(now);
        cb.try_acquire(now).unwrap().succeed();
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn half_open_admits_single_trial() {
        let cb = breaker(1, 10);
        let start = Instant::now();
        cb.try_acquire(start).unwrap().fail(start);

        let later = start + Duration::from_secs(10);
        let trial = cb.try_acquire(later).unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.try_acquire(later).is_err());

        trial.succeed();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_trial_reopens_and_restarts_clock() {
        let cb = breaker(1, 10);
        let start = Instant::now();
        cb.try_acquire(start).unwrap().fail(start);

        let t1 = start + Duration::from_secs(10);
        cb.try_acquire(t1).unwrap().fail(t1);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.try_acquire(t1 + Duration::from_secs(9)).is_err());
        assert!(cb.try_acquire(t1 + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn dropped_trial_frees_slot() {
        let cb = breaker(1, 10);
        let start = Instant::now();
        cb.try_acquire(start).unwrap().fail(start);

        let later = start + Duration::from_secs(10);
        drop(cb.try_acquire(later).unwrap());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.try_acquire(later).unwrap().is_trial());
    }

    #[test]
    fn late_success_does_not_close_open_circuit() {
        let cb = breaker(1, 60);
        let now = Instant::now();
        let slow = cb.try_acquire(now).unwrap();
        cb.try_acquire(now).unwrap().fail(now);
        assert_eq!(cb.state(), BreakerState::Open);
        slow.succeed();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn transitions_are_broadcast() {
        let cb = breaker(1, 10);
        let mut rx = cb.subscribe();
        let now = Instant::now();
        cb.try_acquire(now).unwrap().fail(now);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.from, BreakerState::Closed);
        assert_eq!(event.to, BreakerState::Open);
        assert_eq!(event.failure_count, 1);
    }

    #[test]
    fn snapshot_restore_roundtrip_keeps_open_state() {
        let cb = breaker(1, 3600);
        let now = Instant::now();
        cb.try_acquire(now).unwrap().fail(now);
        let saved = cb.snapshot();
        assert_eq!(saved.state, BreakerState::Open);
        assert!(saved.last_failure_time.is_some());

        let fresh = breaker(1, 3600);
        fresh.restore(&saved);
        assert_eq!(fresh.state(), BreakerState::Open);
        assert!(fresh.try_acquire(Instant::now()).is_err());
    }

    #[test]
    fn restored_stale_open_circuit_admits_trial() {
        let fresh = breaker(1, 60);
        fresh.restore(&CircuitBreakerState {
            store_id: StoreId::new("metadata"),
            state: BreakerState::Open,
            failure_count: 1,
            last_failure_time: Some(Utc::now() - chrono::Duration::hours(1)),
            failure_threshold: 1,
            recovery_timeout_secs: 60,
        });
        assert!(fresh.try_acquire(Instant::now()).unwrap().is_trial());
    }

    #[test]
    fn reset_and_force_open() {
        let cb = breaker(5, 60);
        cb.force_open(Instant::now());
        assert_eq!(cb.state(), BreakerState::Open);
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn call_counts_only_store_failures() {
        let cb = breaker(1, 60);
        let unsupported = cb
            .call(|| async {
                Err::<(), _>(StoreError::unsupported(&StoreId::new("metadata"), "recreate"))
            })
            .await;
        assert!(matches!(unsupported, Err(CallError::Store(_))));
        assert_eq!(cb.state(), BreakerState::Closed);

        let failed = cb.call(|| async { Err::<(), _>(io()) }).await;
        assert!(matches!(failed, Err(CallError::Store(_))));
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_then_recovers() {
        let cb = breaker(2, 30);
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(io()) }).await;
        }
        let rejected = cb.call(|| async { Ok::<_, StoreError>(1) }).await;
        assert!(matches!(rejected, Err(CallError::Unavailable { .. })));

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = cb.call(|| async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(trial, Ok(7));
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
