//! # Circuit Breaker Implementation
//!
//! Fault isolation for outbound dependency calls. Three states: Closed (normal
//! operation), Open (failing fast) and Half-Open (bounded trial calls).
//!
//! All state lives behind one `parking_lot::Mutex` per breaker so every
//! read-modify-write is atomic and transitions are totally ordered. The lock
//! is never held across the guarded operation: a call takes a [`Permit`]
//! stamped with the breaker's generation, runs unlocked, then reports back.
//! Every transition bumps the generation, and a report carrying a stale
//! generation only updates lifetime totals.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::{elapsed_between, Clock};
use crate::metrics;
use crate::resilience::{BreakerSnapshot, CircuitBreakerConfig};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - limited calls allowed to test dependency health
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component} (retry after {retry_after:?})")]
    CircuitOpen {
        component: String,
        retry_after: Duration,
    },

    /// Operation exceeded the caller-supplied timeout; counted as a failure
    #[error("Operation on {component} timed out after {timeout:?}")]
    Timeout { component: String, timeout: Duration },

    /// Operation failed; recorded when the caller classified it as a failure
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }

    /// Map the wrapped operation error, keeping breaker-originated variants
    pub fn map_operation<F, E2>(self, f: F) -> CircuitBreakerError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            CircuitBreakerError::CircuitOpen {
                component,
                retry_after,
            } => CircuitBreakerError::CircuitOpen {
                component,
                retry_after,
            },
            CircuitBreakerError::Timeout { component, timeout } => {
                CircuitBreakerError::Timeout { component, timeout }
            }
            CircuitBreakerError::OperationFailed(e) => CircuitBreakerError::OperationFailed(f(e)),
        }
    }
}

/// Admission ticket for one guarded call.
///
/// A trial permit dropped before it is settled (the caller's future was
/// cancelled mid-call) counts as a failed trial, so the half-open slot is
/// never lost.
#[derive(Debug)]
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.generation);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.generation);
    }

    /// Give the slot back without counting the call either way
    fn release(mut self) {
        self.settled = true;
        self.breaker.release_trial(self.generation, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        warn!(
            dependency = %self.breaker.name,
            "Half-open trial abandoned before completing, counting as failure"
        );
        self.breaker.record_failure(self.generation);
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    generation: u64,
    failure_count: u32,
    success_count: u64,
    consecutive_half_open_successes: u32,
    half_open_in_flight: u32,
    last_transition_at: DateTime<Utc>,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Core circuit breaker with mutex-guarded state
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        info!(
            dependency = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_seconds = config.recovery_timeout.as_secs(),
            half_open_trial_limit = config.half_open_trial_limit,
            "Circuit breaker initialized"
        );

        let now = clock.now();
        Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                generation: 0,
                failure_count: 0,
                success_count: 0,
                consecutive_half_open_successes: 0,
                half_open_in_flight: 0,
                last_transition_at: now,
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose recovery timeout has elapsed still
    /// reports `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Execute an operation; every error counts as a failure
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, |_| true).await
    }

    /// Execute an operation, counting only errors the classifier accepts.
    ///
    /// Errors rejected by `counts_as_failure` (caller-side validation problems
    /// and the like) leave the breaker counters untouched and give back any
    /// half-open trial slot.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        counts_as_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let permit = self.acquire()?;

        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) => {
                if counts_as_failure(&e) {
                    permit.fail();
                } else {
                    permit.release();
                }
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    /// Execute an operation bounded by `timeout`; an elapsed timeout counts as
    /// a failure, including for half-open trial calls.
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                permit.succeed();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.fail();
                Err(CircuitBreakerError::OperationFailed(e))
            }
            Err(_) => {
                warn!(
                    dependency = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "⏱️ Guarded call timed out"
                );
                permit.fail();
                Err(CircuitBreakerError::Timeout {
                    component: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Check whether a call would currently be admitted, without taking a slot
    pub fn would_allow(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                elapsed_between(inner.last_transition_at, self.clock.now())
                    >= self.config.recovery_timeout
            }
            CircuitState::HalfOpen => inner.half_open_in_flight < self.config.half_open_trial_limit,
        }
    }

    fn acquire<E>(&self) -> Result<Permit<'_>, CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();

        if inner.state == CircuitState::Open {
            let elapsed = elapsed_between(inner.last_transition_at, now);
            if elapsed >= self.config.recovery_timeout {
                self.transition(&mut inner, CircuitState::HalfOpen, now);
            } else {
                inner.total_rejections += 1;
                let retry_after = self.config.recovery_timeout.saturating_sub(elapsed);
                drop(inner);
                return Err(self.rejection(retry_after));
            }
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                generation: inner.generation,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen if inner.half_open_in_flight < self.config.half_open_trial_limit => {
                inner.half_open_in_flight += 1;
                Ok(Permit {
                    breaker: self,
                    generation: inner.generation,
                    trial: true,
                    settled: false,
                })
            }
            _ => {
                inner.total_rejections += 1;
                drop(inner);
                Err(self.rejection(self.config.recovery_timeout))
            }
        }
    }

    fn rejection<E>(&self, retry_after: Duration) -> CircuitBreakerError<E> {
        debug!(
            dependency = %self.name,
            retry_after_ms = retry_after.as_millis() as u64,
            "Call rejected (circuit open)"
        );
        metrics::breaker_rejections_total()
            .add(1, &[KeyValue::new("dependency", self.name.clone())]);
        CircuitBreakerError::CircuitOpen {
            component: self.name.clone(),
            retry_after,
        }
    }

    fn record_success(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.success_count += 1;

        if generation != inner.generation {
            debug!(dependency = %self.name, "Ignoring stale success report");
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_half_open_successes += 1;
                if inner.consecutive_half_open_successes >= self.config.success_threshold {
                    let now = self.clock.now();
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {
                warn!(dependency = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    fn record_failure(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;

        if generation != inner.generation {
            debug!(dependency = %self.name, "Ignoring stale failure report");
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                debug!(
                    dependency = %self.name,
                    failure_count = inner.failure_count,
                    failure_threshold = self.config.failure_threshold,
                    "Guarded call failed"
                );
                if inner.failure_count >= self.config.failure_threshold {
                    let now = self.clock.now();
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                let now = self.clock.now();
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    fn release_trial(&self, generation: u64, trial: bool) {
        let mut inner = self.inner.lock();
        if trial
            && generation == inner.generation
            && inner.state == CircuitState::HalfOpen
        {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: DateTime<Utc>) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.last_transition_at = now;
        inner.half_open_in_flight = 0;
        inner.consecutive_half_open_successes = 0;

        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                info!(
                    dependency = %self.name,
                    from = %from,
                    total_calls = inner.total_calls,
                    "✅ Circuit breaker closed (recovered)"
                );
            }
            CircuitState::Open => {
                error!(
                    dependency = %self.name,
                    from = %from,
                    failure_count = inner.failure_count,
                    failure_threshold = self.config.failure_threshold,
                    recovery_timeout_seconds = self.config.recovery_timeout.as_secs(),
                    "🚨 Circuit breaker opened (failing fast)"
                );
            }
            CircuitState::HalfOpen => {
                info!(
                    dependency = %self.name,
                    half_open_trial_limit = self.config.half_open_trial_limit,
                    "🔄 Circuit breaker half-open (testing recovery)"
                );
            }
        }

        metrics::breaker_transitions_total().add(
            1,
            &[
                KeyValue::new("dependency", self.name.clone()),
                KeyValue::new("to_state", to.as_str()),
            ],
        );
    }

    /// Force circuit to open state (emergency stop)
    pub fn force_open(&self) {
        warn!(dependency = %self.name, "Circuit breaker forced open");
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        self.transition(&mut inner, CircuitState::Open, now);
    }

    /// Force circuit to closed state (operator override)
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Closed && inner.failure_count == 0 {
            return;
        }
        warn!(dependency = %self.name, "Circuit breaker forced closed");
        let now = self.clock.now();
        self.transition(&mut inner, CircuitState::Closed, now);
    }

    /// Point-in-time view of every state field plus lifetime totals
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_half_open_successes: inner.consecutive_half_open_successes,
            last_transition_at: inner.last_transition_at,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_seconds: self.config.recovery_timeout.as_secs(),
            half_open_trial_limit: self.config.half_open_trial_limit,
            success_threshold: self.config.success_threshold,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Closed with a low failure rate
    pub fn is_healthy(&self) -> bool {
        self.snapshot().is_healthy()
    }
}
