//! Per-endpoint circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures, Open →
//! HalfOpen once the cool-down elapses, HalfOpen admits exactly one probe
//! which either closes the circuit or reopens it with a fresh cool-down.
//!
//! All transitions go through one mutex. Readers that only need the state or
//! the failure counter use the atomic mirrors and never contend with writers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, Serialize, Display, AsRefStr, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Time spent Open before a probe is let through.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Returned instead of attempting a call while the circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open for endpoint '{endpoint}': {consecutive_failures} consecutive failures, retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub endpoint: String,
    pub consecutive_failures: u32,
    pub retry_in: Duration,
}

/// Full view of a breaker, taken under the lock.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_state_change: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    state_mirror: AtomicU8,
    failures_mirror: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_state_change: Utc::now(),
            }),
            state_mirror: AtomicU8::new(CircuitState::Closed.to_u8()),
            failures_mirror: AtomicU32::new(0),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask to send one attempt through the breaker.
    ///
    /// The returned permit must be resolved with [`CallPermit::success`] or
    /// [`CallPermit::failure`]; a permit dropped unresolved (for example when
    /// the attempt future is cancelled) counts as a failure.
    pub fn admit(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(self.config.cooldown);
                if elapsed >= self.config.cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    tracing::info!(endpoint = %self.endpoint, "circuit half-open, sending probe");
                    Ok(CallPermit::new(self, true))
                } else {
                    Err(self.open_error(&inner, self.config.cooldown - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error(&inner, Duration::ZERO))
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
        }
    }

    /// Lock-free read of the current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state_mirror.load(Ordering::Acquire))
    }

    /// Lock-free read of the consecutive failure counter.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures_mirror.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let next_retry_at = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                let remaining = self.config.cooldown.saturating_sub(opened_at.elapsed());
                chrono::Duration::from_std(remaining).ok().map(|d| Utc::now() + d)
            }
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_state_change: inner.last_state_change,
            next_retry_at,
        }
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => self.set_failures(&mut inner, 0),
            CircuitState::HalfOpen if probe => {
                self.set_failures(&mut inner, 0);
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
                tracing::info!(endpoint = %self.endpoint, "probe succeeded, circuit closed");
            }
            // Stragglers admitted before the trip do not shorten the cool-down.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        let failures = inner.consecutive_failures.saturating_add(1);
        self.set_failures(&mut inner, failures);
        match inner.state {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
                tracing::warn!(
                    endpoint = %self.endpoint,
                    consecutive_failures = failures,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "circuit tripped open"
                );
            }
            CircuitState::HalfOpen if probe => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
                tracing::warn!(endpoint = %self.endpoint, "probe failed, circuit reopened");
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        inner.state = next;
        inner.last_state_change = Utc::now();
        self.state_mirror.store(next.to_u8(), Ordering::Release);
        metrics::gauge!("circuit_state", "endpoint" => self.endpoint.clone()).set(f64::from(next.to_u8()));
    }

    fn set_failures(&self, inner: &mut BreakerInner, failures: u32) {
        inner.consecutive_failures = failures;
        self.failures_mirror.store(failures, Ordering::Release);
    }

    fn open_error(&self, inner: &BreakerInner, retry_in: Duration) -> CircuitOpenError {
        CircuitOpenError {
            endpoint: self.endpoint.clone(),
            consecutive_failures: inner.consecutive_failures,
            retry_in,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A panic while holding the lock cannot leave the inner state half
        // written, so a poisoned guard is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission ticket for a single attempt.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.probe);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.record_failure(self.probe);
        }
    }
}
