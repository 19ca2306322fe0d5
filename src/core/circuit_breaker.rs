//! Circuit breaker guarding calls to the POS integration.
//!
//! Three states:
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls are rejected without reaching the POS until the probe time
//! - HalfOpen: exactly one probe call is in flight; others are rejected
//!
//! All transitions happen under one mutex so the failure counter and the
//! single-probe rule stay consistent with concurrent callers. The lock is
//! never held across the guarded call itself.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::EventType;

use super::event_bus::EventBus;

/// Breaker thresholds and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before a probe is allowed (default: 30s)
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_ms: u64,

    /// Factor applied to the reset timeout after a failed probe (default: 1.0)
    #[serde(default = "default_reset_backoff_multiplier")]
    pub reset_backoff_multiplier: f64,

    /// Upper bound for the backed-off reset timeout (default: 5 min)
    #[serde(default = "default_max_reset_timeout")]
    pub max_reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout() -> u64 {
    30_000
}
fn default_reset_backoff_multiplier() -> f64 {
    1.0
}
fn default_max_reset_timeout() -> u64 {
    300_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout(),
            reset_backoff_multiplier: default_reset_backoff_multiplier(),
            max_reset_timeout_ms: default_max_reset_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.reset_timeout_ms == 0 {
            return Err("reset_timeout_ms must be positive".to_string());
        }
        if self.reset_backoff_multiplier < 1.0 {
            return Err("reset_backoff_multiplier must be >= 1.0".to_string());
        }
        if self.max_reset_timeout_ms < self.reset_timeout_ms {
            return Err("max_reset_timeout_ms must be >= reset_timeout_ms".to_string());
        }
        Ok(())
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Reset timeout to use after a failed probe
    fn backed_off(&self, current: Duration) -> Duration {
        let next = current.as_millis() as f64 * self.reset_backoff_multiplier;
        Duration::from_millis(next.min(self.max_reset_timeout_ms as f64) as u64)
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Errors from a guarded call
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the POS
    #[error("Circuit breaker is open for {component}")]
    Open {
        component: String,
        next_probe_at: Option<DateTime<Utc>>,
    },

    /// The call exceeded its timeout (counted as a failure)
    #[error("Call to {component} timed out after {timeout:?}")]
    Timeout { component: String, timeout: Duration },

    /// The call itself failed (counted as a failure)
    #[error("Operation failed: {0}")]
    Failed(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Consistent point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    pub reset_timeout_ms: u64,
    pub probe_in_flight: bool,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    next_probe_at: Option<DateTime<Utc>>,
    probe_deadline: Option<Instant>,
    current_reset_timeout: Duration,
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

/// Circuit breaker shared by every order using the same POS endpoint
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    bus: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout_ms,
            "Circuit breaker initialized"
        );

        let inner = BreakerInner {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            probe_deadline: None,
            current_reset_timeout: config.reset_timeout(),
            probe_in_flight: false,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
        };

        Self {
            name,
            config,
            inner: Mutex::new(inner),
            bus: None,
        }
    }

    /// Publish `circuitbreaker:status` on every state transition
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        self.snapshot_of(&inner)
    }

    /// Run `operation` under breaker protection with a timeout.
    ///
    /// A timeout counts exactly like a failed call.
    pub async fn call<F, Fut, T, E>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.acquire() {
            Ok(permit) => permit,
            Err(next_probe_at) => {
                return Err(BreakerError::Open {
                    component: self.name.clone(),
                    next_probe_at,
                })
            }
        };

        let start = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, operation()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(value)) => {
                debug!(component = %self.name, duration_ms, "Guarded call succeeded");
                permit.succeed();
                Ok(value)
            }
            Ok(Err(e)) => {
                debug!(component = %self.name, duration_ms, "Guarded call failed");
                permit.fail();
                Err(BreakerError::Failed(e))
            }
            Err(_) => {
                warn!(component = %self.name, timeout_ms = timeout.as_millis() as u64, "Guarded call timed out");
                permit.fail();
                Err(BreakerError::Timeout {
                    component: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Force the breaker closed (operator recovery)
    pub fn reset(&self) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let changed = inner.state != CircuitState::Closed;
            self.close(&mut inner);
            warn!(component = %self.name, "Circuit breaker reset by operator");
            changed.then(|| self.snapshot_of(&inner))
        };
        self.announce(snapshot);
    }

    /// Admit a call or return the next probe time
    fn acquire(&self) -> Result<CallPermit<'_>, Option<DateTime<Utc>>> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let (probe, snapshot) = match state {
            CircuitState::Closed => (false, None),
            CircuitState::Open => {
                let due = inner
                    .probe_deadline
                    .map(|deadline| Instant::now() >= deadline)
                    .unwrap_or(true);
                if !due {
                    inner.rejected_calls += 1;
                    return Err(inner.next_probe_at);
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(component = %self.name, "Circuit breaker half-open, probing");
                (true, Some(self.snapshot_of(&inner)))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.rejected_calls += 1;
                    return Err(inner.next_probe_at);
                }
                inner.probe_in_flight = true;
                (true, None)
            }
        };
        drop(inner);
        self.announce(snapshot);

        Ok(CallPermit {
            breaker: self,
            probe,
            resolved: false,
        })
    }

    fn record_success(&self, probe: bool) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.total_calls += 1;
            inner.consecutive_failures = 0;

            if probe && inner.state == CircuitState::HalfOpen {
                self.close(&mut inner);
                info!(component = %self.name, "Circuit breaker closed (probe succeeded)");
                Some(self.snapshot_of(&inner))
            } else {
                None
            }
        };
        self.announce(snapshot);
    }

    fn record_failure(&self, probe: bool) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.total_calls += 1;
            inner.total_failures += 1;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

            let state = inner.state;
            match state {
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    let timeout = self.config.reset_timeout();
                    self.open(&mut inner, timeout);
                    Some(self.snapshot_of(&inner))
                }
                CircuitState::HalfOpen if probe => {
                    let timeout = self.config.backed_off(inner.current_reset_timeout);
                    self.open(&mut inner, timeout);
                    Some(self.snapshot_of(&inner))
                }
                // late result of a call admitted before the circuit opened
                _ => None,
            }
        };
        self.announce(snapshot);
    }

    fn open(&self, inner: &mut BreakerInner, reset_timeout: Duration) {
        let now = Utc::now();
        inner.state = CircuitState::Open;
        inner.probe_in_flight = false;
        inner.opened_at = Some(now);
        inner.current_reset_timeout = reset_timeout;
        inner.probe_deadline = Some(Instant::now() + reset_timeout);
        inner.next_probe_at = chrono::Duration::from_std(reset_timeout)
            .ok()
            .map(|d| now + d);

        error!(
            component = %self.name,
            consecutive_failures = inner.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            reset_timeout_ms = reset_timeout.as_millis() as u64,
            "Circuit breaker opened (failing fast)"
        );
    }

    fn close(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.opened_at = None;
        inner.next_probe_at = None;
        inner.probe_deadline = None;
        inner.current_reset_timeout = self.config.reset_timeout();
    }

    fn snapshot_of(&self, inner: &BreakerInner) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            opened_at: inner.opened_at,
            next_probe_at: inner.next_probe_at,
            reset_timeout_ms: inner.current_reset_timeout.as_millis() as u64,
            probe_in_flight: inner.probe_in_flight,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
        }
    }

    fn announce(&self, snapshot: Option<CircuitBreakerSnapshot>) {
        if let (Some(bus), Some(snapshot)) = (&self.bus, snapshot) {
            let payload = serde_json::to_value(&snapshot).unwrap_or_default();
            bus.publish(EventType::CircuitBreakerStatus, None, payload);
        }
    }
}

/// Admission for one guarded call.
///
/// Dropping an unresolved probe permit (the caller's future was cancelled)
/// counts as a failed probe so the half-open slot is released.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl CallPermit<'_> {
    fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.probe);
    }

    fn fail(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            warn!(component = %self.breaker.name, "Probe call cancelled, reopening circuit");
            self.breaker.record_failure(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "pos",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: 1_000,
                ..Default::default()
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> BreakerError<&'static str> {
        b.call(Duration::from_secs(1), || async { Err::<(), _>("boom") })
            .await
            .unwrap_err()
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backed_off_reset_timeout_is_capped() {
        let config = CircuitBreakerConfig {
            reset_timeout_ms: 1_000,
            reset_backoff_multiplier: 4.0,
            max_reset_timeout_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(
            config.backed_off(Duration::from_millis(1_000)),
            Duration::from_millis(4_000)
        );
        assert_eq!(
            config.backed_off(Duration::from_millis(4_000)),
            Duration::from_millis(10_000)
        );
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let b = breaker(2);
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.snapshot().next_probe_at.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let b = breaker(3);
        fail(&b).await;
        fail(&b).await;
        b.call(Duration::from_secs(1), || async { Ok::<_, &str>(()) })
            .await
            .unwrap();
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_rejection_does_not_count_as_failure() {
        let b = breaker(1);
        fail(&b).await;
        let err = fail(&b).await;
        assert!(err.is_open());

        let snapshot = b.snapshot();
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.rejected_calls, 1);
        assert_eq!(snapshot.total_calls, 1);
    }

    #[tokio::test]
    async fn test_reset_closes() {
        let b = breaker(1);
        fail(&b).await;
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }
}
