//! Retry policy and deferred retry scheduling.
//!
//! The policy computes exponential backoff delays; the scheduler arms one
//! timer task per order so a waiting order never blocks any other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::FailureKind;

/// Retry policy for failed stages (immutable for the lifetime of a run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum automatic and manual retries without a reset
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Randomize each delay by up to ± this fraction
    #[serde(default)]
    pub jitter: Option<f64>,

    /// Also retry insufficient-inventory failures automatically
    #[serde(default)]
    pub auto_retry_validation: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay() -> u64 {
    30000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            jitter: None,
            auto_retry_validation: false,
        }
    }
}

impl RetryPolicy {
    /// Delay for a specific retry attempt (1-indexed), before jitter
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Delay for a specific retry attempt (1-indexed), jitter applied
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        match self.jitter {
            Some(fraction) if fraction > 0.0 => {
                let factor = 1.0 + rand::thread_rng().gen_range(-fraction..=fraction);
                let jittered = (base.as_millis() as f64 * factor).max(0.0);
                Duration::from_millis(jittered.min(self.max_delay_ms as f64) as u64)
            }
            _ => base,
        }
    }

    /// Whether failures of this kind are retried without an operator
    pub fn retries_automatically(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::Sync | FailureKind::Print => true,
            FailureKind::Validation => self.auto_retry_validation,
            FailureKind::System => false,
        }
    }

    /// Attempt number of the next retry, or `None` once the limit is reached
    pub fn next_attempt(&self, retry_count: u32) -> Option<u32> {
        let next = retry_count.saturating_add(1);
        (next <= self.max_retries).then_some(next)
    }
}

/// A retry timer that has been armed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmedRetry {
    pub order_id: String,
    pub attempt: u32,
    pub delay_ms: u64,
    pub due_at: DateTime<Utc>,
}

struct ArmedTimer {
    token: u64,
    retry: ArmedRetry,
    handle: JoinHandle<()>,
}

/// Arms deferred re-invocations, at most one per order
#[derive(Default)]
pub struct RetryScheduler {
    armed: Arc<Mutex<HashMap<String, ArmedTimer>>>,
    next_token: AtomicU64,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer that runs `on_due` once the attempt's delay has elapsed.
    ///
    /// Any timer already armed for the order is replaced.
    pub fn arm<F, Fut>(
        &self,
        policy: &RetryPolicy,
        order_id: &str,
        attempt: u32,
        on_due: F,
    ) -> ArmedRetry
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = policy.delay_for_attempt(attempt);
        self.arm_after(order_id, attempt, delay, on_due)
    }

    /// Arm a timer with an explicit delay
    pub fn arm_after<F, Fut>(
        &self,
        order_id: &str,
        attempt: u32,
        delay: Duration,
        on_due: F,
    ) -> ArmedRetry
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let due_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let retry = ArmedRetry {
            order_id: order_id.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            due_at,
        };

        let armed = Arc::clone(&self.armed);
        let key = order_id.to_string();

        // Hold the registry lock while spawning so the task cannot remove
        // its own entry before it is inserted.
        let mut registry = self.armed.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut registry = armed.lock();
                if registry.get(&key).map(|t| t.token) == Some(token) {
                    registry.remove(&key);
                }
            }
            on_due().await;
        });

        if let Some(previous) = registry.insert(
            order_id.to_string(),
            ArmedTimer {
                token,
                retry: retry.clone(),
                handle,
            },
        ) {
            previous.handle.abort();
            debug!(order_id, "Replaced armed retry timer");
        }

        debug!(order_id, attempt, delay_ms = retry.delay_ms, "Retry timer armed");
        retry
    }

    /// Disarm the order's timer; returns whether one was armed
    pub fn cancel(&self, order_id: &str) -> bool {
        match self.armed.lock().remove(order_id) {
            Some(timer) => {
                timer.handle.abort();
                debug!(order_id, "Retry timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, order_id: &str) -> bool {
        self.armed.lock().contains_key(order_id)
    }

    pub fn armed(&self, order_id: &str) -> Option<ArmedRetry> {
        self.armed.lock().get(order_id).map(|t| t.retry.clone())
    }

    pub fn armed_count(&self) -> usize {
        self.armed.lock().len()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        for (_, timer) in self.armed.lock().drain() {
            timer.handle.abort();
        }
    }
}
