//! Order state and timeline.
//!
//! An Order is owned by the engine while it moves through the pipeline and is
//! persisted through the order store after every transition.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::events::EventType;

/// One discrete step of order processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Validated,
    Synced,
    Printed,
    Complete,
    Error,
}

impl Stage {
    /// Stages an order can fail from (and be resumed at)
    pub const RESUMABLE: [Stage; 4] = [
        Stage::Received,
        Stage::Validated,
        Stage::Synced,
        Stage::Printed,
    ];

    /// The stage reached when the executor for this stage succeeds
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Received => Some(Stage::Validated),
            Stage::Validated => Some(Stage::Synced),
            Stage::Synced => Some(Stage::Printed),
            Stage::Printed => Some(Stage::Complete),
            Stage::Complete | Stage::Error => None,
        }
    }

    /// Whether an order in this stage can run a stage executor
    pub fn is_resumable(self) -> bool {
        Self::RESUMABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Synced => "synced",
            Stage::Printed => "printed",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }

    /// Event published when an order enters this stage
    pub fn event_type(self) -> EventType {
        match self {
            Stage::Received => EventType::OrderReceived,
            Stage::Validated => EventType::OrderValidated,
            Stage::Synced => EventType::OrderSynced,
            Stage::Printed => EventType::OrderPrinted,
            Stage::Complete => EventType::OrderComplete,
            Stage::Error => EventType::OrderError,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Stage::Received),
            "validated" => Ok(Stage::Validated),
            "synced" => Ok(Stage::Synced),
            "printed" => Ok(Stage::Printed),
            "complete" => Ok(Stage::Complete),
            "error" => Ok(Stage::Error),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Category of the failure recorded in `last_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Sync,
    Print,
    System,
}

/// The most recent failure of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: FailureKind,

    /// Human-readable message (no internal detail)
    pub message: String,

    pub occurred_at: DateTime<Utc>,

    /// Stage the order was in when its executor failed; retries resume here
    pub failed_stage: Stage,

    /// True when the call was rejected by an open circuit without reaching the POS
    #[serde(default)]
    pub circuit_open: bool,
}

/// How an order came to enter a timeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineOutcome {
    /// Inbound notification accepted
    Accepted,
    /// Previous stage executor succeeded
    Advanced,
    /// Previous stage executor failed
    Failed,
    /// Re-entered after an automatic or manual retry
    Retried,
}

/// One entry of an order's append-only timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub stage: Stage,
    pub entered_at: DateTime<Utc>,

    /// Filled once when the order leaves this stage
    pub duration_ms: Option<u64>,

    pub outcome: TimelineOutcome,
}

/// A single purchased line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Order contents captured at `received`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub items: Vec<LineItem>,
    pub customer: Customer,
}

impl OrderPayload {
    /// Stable fingerprint of the contents (first 16 hex chars of SHA256)
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for item in &self.items {
            hasher.update(item.sku.as_bytes());
            hasher.update([0]);
            hasher.update(item.quantity.to_le_bytes());
            hasher.update(item.unit_price_cents.to_le_bytes());
        }
        hasher.update(self.customer.name.as_bytes());
        if let Some(ref email) = self.customer.email {
            hasher.update([0]);
            hasher.update(email.as_bytes());
        }
        let result = hasher.finalize();
        hex::encode(&result[..8])
    }

    pub fn total_cents(&self) -> u64 {
        self.items
            .iter()
            .map(|i| i.unit_price_cents.saturating_mul(u64::from(i.quantity)))
            .sum()
    }
}

/// Stable identifier passed to every external call: `(order_id, stage, attempt)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationToken {
    pub order_id: String,
    pub stage: Stage,
    pub attempt: u32,
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.order_id, self.stage, self.attempt)
    }
}

/// A retail order moving through the automation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub stage: Stage,
    pub retry_count: u32,
    timeline: Vec<TimelineEntry>,
    pub last_error: Option<LastError>,
    payload: OrderPayload,

    /// Fingerprint of `payload`, captured at `received`
    pub fingerprint: String,

    /// Failures recorded per stage; feeds the correlation token attempt number
    #[serde(default)]
    pub stage_failures: BTreeMap<Stage, u32>,

    /// Print job returned by the POS
    #[serde(default)]
    pub print_job_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Accept an inbound notification; the order starts at `received`
    pub fn received(id: impl Into<String>, payload: OrderPayload) -> Self {
        let now = Utc::now();
        let fingerprint = payload.fingerprint();
        Self {
            id: id.into(),
            stage: Stage::Received,
            retry_count: 0,
            timeline: vec![TimelineEntry {
                stage: Stage::Received,
                entered_at: now,
                duration_ms: None,
                outcome: TimelineOutcome::Accepted,
            }],
            last_error: None,
            payload,
            fingerprint,
            stage_failures: BTreeMap::new(),
            print_job_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            abandoned_at: None,
        }
    }

    pub fn payload(&self) -> &OrderPayload {
        &self.payload
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned_at.is_some()
    }

    /// Correlation token for the next executor call out of `stage`
    pub fn correlation_token(&self, stage: Stage) -> CorrelationToken {
        let failures = self.stage_failures.get(&stage).copied().unwrap_or(0);
        CorrelationToken {
            order_id: self.id.clone(),
            stage,
            attempt: failures + 1,
        }
    }

    /// Move to `stage`, closing the current timeline entry.
    ///
    /// Returns the appended entry. `entered_at` is kept strictly increasing
    /// even if the wall clock stalls or steps backwards.
    pub fn enter_stage(&mut self, stage: Stage, outcome: TimelineOutcome) -> TimelineEntry {
        let mut now = Utc::now();
        if let Some(last) = self.timeline.last_mut() {
            if now <= last.entered_at {
                now = last.entered_at + Duration::microseconds(1);
            }
            if last.duration_ms.is_none() {
                let elapsed = (now - last.entered_at).num_milliseconds().max(0);
                last.duration_ms = Some(elapsed as u64);
            }
        }

        let entry = TimelineEntry {
            stage,
            entered_at: now,
            duration_ms: None,
            outcome,
        };
        self.timeline.push(entry.clone());
        self.stage = stage;
        self.updated_at = now;
        entry
    }

    /// Successful executor run: advance and clear the last error
    pub fn advance_to(&mut self, stage: Stage) -> TimelineEntry {
        let entry = self.enter_stage(stage, TimelineOutcome::Advanced);
        self.last_error = None;
        if stage == Stage::Complete {
            self.completed_at = Some(entry.entered_at);
        }
        entry
    }

    /// Failed executor run: move to `error`, remembering where it failed
    pub fn fail(&mut self, kind: FailureKind, message: String, circuit_open: bool) -> TimelineEntry {
        let failed_stage = self.stage;
        *self.stage_failures.entry(failed_stage).or_insert(0) += 1;
        let entry = self.enter_stage(Stage::Error, TimelineOutcome::Failed);
        self.last_error = Some(LastError {
            kind,
            message,
            occurred_at: entry.entered_at,
            failed_stage,
            circuit_open,
        });
        entry
    }

    /// Leave `error` (or restart from an earlier stage) for a new attempt
    pub fn resume_at(&mut self, stage: Stage, reset_retry_count: bool) -> TimelineEntry {
        if reset_retry_count {
            self.retry_count = 0;
        }
        self.retry_count += 1;
        self.enter_stage(stage, TimelineOutcome::Retried)
    }

    /// Stage a retry without an explicit `from_stage` would resume at
    pub fn resume_stage(&self) -> Option<Stage> {
        self.last_error.as_ref().map(|e| e.failed_stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> OrderPayload {
        OrderPayload {
            items: vec![LineItem {
                sku: "MTG-001".to_string(),
                name: "Booster".to_string(),
                quantity: 2,
                unit_price_cents: 450,
            }],
            customer: Customer {
                name: "Sam".to_string(),
                email: None,
            },
        }
    }

    #[test]
    fn test_stage_sequence() {
        assert_eq!(Stage::Received.next(), Some(Stage::Validated));
        assert_eq!(Stage::Printed.next(), Some(Stage::Complete));
        assert_eq!(Stage::Complete.next(), None);
        assert_eq!(Stage::Error.next(), None);
        assert!(!Stage::Complete.is_resumable());
        assert_eq!("synced".parse::<Stage>().unwrap(), Stage::Synced);
    }

    #[test]
    fn test_timeline_strictly_increasing() {
        let mut order = Order::received("o-1", payload());
        order.advance_to(Stage::Validated);
        order.advance_to(Stage::Synced);
        order.fail(FailureKind::Print, "printer offline".to_string(), false);
        order.resume_at(Stage::Synced, false);

        let timeline = order.timeline();
        assert_eq!(timeline.len(), 5);
        for pair in timeline.windows(2) {
            assert!(pair[0].entered_at < pair[1].entered_at);
            assert!(pair[0].duration_ms.is_some());
        }
        assert!(timeline.last().unwrap().duration_ms.is_none());
    }

    #[test]
    fn test_fail_records_failed_stage() {
        let mut order = Order::received("o-2", payload());
        order.advance_to(Stage::Validated);
        order.fail(FailureKind::Sync, "timeout".to_string(), false);

        assert_eq!(order.stage, Stage::Error);
        assert_eq!(order.resume_stage(), Some(Stage::Validated));
        assert_eq!(order.correlation_token(Stage::Validated).attempt, 2);

        order.resume_at(Stage::Validated, false);
        assert_eq!(order.retry_count, 1);
        // last error survives until the next successful transition
        assert!(order.last_error.is_some());
        order.advance_to(Stage::Synced);
        assert!(order.last_error.is_none());
    }

    #[test]
    fn test_reset_retry_count() {
        let mut order = Order::received("o-3", payload());
        order.retry_count = 3;
        order.fail(FailureKind::Validation, "short".to_string(), false);
        order.resume_at(Stage::Received, true);
        assert_eq!(order.retry_count, 1);
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = payload();
        let mut b = payload();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);

        b.items[0].quantity = 3;
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.total_cents(), 900);
    }

    #[test]
    fn test_correlation_token_format() {
        let order = Order::received("o-4", payload());
        let token = order.correlation_token(Stage::Validated);
        assert_eq!(token.to_string(), "o-4:validated:1");
    }
}
