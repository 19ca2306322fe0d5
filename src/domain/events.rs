//! Events published to subscribers.
//!
//! Events describe stage transitions and automation/circuit status changes.
//! They are notifications only; the order store stays the source of truth.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event was published
    pub timestamp: DateTime<Utc>,

    /// Type of event
    pub event_type: EventType,

    /// The order this event belongs to (order events only)
    pub order_id: Option<String>,

    /// Per-order sequence number, starting at 1 (0 for non-order events)
    pub sequence: u64,

    /// Event-specific body
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(event_type: EventType, order_id: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            order_id,
            sequence: 0,
            payload,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Types of events the engine publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "order:received")]
    OrderReceived,

    #[serde(rename = "order:validated")]
    OrderValidated,

    #[serde(rename = "order:synced")]
    OrderSynced,

    #[serde(rename = "order:printed")]
    OrderPrinted,

    #[serde(rename = "order:complete")]
    OrderComplete,

    #[serde(rename = "order:error")]
    OrderError,

    /// Engine started or stopped
    #[serde(rename = "automation:status")]
    AutomationStatus,

    /// Circuit breaker changed state
    #[serde(rename = "circuitbreaker:status")]
    CircuitBreakerStatus,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::OrderReceived => "order:received",
            EventType::OrderValidated => "order:validated",
            EventType::OrderSynced => "order:synced",
            EventType::OrderPrinted => "order:printed",
            EventType::OrderComplete => "order:complete",
            EventType::OrderError => "order:error",
            EventType::AutomationStatus => "automation:status",
            EventType::CircuitBreakerStatus => "circuitbreaker:status",
        }
    }

    pub fn is_order_event(self) -> bool {
        !matches!(
            self,
            EventType::AutomationStatus | EventType::CircuitBreakerStatus
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            EventType::OrderSynced,
            Some("o-1".to_string()),
            serde_json::json!({ "stage": "synced" }),
        )
        .with_sequence(3);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"order:synced\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::OrderSynced);
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.order_id.as_deref(), Some("o-1"));
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::CircuitBreakerStatus.to_string(), "circuitbreaker:status");
        assert!(EventType::OrderError.is_order_event());
        assert!(!EventType::AutomationStatus.is_order_event());
    }
}
