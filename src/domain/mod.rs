//! Domain types for the order automation engine.
//!
//! This module contains the core data structures:
//! - Order: stage, retry count, timeline and last error
//! - Events: notifications published to subscribers

pub mod events;
pub mod order;

// Re-export commonly used types
pub use events::{Event, EventType};
pub use order::{
    CorrelationToken, Customer, FailureKind, LastError, LineItem, Order, OrderPayload, Stage,
    TimelineEntry, TimelineOutcome,
};
