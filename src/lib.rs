//! orderflow - Automation engine for retail order fulfilment
//!
//! Moves each inbound order through a fixed pipeline against an inventory
//! validator and a point-of-sale system, retrying transient failures and
//! failing fast while the POS is unhealthy.
//!
//! # Architecture
//!
//! - Every order is a small state machine:
//!   `received -> validated -> synced -> printed -> complete`, with `error`
//!   reachable from any working stage
//! - Stage transitions are persisted to an order store and broadcast on an
//!   event bus; the store is the source of truth for history
//! - POS calls pass through a shared circuit breaker
//! - Sync and print failures are retried with exponential backoff
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits, stores and mock collaborators
//! - `core`: Engine, stage executors, circuit breaker, retries, event bus
//! - `domain`: Orders, timelines and events
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Push ten mock orders through the pipeline, streaming events
//! orderflow simulate --count 10
//!
//! # Inspect and retry a failed order
//! orderflow show <order-id>
//! orderflow retry <order-id> --from-stage synced
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use crate::config::AutomationConfig;
pub use crate::core::{AutomationControl, CircuitBreaker, Engine, EventBus};
pub use domain::{Event, EventType, Order, OrderPayload, Stage};
pub use error::{AutomationError, ErrorCode, ErrorResponse};
