//! Core automation logic.
//!
//! This module contains:
//! - Engine: per-order stage state machine and lifecycle
//! - Stages: one executor per pipeline stage
//! - CircuitBreaker: guards every POS call
//! - RetryScheduler: backoff policy and armed retry timers
//! - EventBus: fan-out to subscribers and external sinks
//! - AutomationControl: control surface over one engine

pub mod circuit_breaker;
pub mod control;
pub mod engine;
pub mod event_bus;
pub mod retry;
pub mod stages;

// Re-export commonly used types
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use control::{AutomationControl, RetryRequest};
pub use engine::{
    AdvanceOutcome, AutomationStatus, Collaborators, Engine, EngineBuilder, PosConnectionReport,
    PosConnectionStatus, RetryDecision, RetryTicket, StartReport, StatusReport, StopReport,
};
pub use event_bus::{EventBus, Subscription};
pub use retry::{ArmedRetry, RetryPolicy, RetryScheduler};
