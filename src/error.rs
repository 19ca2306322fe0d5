//! Error types for the automation engine.
//!
//! `StageError` is the failure taxonomy of stage executors; it never leaves
//! the engine and is folded into an order's `last_error`. `AutomationError`
//! is what control-surface operations return, and `ErrorResponse` is its
//! caller-facing form (a stable code plus a message).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{FailureKind, LastError, Stage};

/// Stable error codes returned to callers of the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AutomationNotRunning,
    AutomationAlreadyRunning,
    BinderposCircuitOpen,
    OrderNotFound,
    OrderAlreadyComplete,
    InventoryValidationFailed,
    PosSyncFailed,
    PrintJobFailed,
    InvalidConfiguration,
    RetryLimitExceeded,
    OrderNotRetryable,
    DuplicateOrder,
    SystemError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AutomationNotRunning => "AUTOMATION_NOT_RUNNING",
            ErrorCode::AutomationAlreadyRunning => "AUTOMATION_ALREADY_RUNNING",
            ErrorCode::BinderposCircuitOpen => "BINDERPOS_CIRCUIT_OPEN",
            ErrorCode::OrderNotFound => "ORDER_NOT_FOUND",
            ErrorCode::OrderAlreadyComplete => "ORDER_ALREADY_COMPLETE",
            ErrorCode::InventoryValidationFailed => "INVENTORY_VALIDATION_FAILED",
            ErrorCode::PosSyncFailed => "POS_SYNC_FAILED",
            ErrorCode::PrintJobFailed => "PRINT_JOB_FAILED",
            ErrorCode::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorCode::RetryLimitExceeded => "RETRY_LIMIT_EXCEEDED",
            ErrorCode::OrderNotRetryable => "ORDER_NOT_RETRYABLE",
            ErrorCode::DuplicateOrder => "DUPLICATE_ORDER",
            ErrorCode::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single stage executor attempt
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// Insufficient inventory
    #[error("Inventory validation failed: {0}")]
    Validation(String),

    /// Transient POS inventory sync failure
    #[error("POS inventory sync failed: {0}")]
    Sync(String),

    /// Receipt printing failed
    #[error("Receipt printing failed: {0}")]
    Print(String),

    /// The breaker rejected the call; nothing was sent to the POS
    #[error("POS circuit open, call to {stage} rejected (next probe at {next_probe_at:?})")]
    CircuitOpen {
        stage: Stage,
        next_probe_at: Option<DateTime<Utc>>,
    },

    /// Unexpected fault
    #[error("System error: {0}")]
    System(String),
}

impl StageError {
    /// Failure kind recorded on the order. A rejected call keeps the kind
    /// of the stage it was made for.
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::Validation(_) => FailureKind::Validation,
            StageError::Sync(_) => FailureKind::Sync,
            StageError::Print(_) => FailureKind::Print,
            StageError::CircuitOpen { stage, .. } => match stage {
                Stage::Synced => FailureKind::Print,
                _ => FailureKind::Sync,
            },
            StageError::System(_) => FailureKind::System,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, StageError::CircuitOpen { .. })
    }
}

/// Error code describing an order's last failure
pub fn last_error_code(error: &LastError) -> ErrorCode {
    if error.circuit_open {
        return ErrorCode::BinderposCircuitOpen;
    }
    match error.kind {
        FailureKind::Validation => ErrorCode::InventoryValidationFailed,
        FailureKind::Sync => ErrorCode::PosSyncFailed,
        FailureKind::Print => ErrorCode::PrintJobFailed,
        FailureKind::System => ErrorCode::SystemError,
    }
}

/// Errors returned by engine and control-surface operations
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Automation is not running")]
    NotRunning,

    #[error("Automation is already running")]
    AlreadyRunning,

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order {0} is already complete")]
    OrderAlreadyComplete(String),

    #[error("Order {order_id} reached the retry limit ({retry_count}/{max_retries})")]
    RetryLimitExceeded {
        order_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Order {order_id} cannot be retried: {reason}")]
    OrderNotRetryable { order_id: String, reason: String },

    #[error("Order {0} already exists with different contents")]
    DuplicateOrder(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Order store failure")]
    Store(#[source] anyhow::Error),
}

impl AutomationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AutomationError::NotRunning => ErrorCode::AutomationNotRunning,
            AutomationError::AlreadyRunning => ErrorCode::AutomationAlreadyRunning,
            AutomationError::OrderNotFound(_) => ErrorCode::OrderNotFound,
            AutomationError::OrderAlreadyComplete(_) => ErrorCode::OrderAlreadyComplete,
            AutomationError::RetryLimitExceeded { .. } => ErrorCode::RetryLimitExceeded,
            AutomationError::OrderNotRetryable { .. } => ErrorCode::OrderNotRetryable,
            AutomationError::DuplicateOrder(_) => ErrorCode::DuplicateOrder,
            AutomationError::InvalidConfiguration(_) => ErrorCode::InvalidConfiguration,
            AutomationError::Store(_) => ErrorCode::SystemError,
        }
    }
}

/// Caller-facing error: a stable code and a readable message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorResponse {}

impl From<AutomationError> for ErrorResponse {
    fn from(err: AutomationError) -> Self {
        // Display never includes the source chain
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::BinderposCircuitOpen).unwrap();
        assert_eq!(json, "\"BINDERPOS_CIRCUIT_OPEN\"");
        assert_eq!(
            ErrorCode::OrderAlreadyComplete.to_string(),
            "ORDER_ALREADY_COMPLETE"
        );
    }

    #[test]
    fn test_circuit_open_keeps_stage_kind() {
        let sync = StageError::CircuitOpen {
            stage: Stage::Validated,
            next_probe_at: None,
        };
        assert_eq!(sync.kind(), FailureKind::Sync);

        let print = StageError::CircuitOpen {
            stage: Stage::Synced,
            next_probe_at: None,
        };
        assert_eq!(print.kind(), FailureKind::Print);
    }

    #[test]
    fn test_store_error_hides_detail() {
        let err = AutomationError::Store(anyhow::anyhow!("disk /var/lib/secret full"));
        let response = ErrorResponse::from(err);
        assert_eq!(response.code, ErrorCode::SystemError);
        assert!(!response.message.contains("secret"));
    }
}
