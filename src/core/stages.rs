//! Stage executors.
//!
//! One executor per pipeline stage. Each takes the order and its
//! collaborators and returns the outcome of a single attempt; none of them
//! touches engine state. POS calls always go through the circuit breaker.

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::adapters::{InventoryValidator, PosClient, ValidationResult};
use crate::domain::{Order, Stage};
use crate::error::StageError;

use super::circuit_breaker::{BreakerError, CircuitBreaker};

/// Collaborators available to an executor attempt
pub struct StageContext<'a> {
    pub validator: &'a dyn InventoryValidator,
    pub pos: &'a dyn PosClient,
    pub breaker: &'a CircuitBreaker,
    /// Timeout applied to every external call
    pub call_timeout: Duration,
}

/// Successful attempt
#[derive(Debug, Clone)]
pub struct StageSuccess {
    /// Stage the order moves to
    pub next: Stage,
    /// Print job returned by the POS (print stage only)
    pub print_job_id: Option<String>,
    /// Extra detail for the published event
    pub detail: serde_json::Value,
}

impl StageSuccess {
    fn to(next: Stage) -> Self {
        Self {
            next,
            print_job_id: None,
            detail: json!({}),
        }
    }
}

pub type StageResult = Result<StageSuccess, StageError>;

/// Run the executor for the order's current stage
pub async fn execute(order: &Order, ctx: &StageContext<'_>) -> StageResult {
    debug!(order_id = %order.id, stage = %order.stage, "Executing stage");
    match order.stage {
        Stage::Received => validate(order, ctx).await,
        Stage::Validated => sync(order, ctx).await,
        Stage::Synced => print(order, ctx).await,
        Stage::Printed => finalize(order),
        Stage::Complete | Stage::Error => Err(StageError::System(format!(
            "no executor for stage '{}'",
            order.stage
        ))),
    }
}

/// received -> validated
pub async fn validate(order: &Order, ctx: &StageContext<'_>) -> StageResult {
    let result = tokio::time::timeout(ctx.call_timeout, ctx.validator.validate(order)).await;

    match result {
        Ok(Ok(ValidationResult::Ok)) => Ok(StageSuccess::to(Stage::Validated)),
        Ok(Ok(ValidationResult::InsufficientInventory { shortages })) => {
            let skus: Vec<String> = shortages
                .iter()
                .map(|s| format!("{} ({}/{})", s.sku, s.available, s.requested))
                .collect();
            Err(StageError::Validation(format!(
                "insufficient inventory for {}",
                skus.join(", ")
            )))
        }
        Ok(Err(e)) => Err(StageError::System(format!(
            "{} could not validate: {}",
            ctx.validator.name(),
            e
        ))),
        Err(_) => Err(StageError::System(format!(
            "{} timed out after {}ms",
            ctx.validator.name(),
            ctx.call_timeout.as_millis()
        ))),
    }
}

/// validated -> synced
pub async fn sync(order: &Order, ctx: &StageContext<'_>) -> StageResult {
    let token = order.correlation_token(Stage::Validated);
    let result = ctx
        .breaker
        .call(ctx.call_timeout, || ctx.pos.sync_inventory(order, &token))
        .await;

    match result {
        Ok(()) => {
            let mut success = StageSuccess::to(Stage::Synced);
            success.detail = json!({ "correlationToken": token.to_string() });
            Ok(success)
        }
        Err(e) => Err(map_breaker_error(e, Stage::Validated, StageError::Sync)),
    }
}

/// synced -> printed
pub async fn print(order: &Order, ctx: &StageContext<'_>) -> StageResult {
    let token = order.correlation_token(Stage::Synced);
    let result = ctx
        .breaker
        .call(ctx.call_timeout, || ctx.pos.print_receipt(order, &token))
        .await;

    match result {
        Ok(job) => Ok(StageSuccess {
            next: Stage::Printed,
            detail: json!({
                "printJobId": job.print_job_id,
                "correlationToken": token.to_string(),
            }),
            print_job_id: Some(job.print_job_id),
        }),
        Err(e) => Err(map_breaker_error(e, Stage::Synced, StageError::Print)),
    }
}

/// printed -> complete
pub fn finalize(order: &Order) -> StageResult {
    match order.print_job_id {
        Some(ref job) => {
            let mut success = StageSuccess::to(Stage::Complete);
            success.detail = json!({
                "printJobId": job,
                "totalCents": order.payload().total_cents(),
            });
            Ok(success)
        }
        None => Err(StageError::System(format!(
            "order {} reached printed without a print job",
            order.id
        ))),
    }
}

fn map_breaker_error(
    err: BreakerError<anyhow::Error>,
    stage: Stage,
    failed: fn(String) -> StageError,
) -> StageError {
    match err {
        BreakerError::Open { next_probe_at, .. } => StageError::CircuitOpen {
            stage,
            next_probe_at,
        },
        BreakerError::Timeout { timeout, .. } => {
            failed(format!("POS call timed out after {}ms", timeout.as_millis()))
        }
        BreakerError::Failed(e) => failed(e.to_string()),
    }
}
