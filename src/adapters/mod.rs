//! Collaborator interfaces consumed by the engine.
//!
//! The engine only depends on these traits; concrete inventory services,
//! POS integrations and storage live behind them. Mock and reference
//! implementations ship in the submodules.

pub mod file_store;
pub mod memory_store;
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CorrelationToken, Event, Order, TimelineEntry};

pub use file_store::FileOrderStore;
pub use memory_store::MemoryOrderStore;
pub use mock::{MockInventoryValidator, MockPosClient};

/// A SKU the validator could not cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub sku: String,
    pub requested: u32,
    pub available: u32,
}

/// Answer of the inventory validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ValidationResult {
    Ok,
    InsufficientInventory { shortages: Vec<Shortage> },
}

/// Receipt accepted by the POS printer queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJob {
    pub print_job_id: String,
}

/// Checks stock for an order's line items
#[async_trait]
pub trait InventoryValidator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, order: &Order) -> Result<ValidationResult>;
}

/// External point-of-sale integration.
///
/// Implementations must treat the correlation token as an idempotency key:
/// a repeated token must not apply the same inventory delta or print twice.
#[async_trait]
pub trait PosClient: Send + Sync {
    fn name(&self) -> &str;

    async fn sync_inventory(&self, order: &Order, token: &CorrelationToken) -> Result<()>;

    async fn print_receipt(&self, order: &Order, token: &CorrelationToken) -> Result<PrintJob>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<()>;
}

/// Durable home of orders and their timelines
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load(&self, order_id: &str) -> Result<Option<Order>>;

    /// Persist the latest snapshot of an order
    async fn save(&self, order: &Order) -> Result<()>;

    /// Append one entry to the order's durable timeline
    async fn append_timeline_entry(&self, order_id: &str, entry: &TimelineEntry) -> Result<()>;
}

/// External consumer of published events
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, event: &Event) -> Result<()>;
}
