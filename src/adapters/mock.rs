//! Mock collaborators used in mock mode, simulations and tests.
//!
//! `MockPosClient` honours correlation tokens the way a real POS must: a
//! repeated token is acknowledged without applying the change again.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::{CorrelationToken, Order};

use super::{InventoryValidator, PosClient, PrintJob, Shortage, ValidationResult};

#[derive(Default)]
struct MockPosState {
    offline: bool,
    sync_failures_remaining: u32,
    print_failures_remaining: u32,
    ping_failures_remaining: u32,
    sync_calls: u64,
    print_calls: u64,
    ping_calls: u64,
    applied_syncs: HashSet<String>,
    print_jobs: HashMap<String, String>,
    next_job: u64,
}

/// Scriptable in-process POS client
#[derive(Default)]
pub struct MockPosClient {
    latency: Duration,
    state: Mutex<MockPosState>,
}

impl MockPosClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate network latency on every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `n` inventory syncs
    pub fn fail_next_syncs(&self, n: u32) {
        self.state.lock().sync_failures_remaining = n;
    }

    /// Fail the next `n` receipt prints
    pub fn fail_next_prints(&self, n: u32) {
        self.state.lock().print_failures_remaining = n;
    }

    /// Fail the next `n` connection checks
    pub fn fail_next_pings(&self, n: u32) {
        self.state.lock().ping_failures_remaining = n;
    }

    /// Fail every call until set back online
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn sync_calls(&self) -> u64 {
        self.state.lock().sync_calls
    }

    pub fn print_calls(&self) -> u64 {
        self.state.lock().print_calls
    }

    pub fn ping_calls(&self) -> u64 {
        self.state.lock().ping_calls
    }

    /// Distinct inventory deltas actually applied
    pub fn applied_syncs(&self) -> usize {
        self.state.lock().applied_syncs.len()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn take_failure(remaining: &mut u32) -> bool {
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl PosClient for MockPosClient {
    fn name(&self) -> &str {
        "mock-pos"
    }

    async fn sync_inventory(&self, order: &Order, token: &CorrelationToken) -> Result<()> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        state.sync_calls += 1;
        if state.offline || take_failure(&mut state.sync_failures_remaining) {
            anyhow::bail!("POS inventory sync unavailable for order {}", order.id);
        }

        if !state.applied_syncs.insert(token.to_string()) {
            debug!(token = %token, "Duplicate sync token, already applied");
        }
        Ok(())
    }

    async fn print_receipt(&self, order: &Order, token: &CorrelationToken) -> Result<PrintJob> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        state.print_calls += 1;
        if state.offline || take_failure(&mut state.print_failures_remaining) {
            anyhow::bail!("Receipt printer unavailable for order {}", order.id);
        }

        let key = token.to_string();
        if let Some(existing) = state.print_jobs.get(&key) {
            return Ok(PrintJob {
                print_job_id: existing.clone(),
            });
        }

        state.next_job += 1;
        let print_job_id = format!("job-{:06}", state.next_job);
        state.print_jobs.insert(key, print_job_id.clone());
        Ok(PrintJob { print_job_id })
    }

    async fn ping(&self) -> Result<()> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        state.ping_calls += 1;
        if state.offline || take_failure(&mut state.ping_failures_remaining) {
            anyhow::bail!("POS did not answer");
        }
        Ok(())
    }
}

/// Inventory validator backed by a fixed stock table (or approving everything)
#[derive(Default)]
pub struct MockInventoryValidator {
    stock: Option<HashMap<String, u32>>,
    calls: Mutex<u64>,
}

impl MockInventoryValidator {
    /// Approve every order
    pub fn approve_all() -> Self {
        Self::default()
    }

    /// Approve only what `stock` covers
    pub fn with_stock<I, S>(stock: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            stock: Some(stock.into_iter().map(|(sku, qty)| (sku.into(), qty)).collect()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        *self.calls.lock()
    }
}

#[async_trait]
impl InventoryValidator for MockInventoryValidator {
    fn name(&self) -> &str {
        "mock-inventory"
    }

    async fn validate(&self, order: &Order) -> Result<ValidationResult> {
        *self.calls.lock() += 1;

        let Some(ref stock) = self.stock else {
            return Ok(ValidationResult::Ok);
        };

        let shortages: Vec<Shortage> = order
            .payload()
            .items
            .iter()
            .filter_map(|item| {
                let available = stock.get(&item.sku).copied().unwrap_or(0);
                (available < item.quantity).then(|| Shortage {
                    sku: item.sku.clone(),
                    requested: item.quantity,
                    available,
                })
            })
            .collect();

        if shortages.is_empty() {
            Ok(ValidationResult::Ok)
        } else {
            Ok(ValidationResult::InsufficientInventory { shortages })
        }
    }
}
