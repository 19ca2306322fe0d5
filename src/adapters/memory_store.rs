//! In-memory order store for tests and ephemeral simulations.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{Order, TimelineEntry};

use super::OrderStore;

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: Mutex<HashMap<String, Order>>,
    timelines: Mutex<HashMap<String, Vec<TimelineEntry>>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeline entries appended for an order, in append order
    pub fn appended_entries(&self, order_id: &str) -> Vec<TimelineEntry> {
        self.timelines
            .lock()
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn order_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.orders.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn load(&self, order_id: &str) -> Result<Option<Order>> {
        Ok(self.orders.lock().get(order_id).cloned())
    }

    async fn save(&self, order: &Order) -> Result<()> {
        self.orders.lock().insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn append_timeline_entry(&self, order_id: &str, entry: &TimelineEntry) -> Result<()> {
        self.timelines
            .lock()
            .entry(order_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }
}
