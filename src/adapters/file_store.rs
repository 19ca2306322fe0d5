//! File-based order store.
//!
//! Each order lives in its own directory:
//! - `order.json`: latest snapshot, replaced atomically on every save
//! - `timeline.jsonl`: append-only timeline entries (one JSON object per line)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::domain::{Order, TimelineEntry};

use super::OrderStore;

/// Order store rooted at a directory ($ORDERFLOW_HOME/orders by default)
pub struct FileOrderStore {
    base_dir: PathBuf,
}

impl FileOrderStore {
    /// Open the store at the configured location
    pub async fn open_default() -> Result<Self> {
        let base_dir = crate::config::orders_dir()?;
        Self::open(base_dir).await
    }

    /// Open (creating if needed) a store rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .with_context(|| format!("Failed to create orders directory: {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn order_dir(&self, order_id: &str) -> Result<PathBuf> {
        let safe = !order_id.is_empty()
            && order_id != "."
            && order_id != ".."
            && !order_id.contains(|c: char| c == '/' || c == '\\');
        if !safe {
            anyhow::bail!("Order id '{}' cannot be used as a directory name", order_id);
        }
        Ok(self.base_dir.join(order_id))
    }

    /// Replay the durable timeline of an order
    pub async fn replay_timeline(&self, order_id: &str) -> Result<Vec<TimelineEntry>> {
        let path = self.order_dir(order_id)?.join("timeline.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open timeline file: {}", path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: TimelineEntry = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse timeline entry: {}", line))?;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// List all stored order ids
    pub async fn list_orders(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if entry.path().join("order.json").exists() {
                        ids.push(name.to_string());
                    }
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl OrderStore for FileOrderStore {
    async fn load(&self, order_id: &str) -> Result<Option<Order>> {
        let path = self.order_dir(order_id)?.join("order.json");
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read order: {}", path.display()))?;
        let order = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse order: {}", path.display()))?;

        Ok(Some(order))
    }

    async fn save(&self, order: &Order) -> Result<()> {
        let dir = self.order_dir(&order.id)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create order directory: {}", dir.display()))?;

        let json = serde_json::to_string_pretty(order).context("Failed to serialize order")?;
        let tmp_path = dir.join("order.json.tmp");
        let path = dir.join("order.json");

        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write order: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to replace order: {}", path.display()))?;

        Ok(())
    }

    async fn append_timeline_entry(&self, order_id: &str, entry: &TimelineEntry) -> Result<()> {
        let dir = self.order_dir(order_id)?;
        fs::create_dir_all(&dir).await?;
        let path = dir.join("timeline.jsonl");

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open timeline file: {}", path.display()))?;

        let json = serde_json::to_string(entry).context("Failed to serialize timeline entry")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write timeline entry")?;
        file.flush().await.context("Failed to flush timeline entry")?;

        Ok(())
    }
}
