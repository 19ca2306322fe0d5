//! Command-line interface for orderflow.
//!
//! Provides commands for simulating order traffic against mock
//! collaborators, inspecting persisted orders, retrying or abandoning failed
//! orders, checking the POS connection, and showing configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::time::Instant;

use crate::adapters::{
    FileOrderStore, MemoryOrderStore, MockInventoryValidator, MockPosClient, OrderStore,
};
use crate::config::{self, AutomationConfig};
use crate::core::{AutomationControl, Collaborators, Engine, RetryRequest, Subscription};
use crate::domain::{Customer, LineItem, OrderPayload, Stage};

/// orderflow - Automation engine for retail order fulfilment
#[derive(Parser, Debug)]
#[command(name = "orderflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Push orders through an engine running against mock collaborators
    Simulate {
        /// Number of generated orders (ignored with --orders)
        #[arg(short, long, default_value = "5")]
        count: usize,

        /// JSON file with an array of orders to submit
        #[arg(short, long)]
        orders: Option<PathBuf>,

        /// Fail the next N inventory syncs
        #[arg(long, default_value = "0")]
        fail_syncs: u32,

        /// Fail the next N receipt prints
        #[arg(long, default_value = "0")]
        fail_prints: u32,

        /// Simulated POS latency in milliseconds
        #[arg(long, default_value = "0")]
        latency_ms: u64,

        /// Persist orders to the file store instead of memory
        #[arg(long)]
        persist: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// List persisted orders
    Orders,

    /// Show one persisted order with its timeline
    Show {
        /// Order ID
        order_id: String,
    },

    /// Retry a failed order
    Retry {
        /// Order ID
        order_id: String,

        /// Stage to resume at (defaults to the stage that failed)
        #[arg(long)]
        from_stage: Option<Stage>,

        /// Reset the retry counter before retrying
        #[arg(long)]
        reset: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// Abandon a failed order
    Abandon {
        /// Order ID
        order_id: String,
    },

    /// Check the POS connection through the circuit breaker
    TestPos {
        /// Make the mock POS fail the check
        #[arg(long)]
        offline: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Simulate {
                count,
                orders,
                fail_syncs,
                fail_prints,
                latency_ms,
                persist,
                timeout_secs,
            } => {
                let options = SimulateOptions {
                    count,
                    orders,
                    fail_syncs,
                    fail_prints,
                    latency: Duration::from_millis(latency_ms),
                    persist,
                    timeout: Duration::from_secs(timeout_secs),
                };
                simulate(options).await
            }
            Commands::Orders => list_orders().await,
            Commands::Show { order_id } => show_order(&order_id).await,
            Commands::Retry {
                order_id,
                from_stage,
                reset,
                timeout_secs,
            } => {
                let request = RetryRequest {
                    from_stage,
                    reset_retry_count: reset,
                };
                retry_order(&order_id, request, Duration::from_secs(timeout_secs)).await
            }
            Commands::Abandon { order_id } => abandon_order(&order_id).await,
            Commands::TestPos { offline } => test_pos(offline).await,
            Commands::Config => show_config().await,
        }
    }
}

struct SimulateOptions {
    count: usize,
    orders: Option<PathBuf>,
    fail_syncs: u32,
    fail_prints: u32,
    latency: Duration,
    persist: bool,
    timeout: Duration,
}

/// One entry of a `--orders` file
#[derive(Debug, Deserialize)]
struct OrderSpec {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    payload: OrderPayload,
}

/// Automation settings from the config file, forced into mock mode
fn mock_config() -> Result<AutomationConfig> {
    let mut automation = config::config()?.automation.clone();
    automation.mock_mode = true;
    Ok(automation)
}

/// Build a control surface over mock collaborators and the given store
fn mock_control(store: Arc<dyn OrderStore>, pos: Arc<MockPosClient>) -> Result<AutomationControl> {
    let cfg = config::config()?;
    let validator = Arc::new(MockInventoryValidator::approve_all());

    let engine = Engine::builder(Collaborators {
        validator: validator.clone(),
        pos: pos.clone(),
        store,
    })
    .circuit_breaker(cfg.circuit_breaker.clone())
    .mock_pos(pos)
    .mock_validator(validator)
    .build();

    Ok(AutomationControl::new(engine))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn generated_payload(n: usize) -> OrderPayload {
    OrderPayload {
        items: vec![
            LineItem {
                sku: format!("SKU-{:04}", n % 50),
                name: format!("Sealed product #{}", n % 50),
                quantity: (n % 3 + 1) as u32,
                unit_price_cents: 499 + (n as u64 % 7) * 250,
            },
            LineItem {
                sku: "SLV-100".to_string(),
                name: "Card sleeves (100)".to_string(),
                quantity: 1,
                unit_price_cents: 899,
            },
        ],
        customer: Customer {
            name: format!("Walk-in customer {}", n),
            email: None,
        },
    }
}

/// Print every event until the engine has nothing left to do
async fn stream_until_idle(
    control: &AutomationControl,
    events: &mut Subscription,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        while let Some(event) = events.try_recv() {
            println!("{}", serde_json::to_string(event.as_ref())?);
        }

        let status = control.status();
        if status.stats.orders_in_progress == 0 && status.health.armed_retries == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "Timed out with {} orders in progress and {} retries armed",
                status.stats.orders_in_progress,
                status.health.armed_retries
            );
        }

        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            println!("{}", serde_json::to_string(event.as_ref())?);
        }
    }
}

/// Run a simulation
async fn simulate(options: SimulateOptions) -> Result<()> {
    let pos = Arc::new(MockPosClient::new().with_latency(options.latency));
    pos.fail_next_syncs(options.fail_syncs);
    pos.fail_next_prints(options.fail_prints);

    let store: Arc<dyn OrderStore> = if options.persist {
        Arc::new(FileOrderStore::open_default().await?)
    } else {
        Arc::new(MemoryOrderStore::new())
    };

    let orders: Vec<OrderSpec> = match options.orders {
        Some(ref path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read orders file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse orders file: {}", path.display()))?
        }
        None => (1..=options.count)
            .map(|n| OrderSpec {
                id: None,
                payload: generated_payload(n),
            })
            .collect(),
    };

    let control = mock_control(store, pos)?;
    let mut events = control.engine().subscribe();
    control.start(mock_config()?)?;

    for incoming in orders {
        if let Err(e) = control.submit_order(incoming.id, incoming.payload).await {
            eprintln!("[submit rejected: {} {}]", e.code, e.message);
        }
    }

    let waited = stream_until_idle(&control, &mut events, options.timeout).await;
    let status = control.status();
    let report = control.stop()?;

    eprintln!();
    eprintln!(
        "[processed {} orders, {} failed, success rate {:.1}%, uptime {}ms]",
        report.processed_orders,
        status.stats.orders_failed,
        status.stats.success_rate,
        report.uptime_ms
    );
    waited
}

/// List persisted orders
async fn list_orders() -> Result<()> {
    let store = FileOrderStore::open_default().await?;
    let ids = store.list_orders().await?;

    if ids.is_empty() {
        println!("No orders found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<8} {:<25}", "ORDER ID", "STAGE", "RETRIES", "UPDATED");
    println!("{}", "-".repeat(83));

    for id in ids {
        if let Some(order) = store.load(&id).await? {
            let stage = if order.is_abandoned() {
                "abandoned".to_string()
            } else {
                order.stage.to_string()
            };
            println!(
                "{:<38} {:<10} {:<8} {:<25}",
                order.id,
                stage,
                order.retry_count,
                order.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(())
}

/// Show one order with its timeline
async fn show_order(order_id: &str) -> Result<()> {
    let store = FileOrderStore::open_default().await?;
    let order = store
        .load(order_id)
        .await?
        .with_context(|| format!("Order not found: {}", order_id))?;

    println!("Order:    {}", order.id);
    println!("Stage:    {}", order.stage);
    println!("Retries:  {}", order.retry_count);
    println!("Total:    {} cents", order.payload().total_cents());
    if let Some(ref job) = order.print_job_id {
        println!("Print job: {}", job);
    }
    if let Some(ref err) = order.last_error {
        println!(
            "Last error: [{:?}] at {} - {}",
            err.kind, err.failed_stage, err.message
        );
    }
    if let Some(abandoned) = order.abandoned_at {
        println!("Abandoned: {}", abandoned);
    }

    println!("\nTimeline:");
    for entry in store.replay_timeline(order_id).await? {
        let duration = entry
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {:<10} {:<9} {:?}",
            entry.entered_at.format("%H:%M:%S%.3f"),
            entry.stage,
            duration,
            entry.outcome
        );
    }

    Ok(())
}

/// Retry a persisted order and wait until it settles
async fn retry_order(order_id: &str, request: RetryRequest, timeout: Duration) -> Result<()> {
    let store: Arc<dyn OrderStore> = Arc::new(FileOrderStore::open_default().await?);
    let control = mock_control(store, Arc::new(MockPosClient::new()))?;
    let mut events = control.engine().subscribe();
    control.start(mock_config()?)?;

    let ticket = match control.retry_order(order_id, request).await {
        Ok(ticket) => ticket,
        Err(e) => {
            control.stop()?;
            return Err(e.into());
        }
    };
    print_json(&ticket)?;

    let deadline = Instant::now() + timeout;
    let settled = loop {
        let order = control.order(order_id).await?;
        let waiting = control.engine().armed_retry(order_id).is_some();
        if order.is_complete() || (order.stage == Stage::Error && !waiting) {
            break order;
        }
        if Instant::now() >= deadline {
            control.stop()?;
            anyhow::bail!("Timed out waiting for order {} (at {})", order_id, order.stage);
        }
        let _ = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    };

    control.stop()?;
    eprintln!("[order {} is now {}]", settled.id, settled.stage);
    Ok(())
}

/// Abandon a persisted order
async fn abandon_order(order_id: &str) -> Result<()> {
    let store: Arc<dyn OrderStore> = Arc::new(FileOrderStore::open_default().await?);
    let control = mock_control(store, Arc::new(MockPosClient::new()))?;

    let result = control.abandon_order(order_id).await;
    match result {
        Ok(order) => {
            eprintln!("[order {} abandoned at {}]", order.id, order.stage);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Check the POS connection
async fn test_pos(offline: bool) -> Result<()> {
    let pos = Arc::new(MockPosClient::new());
    pos.set_offline(offline);

    let control = mock_control(Arc::new(MemoryOrderStore::new()), pos)?;
    control.start(mock_config()?)?;
    let report = control.test_pos_connection().await;
    control.stop()?;

    print_json(&report)
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("orderflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home (engine state): {}", cfg.home.display());
    println!("Orders:              {}", cfg.home.join("orders").display());
    println!();
    print!("{}", serde_yaml::to_string(cfg)?);

    Ok(())
}
