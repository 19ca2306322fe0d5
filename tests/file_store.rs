//! File Store Integration Tests
//!
//! Orders processed by the engine survive a restart: the snapshot and the
//! append-only timeline on disk are enough to pick a failed order up again.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use orderflow::adapters::{
    FileOrderStore, InventoryValidator, MockInventoryValidator, MockPosClient, OrderStore,
};
use orderflow::config::AutomationConfig;
use orderflow::core::{CircuitBreakerConfig, Collaborators, Engine, Subscription};
use orderflow::domain::{Customer, EventType, LineItem, OrderPayload, Stage, TimelineOutcome};

fn payload() -> OrderPayload {
    OrderPayload {
        items: vec![
            LineItem {
                sku: "MTG-DMU".to_string(),
                name: "Draft booster".to_string(),
                quantity: 3,
                unit_price_cents: 449,
            },
            LineItem {
                sku: "DICE-6".to_string(),
                name: "Spindown die".to_string(),
                quantity: 1,
                unit_price_cents: 299,
            },
        ],
        customer: Customer {
            name: "Jordan".to_string(),
            email: None,
        },
    }
}

async fn engine_over(dir: &TempDir, validator: Arc<dyn InventoryValidator>) -> Engine {
    let store = FileOrderStore::open(dir.path()).await.unwrap();
    Engine::new(
        Collaborators {
            validator,
            pos: Arc::new(MockPosClient::new()),
            store: Arc::new(store),
        },
        CircuitBreakerConfig::default(),
    )
}

fn config() -> AutomationConfig {
    AutomationConfig {
        retry_base_delay_ms: 10,
        ..Default::default()
    }
}

async fn wait_for(events: &mut Subscription, order_id: &str, event_type: EventType) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if event.order_id.as_deref() == Some(order_id) && event.event_type == event_type {
            return;
        }
    }
}

#[tokio::test]
async fn test_completed_order_is_persisted() {
    let temp = TempDir::new().unwrap();
    let engine = engine_over(&temp, Arc::new(MockInventoryValidator::approve_all())).await;
    let mut events = engine.subscribe();
    engine.start(config()).unwrap();

    engine
        .submit(Some("web-1001".to_string()), payload())
        .await
        .unwrap();
    wait_for(&mut events, "web-1001", EventType::OrderComplete).await;
    engine.stop().unwrap();

    let store = FileOrderStore::open(temp.path()).await.unwrap();
    assert_eq!(store.list_orders().await.unwrap(), vec!["web-1001"]);

    let order = store.load("web-1001").await.unwrap().unwrap();
    assert_eq!(order.stage, Stage::Complete);
    assert_eq!(order.payload().total_cents(), 3 * 449 + 299);

    let timeline = store.replay_timeline("web-1001").await.unwrap();
    assert_eq!(timeline, order.timeline().to_vec());
    assert_eq!(timeline.len(), 5);
    assert!(timeline
        .iter()
        .all(|e| e.outcome == TimelineOutcome::Accepted || e.outcome == TimelineOutcome::Advanced));
}

#[tokio::test]
async fn test_failed_order_retried_after_restart() {
    let temp = TempDir::new().unwrap();

    // first process: out of stock, order parks in error
    {
        let engine = engine_over(&temp, Arc::new(MockInventoryValidator::with_stock([("MTG-DMU", 1)]))).await;
        let mut events = engine.subscribe();
        engine.start(config()).unwrap();

        engine
            .submit(Some("web-2002".to_string()), payload())
            .await
            .unwrap();
        wait_for(&mut events, "web-2002", EventType::OrderError).await;
        engine.stop().unwrap();
    }

    // second process: stock arrived, operator retries
    let engine = engine_over(&temp, Arc::new(MockInventoryValidator::approve_all())).await;
    let mut events = engine.subscribe();
    engine.start(config()).unwrap();

    let stored = engine.order("web-2002").await.unwrap();
    assert_eq!(stored.stage, Stage::Error);
    assert_eq!(stored.resume_stage(), Some(Stage::Received));

    let ticket = engine.retry_order("web-2002", None, false).await.unwrap();
    assert_eq!(ticket.from_stage, Stage::Received);
    assert_eq!(ticket.retry_count, 1);
    wait_for(&mut events, "web-2002", EventType::OrderComplete).await;

    // resubmitting the same notification is a no-op
    let again = engine
        .submit(Some("web-2002".to_string()), payload())
        .await
        .unwrap();
    assert_eq!(again.stage, Stage::Complete);
    engine.stop().unwrap();

    let store = FileOrderStore::open(temp.path()).await.unwrap();
    let stages: Vec<Stage> = store
        .replay_timeline("web-2002")
        .await
        .unwrap()
        .iter()
        .map(|e| e.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            Stage::Received,
            Stage::Error,
            Stage::Received,
            Stage::Validated,
            Stage::Synced,
            Stage::Printed,
            Stage::Complete,
        ]
    );
}
