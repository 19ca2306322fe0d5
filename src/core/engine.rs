//! Pipeline engine: the per-order state machine.
//!
//! ```text
//! received ──► validated ──► synced ──► printed ──► complete
//!     │            │            │          │
//!     └────────────┴─────┬──────┴──────────┘
//!                        ▼
//!                      error ── retry (auto or manual) ──► failed stage
//! ```
//!
//! Every order gets its own drive task that calls [`Engine::advance`] until
//! the order completes, fails, or the engine stops. A per-order async lock
//! keeps each order's stage executors strictly sequential while different
//! orders run in parallel (bounded by `batch_size`). Failures never escape
//! the engine: they become an `error` transition with `last_error` filled.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    EventSink, InventoryValidator, MockInventoryValidator, MockPosClient, OrderStore, PosClient,
};
use crate::config::AutomationConfig;
use crate::domain::{EventType, FailureKind, Order, OrderPayload, Stage, TimelineEntry};
use crate::error::{last_error_code, AutomationError, StageError};

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
use super::event_bus::{EventBus, Subscription};
use super::retry::{ArmedRetry, RetryPolicy, RetryScheduler};
use super::stages::{self, StageContext, StageSuccess};

/// External collaborators used outside mock mode
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn InventoryValidator>,
    pub pos: Arc<dyn PosClient>,
    pub store: Arc<dyn OrderStore>,
}

/// Whether the engine accepts work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Running,
    Stopped,
}

/// Result of `start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub status: AutomationStatus,
    pub started_at: DateTime<Utc>,
}

/// Result of `stop`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub status: AutomationStatus,
    pub stopped_at: DateTime<Utc>,
    /// Orders completed during the run that just ended
    pub processed_orders: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Orders completed since the engine was created
    pub orders_processed: u64,
    /// Orders being worked on (any stage except error)
    pub orders_in_progress: usize,
    /// Orders sitting in error
    pub orders_failed: usize,
    /// Percentage of settled orders that completed (100 when none settled)
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub healthy: bool,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub armed_retries: usize,
    pub subscribers: usize,
    pub uptime_ms: Option<u64>,
}

/// Result of `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: AutomationStatus,
    pub config: AutomationConfig,
    pub stats: EngineStats,
    pub health: EngineHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryTicketStatus {
    Retrying,
}

/// Result of a manual retry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryTicket {
    pub status: RetryTicketStatus,
    pub from_stage: Stage,
    pub retry_count: u32,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosConnectionStatus {
    Connected,
    Failed,
    CircuitOpen,
}

/// Result of `test_pos_connection`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PosConnectionReport {
    pub status: PosConnectionStatus,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub circuit_breaker: CircuitBreakerSnapshot,
}

/// What happened to a failed order's retry
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Timer armed
    Scheduled(ArmedRetry),
    /// Engine stopped; re-armed on the next start
    Parked { attempt: u32 },
    /// `max_retries` reached; waits for an operator
    Exhausted,
    /// Failure kind is not retried automatically
    Manual,
}

/// Outcome of one `advance` call
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    Advanced {
        from: Stage,
        to: Stage,
    },
    Failed {
        from: Stage,
        kind: FailureKind,
        retry: RetryDecision,
    },
    /// The order is in error; only a retry moves it
    AwaitingRetry {
        failed_stage: Option<Stage>,
    },
}

struct Lifecycle {
    status: AutomationStatus,
    config: AutomationConfig,
    policy: RetryPolicy,
    started_at: Option<DateTime<Utc>>,
    run_started: Option<Instant>,
    processed_at_start: u64,
    permits: Arc<Semaphore>,
}

#[derive(Default)]
struct Tracking {
    /// Orders the engine is responsible for, with their current stage
    active: HashMap<String, Stage>,
    /// Drive loops interrupted by `stop`
    halted: HashSet<String>,
    /// Retries suppressed while stopped (order id -> attempt)
    parked: HashMap<String, u32>,
}

struct MockCollaborators {
    validator: Arc<MockInventoryValidator>,
    pos: Arc<MockPosClient>,
}

struct EngineInner {
    collaborators: Collaborators,
    mocks: MockCollaborators,
    breaker: CircuitBreaker,
    bus: EventBus,
    scheduler: RetryScheduler,
    lifecycle: RwLock<Lifecycle>,
    running: AtomicBool,
    tracking: Mutex<Tracking>,
    order_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    processed: AtomicU64,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    collaborators: Collaborators,
    breaker_config: CircuitBreakerConfig,
    mock_validator: Arc<MockInventoryValidator>,
    mock_pos: Arc<MockPosClient>,
    bus: EventBus,
}

impl EngineBuilder {
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// POS client used while `mock_mode` is on
    pub fn mock_pos(mut self, pos: Arc<MockPosClient>) -> Self {
        self.mock_pos = pos;
        self
    }

    /// Validator used while `mock_mode` is on
    pub fn mock_validator(mut self, validator: Arc<MockInventoryValidator>) -> Self {
        self.mock_validator = validator;
        self
    }

    pub fn build(self) -> Engine {
        let breaker =
            CircuitBreaker::new("binderpos", self.breaker_config).with_event_bus(self.bus.clone());
        let config = AutomationConfig::default();

        let lifecycle = Lifecycle {
            status: AutomationStatus::Stopped,
            policy: config.retry_policy(),
            permits: Arc::new(Semaphore::new(config.batch_size)),
            config,
            started_at: None,
            run_started: None,
            processed_at_start: 0,
        };

        Engine {
            inner: Arc::new(EngineInner {
                collaborators: self.collaborators,
                mocks: MockCollaborators {
                    validator: self.mock_validator,
                    pos: self.mock_pos,
                },
                breaker,
                bus: self.bus,
                scheduler: RetryScheduler::new(),
                lifecycle: RwLock::new(lifecycle),
                running: AtomicBool::new(false),
                tracking: Mutex::new(Tracking::default()),
                order_locks: Mutex::new(HashMap::new()),
                processed: AtomicU64::new(0),
            }),
        }
    }
}

/// The automation engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(collaborators: Collaborators) -> EngineBuilder {
        EngineBuilder {
            collaborators,
            breaker_config: CircuitBreakerConfig::default(),
            mock_validator: Arc::new(MockInventoryValidator::approve_all()),
            mock_pos: Arc::new(MockPosClient::new()),
            bus: EventBus::new(),
        }
    }

    pub fn new(collaborators: Collaborators, breaker_config: CircuitBreakerConfig) -> Self {
        Self::builder(collaborators)
            .circuit_breaker(breaker_config)
            .build()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start accepting and advancing orders
    #[instrument(skip(self, config))]
    pub fn start(&self, config: AutomationConfig) -> Result<StartReport, AutomationError> {
        config.validate()?;

        let started_at = Utc::now();
        {
            let mut lc = self.inner.lifecycle.write();
            if lc.status == AutomationStatus::Running {
                return Err(AutomationError::AlreadyRunning);
            }
            lc.status = AutomationStatus::Running;
            lc.policy = config.retry_policy();
            lc.permits = Arc::new(Semaphore::new(config.batch_size));
            lc.config = config.clone();
            lc.started_at = Some(started_at);
            lc.run_started = Some(Instant::now());
            lc.processed_at_start = self.inner.processed.load(Ordering::SeqCst);
            self.inner.running.store(true, Ordering::SeqCst);
        }

        info!(
            batch_size = config.batch_size,
            max_retries = config.max_retries,
            mock_mode = config.mock_mode,
            "Automation started"
        );
        self.inner.bus.publish(
            EventType::AutomationStatus,
            None,
            json!({
                "status": AutomationStatus::Running,
                "startedAt": started_at,
                "config": config,
            }),
        );

        self.resume_pending();

        Ok(StartReport {
            status: AutomationStatus::Running,
            started_at,
        })
    }

    /// Stop advancing orders.
    ///
    /// In-flight stage executors finish their attempt; afterwards no new
    /// advance or retry runs until the next `start`.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<StopReport, AutomationError> {
        let stopped_at = Utc::now();
        let (uptime_ms, processed_orders) = {
            let mut lc = self.inner.lifecycle.write();
            if lc.status != AutomationStatus::Running {
                return Err(AutomationError::NotRunning);
            }
            lc.status = AutomationStatus::Stopped;
            self.inner.running.store(false, Ordering::SeqCst);

            let uptime_ms = lc
                .run_started
                .take()
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            let processed = self
                .inner
                .processed
                .load(Ordering::SeqCst)
                .saturating_sub(lc.processed_at_start);
            (uptime_ms, processed)
        };

        info!(processed_orders, uptime_ms, "Automation stopped");
        self.inner.bus.publish(
            EventType::AutomationStatus,
            None,
            json!({
                "status": AutomationStatus::Stopped,
                "stoppedAt": stopped_at,
                "processedOrders": processed_orders,
                "uptimeMs": uptime_ms,
            }),
        );

        Ok(StopReport {
            status: AutomationStatus::Stopped,
            stopped_at,
            processed_orders,
            uptime_ms,
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Current status, configuration, counters and health
    pub fn status(&self) -> StatusReport {
        let (status, config, uptime_ms) = {
            let lc = self.inner.lifecycle.read();
            (
                lc.status,
                lc.config.clone(),
                lc.run_started.map(|t| t.elapsed().as_millis() as u64),
            )
        };

        let (in_progress, failed) = {
            let tracking = self.inner.tracking.lock();
            let failed = tracking
                .active
                .values()
                .filter(|s| **s == Stage::Error)
                .count();
            (tracking.active.len() - failed, failed)
        };

        let processed = self.inner.processed.load(Ordering::SeqCst);
        let settled = processed + failed as u64;
        let success_rate = if settled == 0 {
            100.0
        } else {
            processed as f64 / settled as f64 * 100.0
        };

        let circuit_breaker = self.inner.breaker.snapshot();
        let healthy = status == AutomationStatus::Running
            && circuit_breaker.state == CircuitState::Closed;

        StatusReport {
            status,
            config,
            stats: EngineStats {
                orders_processed: processed,
                orders_in_progress: in_progress,
                orders_failed: failed,
                success_rate,
            },
            health: EngineHealth {
                healthy,
                circuit_breaker,
                armed_retries: self.inner.scheduler.armed_count(),
                subscribers: self.inner.bus.subscriber_count(),
                uptime_ms,
            },
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    /// Forward every event to an external sink on its own task
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        self.inner.bus.attach_sink(sink)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Retry timer armed for an order, if any
    pub fn armed_retry(&self, order_id: &str) -> Option<ArmedRetry> {
        self.inner.scheduler.armed(order_id)
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Accept an inbound order notification and start processing it
    #[instrument(skip(self, payload))]
    pub async fn submit(
        &self,
        order_id: Option<String>,
        payload: OrderPayload,
    ) -> Result<Order, AutomationError> {
        self.ensure_running()?;
        let order_id = order_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let lock = self.order_lock(&order_id);
        let guard = lock.lock().await;

        if let Some(existing) = self.store().load(&order_id).await.map_err(AutomationError::Store)? {
            if existing.fingerprint == payload.fingerprint() {
                debug!(%order_id, "Duplicate notification, returning stored order");
                return Ok(existing);
            }
            return Err(AutomationError::DuplicateOrder(order_id));
        }

        let order = Order::received(order_id.clone(), payload);
        if let Some(entry) = order.timeline().first() {
            self.persist(&order, entry).await?;
        }
        self.track(&order);
        self.publish_stage(&order, None, json!({ "itemCount": order.payload().items.len() }));
        info!(%order_id, "Order received");
        drop(guard);

        self.spawn_drive(order_id);
        Ok(order)
    }

    /// Load an order from the store
    pub async fn order(&self, order_id: &str) -> Result<Order, AutomationError> {
        self.store()
            .load(order_id)
            .await
            .map_err(AutomationError::Store)?
            .ok_or_else(|| AutomationError::OrderNotFound(order_id.to_string()))
    }

    /// Run one stage executor attempt for the order and apply its outcome
    #[instrument(skip(self))]
    pub async fn advance(&self, order_id: &str) -> Result<AdvanceOutcome, AutomationError> {
        self.ensure_running()?;

        let lock = self.order_lock(order_id);
        let guard = lock.lock().await;
        self.ensure_running()?;

        let permits = Arc::clone(&self.inner.lifecycle.read().permits);
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|_| AutomationError::NotRunning)?;
        // stop() may have landed while this advance waited for a slot
        self.ensure_running()?;

        let mut order = match self.order(order_id).await {
            Err(AutomationError::OrderNotFound(id)) => {
                drop(guard);
                self.discard_lock(order_id, &lock);
                return Err(AutomationError::OrderNotFound(id));
            }
            other => other?,
        };
        if order.is_complete() {
            return Err(AutomationError::OrderAlreadyComplete(order.id));
        }
        if order.is_abandoned() {
            return Err(AutomationError::OrderNotRetryable {
                order_id: order.id,
                reason: "order was abandoned".to_string(),
            });
        }
        if order.stage == Stage::Error {
            return Ok(AdvanceOutcome::AwaitingRetry {
                failed_stage: order.resume_stage(),
            });
        }

        let validator = self.validator();
        let pos = self.pos();
        let ctx = StageContext {
            validator: validator.as_ref(),
            pos: pos.as_ref(),
            breaker: &self.inner.breaker,
            call_timeout: self.inner.lifecycle.read().config.call_timeout(),
        };

        match stages::execute(&order, &ctx).await {
            Ok(success) => self.apply_success(&mut order, success).await,
            Err(err) => self.apply_failure(&mut order, err).await,
        }
    }

    /// Operator retry of a failed order
    #[instrument(skip(self))]
    pub async fn retry_order(
        &self,
        order_id: &str,
        from_stage: Option<Stage>,
        reset_retry_count: bool,
    ) -> Result<RetryTicket, AutomationError> {
        let lock = self.order_lock(order_id);
        let guard = lock.lock().await;

        let mut order = match self.order(order_id).await {
            Err(AutomationError::OrderNotFound(id)) => {
                drop(guard);
                self.discard_lock(order_id, &lock);
                return Err(AutomationError::OrderNotFound(id));
            }
            other => other?,
        };
        if order.is_complete() {
            return Err(AutomationError::OrderAlreadyComplete(order.id));
        }
        if order.is_abandoned() {
            return Err(AutomationError::OrderNotRetryable {
                order_id: order.id,
                reason: "order was abandoned".to_string(),
            });
        }
        self.ensure_running()?;

        if order.stage != Stage::Error {
            return Err(AutomationError::OrderNotRetryable {
                order_id: order.id,
                reason: format!("order is at '{}', not in error", order.stage),
            });
        }

        let Some(failed_stage) = order.resume_stage() else {
            return Err(AutomationError::OrderNotRetryable {
                order_id: order.id,
                reason: "no failed stage recorded".to_string(),
            });
        };
        let stage = from_stage.unwrap_or(failed_stage);
        if !stage.is_resumable() {
            return Err(AutomationError::OrderNotRetryable {
                order_id: order.id,
                reason: format!("cannot resume at '{}'", stage),
            });
        }
        // resuming past the failed stage would skip its executor
        if stage > failed_stage {
            return Err(AutomationError::OrderNotRetryable {
                order_id: order.id,
                reason: format!("order failed at '{}', cannot resume at '{}'", failed_stage, stage),
            });
        }

        let max_retries = self.policy().max_retries;
        if !reset_retry_count && order.retry_count >= max_retries {
            return Err(AutomationError::RetryLimitExceeded {
                order_id: order.id,
                retry_count: order.retry_count,
                max_retries,
            });
        }

        self.inner.scheduler.cancel(order_id);
        self.inner.tracking.lock().parked.remove(order_id);

        let entry = order.resume_at(stage, reset_retry_count);
        self.persist(&order, &entry).await?;
        self.track(&order);
        self.publish_stage(
            &order,
            Some(Stage::Error),
            json!({ "retrying": true, "automatic": false, "resetRetryCount": reset_retry_count }),
        );
        info!(order_id, %stage, retry_count = order.retry_count, "Manual retry");
        drop(guard);

        self.spawn_drive(order_id.to_string());

        Ok(RetryTicket {
            status: RetryTicketStatus::Retrying,
            from_stage: stage,
            retry_count: order.retry_count,
            scheduled_at: entry.entered_at,
        })
    }

    /// Give up on a failed order; it keeps its history but is never advanced again
    #[instrument(skip(self))]
    pub async fn abandon_order(&self, order_id: &str) -> Result<Order, AutomationError> {
        let lock = self.order_lock(order_id);
        let guard = lock.lock().await;

        let mut order = match self.order(order_id).await {
            Err(AutomationError::OrderNotFound(id)) => {
                drop(guard);
                self.discard_lock(order_id, &lock);
                return Err(AutomationError::OrderNotFound(id));
            }
            other => other?,
        };
        if order.is_complete() {
            return Err(AutomationError::OrderAlreadyComplete(order.id));
        }
        if order.stage != Stage::Error || order.is_abandoned() {
            return Err(AutomationError::OrderNotRetryable {
                order_id: order.id,
                reason: "only failed orders can be abandoned".to_string(),
            });
        }

        self.inner.scheduler.cancel(order_id);
        order.abandoned_at = Some(Utc::now());
        self.store()
            .save(&order)
            .await
            .map_err(AutomationError::Store)?;
        self.forget(order_id);
        warn!(order_id, "Order abandoned by operator");

        Ok(order)
    }

    /// Ping the POS through the circuit breaker
    pub async fn test_pos_connection(&self) -> PosConnectionReport {
        let pos = self.pos();
        let timeout = self.inner.lifecycle.read().config.call_timeout();

        let start = Instant::now();
        let result = self.inner.breaker.call(timeout, || pos.ping()).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let (status, error) = match result {
            Ok(()) => (PosConnectionStatus::Connected, None),
            Err(e) if e.is_open() => (PosConnectionStatus::CircuitOpen, Some(e.to_string())),
            Err(e) => (PosConnectionStatus::Failed, Some(e.to_string())),
        };

        PosConnectionReport {
            status,
            response_time_ms,
            error,
            circuit_breaker: self.inner.breaker.snapshot(),
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    async fn apply_success(
        &self,
        order: &mut Order,
        success: StageSuccess,
    ) -> Result<AdvanceOutcome, AutomationError> {
        let from = order.stage;
        if let Some(job) = success.print_job_id {
            order.print_job_id = Some(job);
        }

        let entry = order.advance_to(success.next);
        self.persist(order, &entry).await?;
        self.track(order);
        self.publish_stage(order, Some(from), success.detail);

        if order.is_complete() {
            self.inner.processed.fetch_add(1, Ordering::SeqCst);
            self.forget(&order.id);
            info!(order_id = %order.id, "Order complete");
        } else {
            info!(order_id = %order.id, %from, to = %success.next, "Order advanced");
        }

        Ok(AdvanceOutcome::Advanced {
            from,
            to: success.next,
        })
    }

    async fn apply_failure(
        &self,
        order: &mut Order,
        err: StageError,
    ) -> Result<AdvanceOutcome, AutomationError> {
        let from = order.stage;
        let kind = err.kind();
        let entry = order.fail(kind, err.to_string(), err.is_circuit_open());
        self.persist(order, &entry).await?;
        self.track(order);

        let code = order.last_error.as_ref().map(last_error_code);
        self.inner.bus.publish(
            EventType::OrderError,
            Some(&order.id),
            json!({
                "orderId": order.id,
                "stage": Stage::Error,
                "failedStage": from,
                "kind": kind,
                "code": code,
                "message": err.to_string(),
                "circuitOpen": err.is_circuit_open(),
                "retryCount": order.retry_count,
            }),
        );

        let retry = self.decide_retry(order, kind);
        match retry {
            RetryDecision::Scheduled(ref armed) => warn!(
                order_id = %order.id,
                %from,
                error = %err,
                attempt = armed.attempt,
                delay_ms = armed.delay_ms,
                "Stage failed, retry scheduled"
            ),
            _ => error!(
                order_id = %order.id,
                %from,
                error = %err,
                retry = ?retry,
                "Stage failed, awaiting operator"
            ),
        }

        Ok(AdvanceOutcome::Failed { from, kind, retry })
    }

    fn decide_retry(&self, order: &Order, kind: FailureKind) -> RetryDecision {
        let policy = self.policy();
        if !policy.retries_automatically(kind) {
            return RetryDecision::Manual;
        }
        let Some(attempt) = policy.next_attempt(order.retry_count) else {
            return RetryDecision::Exhausted;
        };
        if !self.is_running() {
            self.park(&order.id, attempt);
            return RetryDecision::Parked { attempt };
        }
        RetryDecision::Scheduled(self.arm_retry(&policy, &order.id, attempt))
    }

    fn arm_retry(&self, policy: &RetryPolicy, order_id: &str, attempt: u32) -> ArmedRetry {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let id = order_id.to_string();
        self.inner.scheduler.arm(policy, order_id, attempt, move || async move {
            if let Some(inner) = weak.upgrade() {
                Engine { inner }.run_auto_retry(id, attempt).await;
            }
        })
    }

    /// Fired by a retry timer
    async fn run_auto_retry(&self, order_id: String, attempt: u32) {
        if !self.is_running() {
            self.park(&order_id, attempt);
            return;
        }

        let lock = self.order_lock(&order_id);
        let guard = lock.lock().await;
        if !self.is_running() {
            drop(guard);
            self.park(&order_id, attempt);
            return;
        }

        let mut order = match self.order(&order_id).await {
            Ok(order) => order,
            Err(e) => {
                error!(%order_id, error = %e, "Retry could not load order");
                return;
            }
        };

        if order.stage != Stage::Error || order.is_abandoned() {
            debug!(%order_id, stage = %order.stage, "Retry no longer needed");
            return;
        }
        let Some(stage) = order.resume_stage() else {
            return;
        };
        if self.policy().next_attempt(order.retry_count).is_none() {
            debug!(%order_id, retry_count = order.retry_count, "Retry limit reached");
            return;
        }

        let entry = order.resume_at(stage, false);
        if let Err(e) = self.persist(&order, &entry).await {
            error!(%order_id, error = %e, "Retry could not persist order");
            return;
        }
        self.track(&order);
        self.publish_stage(
            &order,
            Some(Stage::Error),
            json!({ "retrying": true, "automatic": true }),
        );
        info!(%order_id, %stage, retry_count = order.retry_count, "Automatic retry");
        drop(guard);

        self.drive(order_id).await;
    }

    // ------------------------------------------------------------------
    // Drive loops
    // ------------------------------------------------------------------

    fn spawn_drive(&self, order_id: String) {
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(order_id).await });
    }

    /// Advance an order until it completes, fails, or the engine stops
    async fn drive(&self, order_id: String) {
        loop {
            match self.advance(&order_id).await {
                Ok(AdvanceOutcome::Advanced {
                    to: Stage::Complete,
                    ..
                }) => break,
                Ok(AdvanceOutcome::Advanced { .. }) => continue,
                Ok(AdvanceOutcome::Failed { .. }) | Ok(AdvanceOutcome::AwaitingRetry { .. }) => {
                    break
                }
                Err(AutomationError::NotRunning) => {
                    self.halt(&order_id);
                    break;
                }
                Err(AutomationError::OrderAlreadyComplete(_)) => break,
                Err(e) => {
                    error!(%order_id, error = %e, "Order drive aborted");
                    break;
                }
            }
        }
    }

    fn halt(&self, order_id: &str) {
        self.inner
            .tracking
            .lock()
            .halted
            .insert(order_id.to_string());
        debug!(order_id, "Order halted while stopped");

        // a start that raced with this insert would have missed it
        if self.is_running() && self.inner.tracking.lock().halted.remove(order_id) {
            self.spawn_drive(order_id.to_string());
        }
    }

    fn park(&self, order_id: &str, attempt: u32) {
        self.inner
            .tracking
            .lock()
            .parked
            .insert(order_id.to_string(), attempt);
        debug!(order_id, attempt, "Retry parked while stopped");

        if self.is_running() {
            let parked = self.inner.tracking.lock().parked.remove(order_id);
            if let Some(attempt) = parked {
                let policy = self.policy();
                self.arm_retry(&policy, order_id, attempt);
            }
        }
    }

    /// Restart work interrupted by the previous `stop`
    fn resume_pending(&self) {
        let (halted, parked) = {
            let mut tracking = self.inner.tracking.lock();
            (
                std::mem::take(&mut tracking.halted),
                std::mem::take(&mut tracking.parked),
            )
        };

        if !halted.is_empty() || !parked.is_empty() {
            info!(
                halted = halted.len(),
                parked = parked.len(),
                "Resuming interrupted orders"
            );
        }

        for order_id in halted {
            self.spawn_drive(order_id);
        }

        let policy = self.policy();
        for (order_id, attempt) in parked {
            self.arm_retry(&policy, &order_id, attempt);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), AutomationError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(AutomationError::NotRunning)
        }
    }

    fn policy(&self) -> RetryPolicy {
        self.inner.lifecycle.read().policy.clone()
    }

    fn mock_mode(&self) -> bool {
        self.inner.lifecycle.read().config.mock_mode
    }

    fn validator(&self) -> Arc<dyn InventoryValidator> {
        if self.mock_mode() {
            return self.inner.mocks.validator.clone();
        }
        Arc::clone(&self.inner.collaborators.validator)
    }

    fn pos(&self) -> Arc<dyn PosClient> {
        if self.mock_mode() {
            return self.inner.mocks.pos.clone();
        }
        Arc::clone(&self.inner.collaborators.pos)
    }

    fn store(&self) -> &dyn OrderStore {
        self.inner.collaborators.store.as_ref()
    }

    fn order_lock(&self, order_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.order_locks.lock();
        Arc::clone(locks.entry(order_id.to_string()).or_default())
    }

    /// Drop the lock entry of an unknown order unless another caller holds a handle to it
    fn discard_lock(&self, order_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.inner.order_locks.lock();
        let idle = locks
            .get(order_id)
            .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(order_id);
        }
    }

    async fn persist(&self, order: &Order, entry: &TimelineEntry) -> Result<(), AutomationError> {
        let store = self.store();
        let result = match store.append_timeline_entry(&order.id, entry).await {
            Ok(()) => store.save(order).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            error!(order_id = %order.id, error = %e, "Failed to persist order");
            AutomationError::Store(e)
        })
    }

    fn track(&self, order: &Order) {
        let mut tracking = self.inner.tracking.lock();
        if order.is_complete() || order.is_abandoned() {
            tracking.active.remove(&order.id);
        } else {
            tracking.active.insert(order.id.clone(), order.stage);
        }
    }

    /// Drop every per-order resource of an order that left the engine
    fn forget(&self, order_id: &str) {
        {
            let mut tracking = self.inner.tracking.lock();
            tracking.active.remove(order_id);
            tracking.halted.remove(order_id);
            tracking.parked.remove(order_id);
        }
        self.inner.order_locks.lock().remove(order_id);
        self.inner.bus.forget_order(order_id);
    }

    fn publish_stage(&self, order: &Order, from: Option<Stage>, detail: serde_json::Value) {
        self.inner.bus.publish(
            order.stage.event_type(),
            Some(&order.id),
            json!({
                "orderId": order.id,
                "stage": order.stage,
                "from": from,
                "retryCount": order.retry_count,
                "enteredAt": order.timeline().last().map(|e| e.entered_at),
                "detail": detail,
            }),
        );
    }
}
