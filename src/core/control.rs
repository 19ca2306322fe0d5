//! Control surface.
//!
//! Thin layer over one [`Engine`] for the CLI or an HTTP front end. Every
//! failure leaves here as an [`ErrorResponse`] carrying a stable code and a
//! human-readable message; collaborator detail never crosses this boundary.

use tracing::warn;

use crate::config::AutomationConfig;
use crate::domain::{Order, OrderPayload, Stage};
use crate::error::{AutomationError, ErrorResponse};

use super::engine::{
    Engine, PosConnectionReport, RetryTicket, StartReport, StatusReport, StopReport,
};

/// Options for a manual retry
#[derive(Debug, Clone, Default)]
pub struct RetryRequest {
    pub from_stage: Option<Stage>,
    pub reset_retry_count: bool,
}

pub struct AutomationControl {
    engine: Engine,
}

impl AutomationControl {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn start(&self, config: AutomationConfig) -> Result<StartReport, ErrorResponse> {
        self.engine.start(config).map_err(respond)
    }

    pub fn stop(&self) -> Result<StopReport, ErrorResponse> {
        self.engine.stop().map_err(respond)
    }

    pub fn status(&self) -> StatusReport {
        self.engine.status()
    }

    pub async fn retry_order(
        &self,
        order_id: &str,
        request: RetryRequest,
    ) -> Result<RetryTicket, ErrorResponse> {
        self.engine
            .retry_order(order_id, request.from_stage, request.reset_retry_count)
            .await
            .map_err(respond)
    }

    pub async fn abandon_order(&self, order_id: &str) -> Result<Order, ErrorResponse> {
        self.engine.abandon_order(order_id).await.map_err(respond)
    }

    pub async fn submit_order(
        &self,
        order_id: Option<String>,
        payload: OrderPayload,
    ) -> Result<Order, ErrorResponse> {
        self.engine.submit(order_id, payload).await.map_err(respond)
    }

    pub async fn order(&self, order_id: &str) -> Result<Order, ErrorResponse> {
        self.engine.order(order_id).await.map_err(respond)
    }

    pub async fn test_pos_connection(&self) -> PosConnectionReport {
        self.engine.test_pos_connection().await
    }
}

fn respond(err: AutomationError) -> ErrorResponse {
    if let AutomationError::Store(ref source) = err {
        warn!(error = %format!("{:#}", source), "Order store failure");
    }
    ErrorResponse::from(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryOrderStore, MockInventoryValidator, MockPosClient};
    use crate::core::engine::Collaborators;
    use crate::core::CircuitBreakerConfig;
    use crate::error::ErrorCode;
    use std::sync::Arc;

    fn control() -> AutomationControl {
        let engine = Engine::new(
            Collaborators {
                validator: Arc::new(MockInventoryValidator::approve_all()),
                pos: Arc::new(MockPosClient::new()),
                store: Arc::new(MemoryOrderStore::new()),
            },
            CircuitBreakerConfig::default(),
        );
        AutomationControl::new(engine)
    }

    #[tokio::test]
    async fn test_errors_carry_codes() {
        let control = control();

        let err = control.stop().unwrap_err();
        assert_eq!(err.code, ErrorCode::AutomationNotRunning);

        control.start(AutomationConfig::default()).unwrap();
        let err = control.start(AutomationConfig::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::AutomationAlreadyRunning);

        let err = control
            .retry_order("missing", RetryRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::OrderNotFound);
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn test_invalid_config_code() {
        let control = control();
        let err = control
            .start(AutomationConfig {
                retry_multiplier: 0.1,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);
    }
}
