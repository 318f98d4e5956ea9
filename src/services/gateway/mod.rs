//! Boundary to the external payment processor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::{config::AppConfig, errors::ServiceError};

pub mod mock;
pub mod signature;
pub mod status_api;
pub mod webhook;

pub use mock::MockGateway;
pub use signature::{SignatureGateway, SignatureGatewayConfig};
pub use status_api::{StatusApiGateway, StatusApiGatewayConfig};
pub use webhook::WebhookRequest;

/// What the adapter needs to open a remote payment session for an order.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRequest {
    pub order_id: Uuid,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub buyer_email: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewaySession {
    /// Gateway-assigned reference used to correlate callbacks
    pub session_ref: String,
    /// Opaque value the client needs to complete payment
    pub client_session_token: String,
}

/// Client-supplied parameters returned by the checkout widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentConfirmation {
    pub succeeded: bool,
    pub confirmation_id: Option<String>,
}

impl PaymentConfirmation {
    pub fn succeeded(confirmation_id: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            confirmation_id: Some(confirmation_id.into()),
        }
    }

    /// No definitive success; the payment may still complete later.
    pub fn pending() -> Self {
        Self {
            succeeded: false,
            confirmation_id: None,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<GatewaySession, ServiceError>;

    /// Asks for a definitive outcome. With `proof`, the signed client parameters are checked
    /// against `session_ref`; without it the processor's status API is queried.
    async fn confirm_payment(
        &self,
        session_ref: &str,
        proof: Option<&PaymentProof>,
    ) -> Result<PaymentConfirmation, ServiceError>;

    /// Extracts the session reference from a webhook payload, if the event carries one.
    fn session_ref_from_event(&self, event: &Value) -> Option<String>;

    /// Authenticates an inbound webhook using this processor's signing scheme.
    fn verify_webhook(&self, request: &WebhookRequest<'_>) -> bool;
}

/// Stands in for a processor while `payments_enabled` is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn create_session(
        &self,
        _request: &SessionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        Err(ServiceError::PaymentsDisabled)
    }

    async fn confirm_payment(
        &self,
        _session_ref: &str,
        _proof: Option<&PaymentProof>,
    ) -> Result<PaymentConfirmation, ServiceError> {
        Err(ServiceError::PaymentsDisabled)
    }

    fn session_ref_from_event(&self, _event: &Value) -> Option<String> {
        None
    }

    fn verify_webhook(&self, _request: &WebhookRequest<'_>) -> bool {
        false
    }
}

/// Builds the adapter selected by `payment_provider`, or [`DisabledGateway`] when payments are off.
pub fn build_gateway(cfg: &AppConfig) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
    if !cfg.payments_enabled {
        info!(provider = %cfg.payment_provider, "payments disabled; no gateway adapter built");
        return Ok(Arc::new(DisabledGateway));
    }

    let gateway: Arc<dyn PaymentGateway> = match cfg.payment_provider.as_str() {
        "razorpay" => Arc::new(SignatureGateway::new(SignatureGatewayConfig::from_app_config(
            cfg,
        )?)?),
        "stripe" => Arc::new(StatusApiGateway::new(
            StatusApiGatewayConfig::from_app_config(cfg)?,
        )?),
        "mock" => Arc::new(MockGateway::new()),
        other => {
            return Err(ServiceError::ConfigurationError(format!(
                "unknown payment provider '{}'",
                other
            )))
        }
    };
    info!(provider = gateway.name(), "payment gateway configured");
    Ok(gateway)
}

pub(crate) fn gateway_http_client(
    timeout: std::time::Duration,
) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ServiceError::ConfigurationError(format!("gateway http client: {}", e)))
}

pub(crate) fn required(value: &Option<String>, key: &str) -> Result<String, ServiceError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ServiceError::ConfigurationError(format!("{} is not configured", key)))
}
