use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{errors::ServiceError, services::gateway::WebhookRequest, AppState};

/// POST /api/v1/payments/webhook
///
/// The payload is only used to find the session; the outcome always comes from the gateway.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    counter!("storefront.webhooks.received", 1);

    // 503 makes the processor retry once payments are back on.
    if !state.config.payments_enabled {
        return Err(ServiceError::PaymentsDisabled);
    }

    let Some(secret) = state.config.payment_webhook_secret.as_deref() else {
        counter!("storefront.webhooks.rejected", 1);
        warn!("payment webhook received but no webhook secret is configured");
        return Err(ServiceError::InvalidSignature(
            "webhook verification is not configured".into(),
        ));
    };

    let webhook = WebhookRequest {
        headers: &headers,
        payload: &body,
        secret,
        tolerance_secs: state.config.payment_webhook_tolerance_secs,
        now: chrono::Utc::now().timestamp(),
    };
    if !state.services.orders.verify_webhook(&webhook) {
        counter!("storefront.webhooks.rejected", 1);
        warn!("Payment webhook signature verification failed");
        return Err(ServiceError::InvalidSignature(
            "invalid webhook signature".to_string(),
        ));
    }

    let event: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid json: {}", e)))?;
    let event_type = event
        .get("type")
        .or_else(|| event.get("event"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let Some(session_ref) = state.services.orders.session_ref_from_event(&event) else {
        info!(%event_type, "payment webhook carries no session reference");
        return Ok(Json(json!({ "received": true, "status": "ignored" })));
    };

    let disposition = state
        .services
        .orders
        .handle_gateway_event(&session_ref)
        .await?;
    info!(%event_type, %session_ref, ?disposition, "payment webhook handled");

    Ok(Json(json!({ "received": true, "status": disposition })))
}
