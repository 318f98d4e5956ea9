use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{
    gateway_http_client, required,
    webhook::{parse_stripe_signature, verify_timestamped_signature, WebhookRequest},
    GatewaySession, PaymentConfirmation, PaymentGateway, PaymentProof, SessionRequest,
};
use crate::{config::AppConfig, errors::ServiceError};

const DEFAULT_API_BASE: &str = "https://api.stripe.com/v1";

#[derive(Clone)]
pub struct StatusApiGatewayConfig {
    pub secret_key: String,
    pub api_base: String,
    pub timeout: std::time::Duration,
}

impl StatusApiGatewayConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            secret_key: required(&cfg.stripe_secret_key, "stripe_secret_key")?,
            api_base: cfg
                .gateway_api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            timeout: cfg.gateway_timeout(),
        })
    }
}

/// Stripe-style processor: payment intents, confirmed by reading the intent back.
#[derive(Clone)]
pub struct StatusApiGateway {
    config: StatusApiGatewayConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    latest_charge: Option<String>,
}

impl StatusApiGateway {
    pub fn new(config: StatusApiGatewayConfig) -> Result<Self, ServiceError> {
        let client = gateway_http_client(config.timeout)?;
        Ok(Self { config, client })
    }

    async fn read_intent(&self, response: reqwest::Response) -> Result<PaymentIntent, ServiceError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "payment intent request failed");
            return Err(ServiceError::GatewayError(format!(
                "payment intent request returned {}",
                status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("payment intent body: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for StatusApiGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id, amount = request.amount))]
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        let params = [
            ("amount", request.amount.to_string()),
            ("currency", request.currency.to_lowercase()),
            ("description", request.description.clone()),
            ("receipt_email", request.buyer_email.clone()),
            ("metadata[order_id]", request.order_id.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/payment_intents", self.config.api_base))
            .basic_auth(&self.config.secret_key, Some(""))
            .header("Idempotency-Key", request.order_id.to_string())
            .form(&params)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("create intent request: {}", e)))?;

        let intent = self.read_intent(response).await?;
        let client_secret = intent.client_secret.ok_or_else(|| {
            ServiceError::GatewayError("payment intent has no client secret".into())
        })?;

        info!(session_ref = %intent.id, "payment intent created");
        Ok(GatewaySession {
            session_ref: intent.id,
            client_session_token: client_secret,
        })
    }

    #[instrument(skip(self, _proof))]
    async fn confirm_payment(
        &self,
        session_ref: &str,
        _proof: Option<&PaymentProof>,
    ) -> Result<PaymentConfirmation, ServiceError> {
        // Client parameters are never trusted here; the intent is always read back.
        let response = self
            .client
            .get(format!("{}/payment_intents/{}", self.config.api_base, session_ref))
            .basic_auth(&self.config.secret_key, Some(""))
            .send()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("intent status request: {}", e)))?;

        let intent = self.read_intent(response).await?;
        if intent.id != session_ref {
            warn!(returned = %intent.id, "gateway returned a different intent");
            return Ok(PaymentConfirmation::pending());
        }

        Ok(if intent.status == "succeeded" {
            PaymentConfirmation::succeeded(intent.latest_charge.unwrap_or(intent.id))
        } else {
            PaymentConfirmation::pending()
        })
    }

    fn session_ref_from_event(&self, event: &Value) -> Option<String> {
        let object = event.pointer("/data/object")?;
        match object.get("object").and_then(Value::as_str) {
            Some("payment_intent") => object.get("id"),
            Some("charge") => object.get("payment_intent"),
            _ => None,
        }
        .and_then(Value::as_str)
        .map(str::to_string)
    }

    /// `Stripe-Signature: t=..,v1=..` over `"{t}.{body}"`.
    fn verify_webhook(&self, request: &WebhookRequest<'_>) -> bool {
        request
            .header("stripe-signature")
            .and_then(parse_stripe_signature)
            .is_some_and(|(ts, v1)| verify_timestamped_signature(request, ts, v1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(api_base: String) -> StatusApiGateway {
        StatusApiGateway::new(StatusApiGatewayConfig {
            secret_key: "sk_test_123".into(),
            api_base,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_session_returns_intent_and_client_secret() {
        let server = MockServer::start().await;
        let order_id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/payment_intents"))
            .and(header("Idempotency-Key", order_id.to_string().as_str()))
            .and(body_string_contains("amount=10000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_123",
                "status": "requires_payment_method",
                "client_secret": "pi_123_secret_abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = gateway(server.uri())
            .create_session(&SessionRequest {
                order_id,
                amount: 10_000,
                currency: "USD".into(),
                buyer_email: "buyer@example.com".into(),
                description: "Lead router".into(),
            })
            .await
            .unwrap();

        assert_eq!(session.session_ref, "pi_123");
        assert_eq!(session.client_session_token, "pi_123_secret_abc");
    }

    #[tokio::test]
    async fn confirm_reads_intent_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payment_intents/pi_paid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_paid", "status": "succeeded", "latest_charge": "ch_1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/payment_intents/pi_open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_open", "status": "processing"
            })))
            .mount(&server)
            .await;

        let gw = gateway(server.uri());
        assert_eq!(
            gw.confirm_payment("pi_paid", None).await.unwrap(),
            PaymentConfirmation::succeeded("ch_1")
        );
        assert_eq!(
            gw.confirm_payment("pi_open", None).await.unwrap(),
            PaymentConfirmation::pending()
        );
    }

    #[tokio::test]
    async fn confirm_errors_are_not_reported_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payment_intents/pi_x"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = gateway(server.uri()).confirm_payment("pi_x", None).await;
        assert!(matches!(result, Err(ServiceError::GatewayError(_))));
    }

    #[test]
    fn webhook_payload_yields_intent_reference() {
        let gw = gateway("http://127.0.0.1:9".into());
        let intent_event = json!({
            "type": "payment_intent.succeeded",
            "data": {"object": {"object": "payment_intent", "id": "pi_9"}}
        });
        let charge_event = json!({
            "type": "charge.succeeded",
            "data": {"object": {"object": "charge", "id": "ch_9", "payment_intent": "pi_9"}}
        });
        assert_eq!(gw.session_ref_from_event(&intent_event).as_deref(), Some("pi_9"));
        assert_eq!(gw.session_ref_from_event(&charge_event).as_deref(), Some("pi_9"));
        assert_eq!(gw.session_ref_from_event(&json!({"type": "ping"})), None);
    }

    #[test]
    fn webhook_with_fresh_stripe_signature_is_accepted() {
        use crate::services::gateway::webhook::signing::timestamped_signature;
        use axum::http::{HeaderMap, HeaderValue};

        let gw = gateway("http://127.0.0.1:9".into());
        let body = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": {"object": {"object": "payment_intent", "id": "pi_9", "status": "succeeded"}}
        })
        .to_string();
        let signed_at = 1_700_000_000;
        let header = format!(
            "t={},v1={}",
            signed_at,
            timestamped_signature("whsec_stripe", signed_at, &body)
        );
        let mut headers = HeaderMap::new();
        headers.insert("Stripe-Signature", HeaderValue::from_str(&header).unwrap());

        let webhook = |headers: &HeaderMap, body: &str, now: i64| {
            gw.verify_webhook(&WebhookRequest {
                headers,
                payload: body.as_bytes(),
                secret: "whsec_stripe",
                tolerance_secs: 300,
                now,
            })
        };

        assert!(webhook(&headers, &body, signed_at + 60));
        assert!(!webhook(&headers, &body, signed_at + 3_600));
        assert!(!webhook(&headers, "{}", signed_at + 60));

        // The generic timestamp headers are not a Stripe scheme.
        let mut generic = HeaderMap::new();
        generic.insert("x-timestamp", HeaderValue::from(signed_at));
        generic.insert(
            "x-signature",
            HeaderValue::from_str(&timestamped_signature("whsec_stripe", signed_at, &body)).unwrap(),
        );
        assert!(!webhook(&generic, &body, signed_at + 60));
    }
}
