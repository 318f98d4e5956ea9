use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, instrument, warn};

use super::{
    gateway_http_client, required,
    webhook::{verify_body_signature, WebhookRequest},
    GatewaySession, PaymentConfirmation, PaymentGateway, PaymentProof, SessionRequest,
};
use crate::{config::AppConfig, errors::ServiceError};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://api.razorpay.com/v1";

#[derive(Clone)]
pub struct SignatureGatewayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub api_base: String,
    pub timeout: std::time::Duration,
}

impl SignatureGatewayConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            key_id: required(&cfg.razorpay_key_id, "razorpay_key_id")?,
            key_secret: required(&cfg.razorpay_key_secret, "razorpay_key_secret")?,
            api_base: cfg
                .gateway_api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            timeout: cfg.gateway_timeout(),
        })
    }
}

/// Razorpay-style processor: remote orders plus HMAC-signed client callbacks.
#[derive(Clone)]
pub struct SignatureGateway {
    config: SignatureGatewayConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RemoteOrder {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RemotePayments {
    #[serde(default)]
    items: Vec<RemotePayment>,
}

#[derive(Debug, Deserialize)]
struct RemotePayment {
    id: String,
    status: String,
}

impl SignatureGateway {
    pub fn new(config: SignatureGatewayConfig) -> Result<Self, ServiceError> {
        let client = gateway_http_client(config.timeout)?;
        Ok(Self { config, client })
    }

    /// Hex HMAC-SHA256 of `"{session_ref}|{payment_id}"` under the key secret.
    pub fn sign(&self, session_ref: &str, payment_id: &str) -> Result<String, ServiceError> {
        let mut mac = self.mac()?;
        mac.update(format!("{}|{}", session_ref, payment_id).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check that `proof` was signed for exactly this session.
    pub fn verify_proof(&self, session_ref: &str, proof: &PaymentProof) -> bool {
        let Ok(provided) = hex::decode(proof.signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(format!("{}|{}", session_ref, proof.payment_id).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    fn mac(&self) -> Result<HmacSha256, ServiceError> {
        HmacSha256::new_from_slice(self.config.key_secret.as_bytes())
            .map_err(|e| ServiceError::ConfigurationError(format!("invalid key secret: {}", e)))
    }

    async fn fetch_captured_payment(
        &self,
        session_ref: &str,
    ) -> Result<Option<String>, ServiceError> {
        let url = format!("{}/orders/{}/payments", self.config.api_base, session_ref);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .send()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("payment status request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "gateway rejected payment status request");
            return Err(ServiceError::GatewayError(format!(
                "payment status returned {}",
                status
            )));
        }

        let payments: RemotePayments = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("payment status body: {}", e)))?;

        Ok(payments
            .items
            .into_iter()
            .find(|p| p.status == "captured")
            .map(|p| p.id))
    }
}

#[async_trait]
impl PaymentGateway for SignatureGateway {
    fn name(&self) -> &'static str {
        "razorpay"
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id, amount = request.amount))]
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        let body = json!({
            "amount": request.amount,
            "currency": request.currency,
            "receipt": request.order_id.to_string(),
            "notes": {
                "order_id": request.order_id.to_string(),
                "description": request.description,
            },
        });

        let response = self
            .client
            .post(format!("{}/orders", self.config.api_base))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("create order request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "gateway rejected order creation");
            return Err(ServiceError::GatewayError(format!(
                "create order returned {}",
                status
            )));
        }

        let remote: RemoteOrder = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("create order body: {}", e)))?;

        info!(session_ref = %remote.id, "gateway order created");
        Ok(GatewaySession {
            session_ref: remote.id,
            client_session_token: self.config.key_id.clone(),
        })
    }

    #[instrument(skip(self, proof))]
    async fn confirm_payment(
        &self,
        session_ref: &str,
        proof: Option<&PaymentProof>,
    ) -> Result<PaymentConfirmation, ServiceError> {
        if let Some(proof) = proof {
            if self.verify_proof(session_ref, proof) {
                return Ok(PaymentConfirmation::succeeded(proof.payment_id.clone()));
            }
            warn!(payment_id = %proof.payment_id, "payment signature did not verify for session");
            return Ok(PaymentConfirmation::pending());
        }

        Ok(match self.fetch_captured_payment(session_ref).await? {
            Some(payment_id) => PaymentConfirmation::succeeded(payment_id),
            None => PaymentConfirmation::pending(),
        })
    }

    fn session_ref_from_event(&self, event: &Value) -> Option<String> {
        event
            .pointer("/payload/payment/entity/order_id")
            .or_else(|| event.pointer("/payload/order/entity/id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// `X-Razorpay-Signature` carries a hex HMAC of the raw body; there is no timestamp.
    fn verify_webhook(&self, request: &WebhookRequest<'_>) -> bool {
        request
            .header("x-razorpay-signature")
            .is_some_and(|signature| verify_body_signature(request, signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;
    use wiremock::matchers::{basic_auth, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(api_base: String) -> SignatureGateway {
        SignatureGateway::new(SignatureGatewayConfig {
            key_id: "rzp_test_key".into(),
            key_secret: "rzp_test_secret".into(),
            api_base,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn proof(gw: &SignatureGateway, session_ref: &str, payment_id: &str) -> PaymentProof {
        PaymentProof {
            payment_id: payment_id.into(),
            signature: gw.sign(session_ref, payment_id).unwrap(),
        }
    }

    #[tokio::test]
    async fn create_session_opens_remote_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(basic_auth("rzp_test_key", "rzp_test_secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "order_Abc123", "status": "created"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let session = gateway(server.uri())
            .create_session(&SessionRequest {
                order_id: Uuid::new_v4(),
                amount: 49_900,
                currency: "INR".into(),
                buyer_email: "buyer@example.com".into(),
                description: "CRM sync template".into(),
            })
            .await
            .unwrap();

        assert_eq!(session.session_ref, "order_Abc123");
        assert_eq!(session.client_session_token, "rzp_test_key");
    }

    #[tokio::test]
    async fn create_session_surfaces_gateway_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = gateway(server.uri())
            .create_session(&SessionRequest {
                order_id: Uuid::new_v4(),
                amount: 100,
                currency: "INR".into(),
                buyer_email: "buyer@example.com".into(),
                description: "x".into(),
            })
            .await;

        assert!(matches!(result, Err(ServiceError::GatewayError(_))));
    }

    #[tokio::test]
    async fn valid_signature_confirms_without_network() {
        let gw = gateway("http://127.0.0.1:9".into());
        let proof = proof(&gw, "order_1", "pay_1");

        let outcome = gw.confirm_payment("order_1", Some(&proof)).await.unwrap();

        assert_eq!(outcome, PaymentConfirmation::succeeded("pay_1"));
    }

    #[tokio::test]
    async fn signature_for_another_session_is_rejected() {
        let gw = gateway("http://127.0.0.1:9".into());
        let foreign = proof(&gw, "order_other", "pay_1");

        let outcome = gw.confirm_payment("order_1", Some(&foreign)).await.unwrap();
        assert!(!outcome.succeeded);

        let mut tampered = proof(&gw, "order_1", "pay_1");
        tampered.payment_id = "pay_2".into();
        assert!(!gw.confirm_payment("order_1", Some(&tampered)).await.unwrap().succeeded);

        let garbage = PaymentProof {
            payment_id: "pay_1".into(),
            signature: "not-hex".into(),
        };
        assert!(!gw.confirm_payment("order_1", Some(&garbage)).await.unwrap().succeeded);
    }

    #[tokio::test]
    async fn status_api_reports_captured_payment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/order_1/payments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": "pay_failed", "status": "failed"},
                    {"id": "pay_ok", "status": "captured"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/order_2/payments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "pay_auth", "status": "authorized"}]
            })))
            .mount(&server)
            .await;

        let gw = gateway(server.uri());
        assert_eq!(
            gw.confirm_payment("order_1", None).await.unwrap(),
            PaymentConfirmation::succeeded("pay_ok")
        );
        assert_eq!(
            gw.confirm_payment("order_2", None).await.unwrap(),
            PaymentConfirmation::pending()
        );
    }

    #[test]
    fn webhook_signed_over_raw_body_is_accepted() {
        use crate::services::gateway::webhook::signing::body_signature;
        use axum::http::{HeaderMap, HeaderValue};

        let gw = gateway("http://127.0.0.1:9".into());
        let body = json!({
            "entity": "event",
            "event": "payment.captured",
            "payload": {"payment": {"entity": {
                "id": "pay_1", "order_id": "order_9", "status": "captured"
            }}}
        })
        .to_string();
        let webhook = |headers: &HeaderMap, body: &str| {
            gw.verify_webhook(&WebhookRequest {
                headers,
                payload: body.as_bytes(),
                secret: "rzp_webhook_secret",
                tolerance_secs: 300,
                now: 1_700_000_000,
            })
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Razorpay-Signature",
            HeaderValue::from_str(&body_signature("rzp_webhook_secret", &body)).unwrap(),
        );
        assert!(webhook(&headers, &body));
        assert!(!webhook(&headers, r#"{"event":"payment.captured"}"#));
        assert!(!webhook(&HeaderMap::new(), &body));

        let mut wrong_key = HeaderMap::new();
        wrong_key.insert(
            "X-Razorpay-Signature",
            HeaderValue::from_str(&body_signature("other", &body)).unwrap(),
        );
        assert!(!webhook(&wrong_key, &body));
    }

    #[test]
    fn webhook_payload_yields_order_reference() {
        let gw = gateway("http://127.0.0.1:9".into());
        let event = json!({
            "event": "payment.captured",
            "payload": {"payment": {"entity": {"id": "pay_1", "order_id": "order_9"}}}
        });
        assert_eq!(gw.session_ref_from_event(&event).as_deref(), Some("order_9"));
        assert_eq!(gw.session_ref_from_event(&json!({"event": "ping"})), None);
    }
}
