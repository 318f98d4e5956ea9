use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

use super::{
    webhook::{verify_timestamped_signature, WebhookRequest},
    GatewaySession, PaymentConfirmation, PaymentGateway, PaymentProof, SessionRequest,
};
use crate::errors::ServiceError;

/// In-memory processor for development and tests. Sessions only succeed once `mark_paid` is called.
#[derive(Default)]
pub struct MockGateway {
    sessions: DashMap<String, SessionRequest>,
    captured: DashMap<String, String>,
    fail_sessions: AtomicBool,
    fail_confirmations: AtomicBool,
    session_calls: AtomicUsize,
    confirm_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the buyer completing payment; returns the confirmation id.
    pub fn mark_paid(&self, session_ref: &str) -> String {
        let confirmation = format!("mock_pay_{}", Uuid::new_v4().simple());
        self.captured
            .insert(session_ref.to_string(), confirmation.clone());
        confirmation
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_confirmations(&self, fail: bool) {
        self.fail_confirmations.store(fail, Ordering::SeqCst);
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    pub fn confirm_calls(&self) -> usize {
        self.confirm_calls.load(Ordering::SeqCst)
    }

    pub fn session(&self, session_ref: &str) -> Option<SessionRequest> {
        self.sessions.get(session_ref).map(|s| s.value().clone())
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayError("mock gateway unavailable".into()));
        }

        let session_ref = format!("mock_sess_{}", Uuid::new_v4().simple());
        self.sessions.insert(session_ref.clone(), request.clone());
        Ok(GatewaySession {
            client_session_token: format!("{}_client", session_ref),
            session_ref,
        })
    }

    async fn confirm_payment(
        &self,
        session_ref: &str,
        proof: Option<&PaymentProof>,
    ) -> Result<PaymentConfirmation, ServiceError> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_confirmations.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayError("mock gateway unavailable".into()));
        }

        let Some(confirmation) = self.captured.get(session_ref).map(|c| c.value().clone()) else {
            return Ok(PaymentConfirmation::pending());
        };
        // A client proof must name the captured payment.
        if matches!(proof, Some(p) if p.payment_id != confirmation) {
            return Ok(PaymentConfirmation::pending());
        }
        Ok(PaymentConfirmation::succeeded(confirmation))
    }

    fn session_ref_from_event(&self, event: &Value) -> Option<String> {
        event
            .get("session_ref")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// `x-timestamp` + `x-signature`, a hex HMAC over `"{timestamp}.{body}"`.
    fn verify_webhook(&self, request: &WebhookRequest<'_>) -> bool {
        match (request.header("x-timestamp"), request.header("x-signature")) {
            (Some(ts), Some(signature)) => verify_timestamped_signature(request, ts, signature),
            _ => false,
        }
    }
}
