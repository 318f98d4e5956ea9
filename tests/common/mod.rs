#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use storefront_api::{
    auth::{Claims, TokenVerifier, ADMIN_ROLE},
    common::TimestampInput,
    config::AppConfig,
    db,
    entities::{
        coupon::{self, DiscountType},
        template::{self, TemplateStatus},
    },
    errors::ServiceError,
    events::{self, Event, EventHandler},
    handlers::AppServices,
    services::{
        catalog::CreateTemplateInput,
        coupons::CreateCouponInput,
        gateway::mock::MockGateway,
        notifications::{Notifier, PurchaseNotification},
    },
    AppState,
};
use tower::ServiceExt;

pub const JWT_SECRET: &str = "identity_provider_shared_secret_for_tests";
pub const WEBHOOK_SECRET: &str = "whsec_storefront_tests";

/// Captures purchase notifications; can be switched to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<PurchaseNotification>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<PurchaseNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_purchase_confirmation(
        &self,
        notification: &PurchaseNotification,
    ) -> Result<(), ServiceError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError(
                "mail provider unavailable".into(),
            ));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Keeps every processed event for later assertions.
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: Event) -> Result<(), String> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Application wired against an in-memory SQLite database and the mock gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<RecordingNotifier>,
    recorded: Arc<RecordingEventHandler>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        cfg.payment_provider = "mock".to_string();
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        cfg.default_currency = "USD".to_string();
        // A single connection keeps the in-memory database alive and shared.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_sender, event_rx) = events::channel(256);
        let recorded = Arc::new(RecordingEventHandler::default());
        let event_task = tokio::spawn(events::process_events(
            event_rx,
            vec![recorded.clone() as Arc<dyn EventHandler>],
        ));

        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let services = AppServices::new(
            db_arc.clone(),
            &cfg,
            gateway.clone(),
            notifier.clone(),
            event_sender.clone(),
        );

        let state = AppState {
            db: db_arc,
            token_verifier: Arc::new(TokenVerifier::from_app_config(&cfg)),
            config: cfg,
            event_sender,
            services,
        };

        Self {
            router: storefront_api::app_router(state.clone()),
            state,
            gateway,
            notifier,
            recorded,
            _event_task: event_task,
        }
    }

    /// Bearer token for a plain buyer.
    pub fn buyer_token(&self, sub: &str, email: &str) -> String {
        self.token(sub, Some(email), vec![])
    }

    pub fn admin_token(&self) -> String {
        self.token("admin-1", Some("ops@example.com"), vec![ADMIN_ROLE.to_string()])
    }

    pub fn token(&self, sub: &str, email: Option<&str>, roles: Vec<String>) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            email: email.map(str::to_string),
            name: Some(format!("Buyer {}", sub)),
            roles,
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
            iss: None,
            aud: None,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Posts a raw webhook body signed with the configured secret.
    pub async fn signed_webhook(&self, payload: &str) -> Response {
        let ts = Utc::now().timestamp();
        let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", ts, payload).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json")
            .header("x-timestamp", ts.to_string())
            .header("x-signature", signature)
            .body(Body::from(payload.to_string()))
            .expect("failed to build webhook request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    pub async fn seed_template(&self, title: &str, price: i64) -> template::Model {
        self.state
            .services
            .catalog
            .create_template(CreateTemplateInput {
                title: title.to_string(),
                description: None,
                price,
                currency: None,
                status: Some(TemplateStatus::Published),
                stock: None,
            })
            .await
            .expect("seed template for tests")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        discount_value: i64,
        usage_limit: Option<i32>,
        specific_email: Option<&str>,
    ) -> coupon::Model {
        let now = Utc::now();
        self.state
            .services
            .coupons
            .create_coupon(CreateCouponInput {
                code: code.to_string(),
                discount_type,
                discount_value,
                valid_from: TimestampInput::from(now - chrono::Duration::days(1)),
                valid_until: TimestampInput::from(now + chrono::Duration::days(1)),
                usage_limit,
                specific_email: specific_email.map(str::to_string),
                is_active: true,
            })
            .await
            .expect("seed coupon for tests")
    }

    /// Waits briefly for the event loop to deliver `count` events of `kind`.
    pub async fn events_of_kind(&self, kind: &str, count: usize) -> Vec<Event> {
        for _ in 0..50 {
            let matching: Vec<Event> = self
                .recorded
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.kind() == kind)
                .cloned()
                .collect();
            if matching.len() >= count {
                return matching;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.recorded
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
