use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::order::{IssuedToken, Model as OrderModel},
    errors::ServiceError,
};

/// Purchase receipt handed to the notifier once an order is paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseNotification {
    pub order_id: Uuid,
    pub buyer_email: String,
    pub buyer_name: Option<String>,
    pub total_amount: i64,
    pub currency: String,
    pub downloads: Vec<DownloadLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadLink {
    pub title: String,
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl PurchaseNotification {
    pub fn for_order(order: &OrderModel) -> Self {
        let title_of = |token: &IssuedToken| {
            order
                .items
                .0
                .iter()
                .find(|item| item.template_id == token.template_id)
                .map(|item| item.title.clone())
                .unwrap_or_default()
        };

        Self {
            order_id: order.id,
            buyer_email: order.buyer_email.clone(),
            buyer_name: order.buyer_name.clone(),
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            downloads: order
                .download_tokens
                .0
                .iter()
                .map(|token| DownloadLink {
                    title: title_of(token),
                    token: token.token.clone(),
                    expires_at: token.expires_at,
                })
                .collect(),
        }
    }

    fn subject(&self) -> String {
        format!("Your purchase is ready (order {})", self.order_id)
    }

    fn text_body(&self) -> String {
        let greeting = self.buyer_name.as_deref().unwrap_or("there");
        let mut body = format!(
            "Hi {},\n\nThanks for your purchase. Total paid: {} {}.\n\n",
            greeting, self.total_amount, self.currency
        );
        for link in &self.downloads {
            body.push_str(&format!(
                "- {}: download token {} (valid until {})\n",
                link.title,
                link.token,
                link.expires_at.to_rfc3339()
            ));
        }
        body
    }
}

/// Outbound buyer messaging. Implementations must not retry internally.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_purchase_confirmation(
        &self,
        notification: &PurchaseNotification,
    ) -> Result<(), ServiceError>;
}

/// Writes the notification to the log instead of sending it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_purchase_confirmation(
        &self,
        notification: &PurchaseNotification,
    ) -> Result<(), ServiceError> {
        info!(
            order_id = %notification.order_id,
            downloads = notification.downloads.len(),
            "purchase notification (log only)"
        );
        Ok(())
    }
}

/// Posts a JSON message to a transactional email API with bearer authentication.
pub struct HttpEmailNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    sender: String,
}

impl HttpEmailNotifier {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        sender: String,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::ConfigurationError(format!("notification client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            sender,
        })
    }
}

#[async_trait]
impl Notifier for HttpEmailNotifier {
    #[instrument(skip(self, notification), fields(order_id = %notification.order_id))]
    async fn send_purchase_confirmation(
        &self,
        notification: &PurchaseNotification,
    ) -> Result<(), ServiceError> {
        let payload = json!({
            "from": self.sender,
            "to": [notification.buyer_email],
            "subject": notification.subject(),
            "text": notification.text_body(),
            "metadata": { "order_id": notification.order_id },
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("email request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "email provider rejected purchase notification");
            return Err(ServiceError::ExternalServiceError(format!(
                "email provider returned {}",
                status
            )));
        }

        info!("purchase notification sent");
        Ok(())
    }
}

pub fn build_notifier(cfg: &AppConfig) -> Result<Arc<dyn Notifier>, ServiceError> {
    match cfg.notification_endpoint.as_deref().filter(|e| !e.is_empty()) {
        Some(endpoint) => Ok(Arc::new(HttpEmailNotifier::new(
            endpoint.to_string(),
            cfg.notification_api_key.clone(),
            cfg.notification_sender.clone(),
            cfg.notification_timeout(),
        )?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
