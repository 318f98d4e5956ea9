use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Enqueues without waiting. A full or closed channel drops the event and returns false.
    pub fn publish(&self, event: Event) -> bool {
        let kind = event.kind();
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("storefront.events.dropped", 1);
                warn!(kind, "event channel full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                counter!("storefront.events.dropped", 1);
                warn!(kind, "event channel closed, event dropped");
                false
            }
        }
    }
}

/// Bounded event channel used between request handlers and the processing loop.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Things that happened to orders, coupons and downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        buyer_id: String,
        total_amount: i64,
        currency: String,
    },
    OrderPaid {
        order_id: Uuid,
        buyer_id: String,
        total_amount: i64,
        currency: String,
        coupon_code: Option<String>,
        tokens_issued: usize,
        paid_at: DateTime<Utc>,
    },
    OrderFailed {
        order_id: Uuid,
        reason: String,
    },
    CouponRedeemed {
        coupon_code: String,
        order_id: Uuid,
        discount_applied: i64,
    },
    DownloadRedeemed {
        order_id: Uuid,
        template_id: Uuid,
    },
    /// A gateway confirmed money for an order that cannot accept it
    PaymentIntegrityAlert {
        session_ref: String,
        order_id: Option<Uuid>,
        detail: String,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderPaid { .. } => "order_paid",
            Event::OrderFailed { .. } => "order_failed",
            Event::CouponRedeemed { .. } => "coupon_redeemed",
            Event::DownloadRedeemed { .. } => "download_redeemed",
            Event::PaymentIntegrityAlert { .. } => "payment_integrity_alert",
        }
    }
}

// Handlers implementing this trait process events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Default handler: writes every event to the log.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: Event) -> Result<(), String> {
        match &event {
            Event::PaymentIntegrityAlert {
                session_ref,
                order_id,
                detail,
            } => {
                error!(integrity = true, %session_ref, ?order_id, %detail, "payment integrity alert");
            }
            Event::OrderFailed { order_id, reason } => {
                warn!(%order_id, %reason, "order failed");
            }
            other => info!(kind = other.kind(), event = ?other, "event processed"),
        }
        Ok(())
    }
}

/// Drains the channel, fanning each event out to every handler. Returns when all senders are gone.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!(handlers = handlers.len(), "Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let kind = event.kind();
        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler.handle_event(event.clone())),
        )
        .await;

        for e in results.into_iter().filter_map(Result::err) {
            error!(kind, error = %e, "event handler failed");
        }
    }

    info!("Event processing loop stopped");
}
