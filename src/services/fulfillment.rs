use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::order::{IssuedToken, Model as OrderModel, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::{OrderRepository, Transition},
    services::{
        coupons::{CouponService, RedemptionOutcome, RedemptionRecord},
        download_tokens::DownloadTokenIssuer,
        notifications::{Notifier, PurchaseNotification},
    },
};

/// What a buyer gets back from a successful fulfillment, fresh or replayed.
#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentOutcome {
    pub order: OrderModel,
    pub tokens: Vec<IssuedToken>,
    pub confirmation_id: Option<String>,
    /// False when an earlier attempt already fulfilled the order
    pub newly_fulfilled: bool,
}

impl FulfillmentOutcome {
    fn replayed(order: OrderModel) -> Self {
        counter!("storefront.orders.fulfillment_replayed", 1);
        Self {
            tokens: order.download_tokens.0.clone(),
            confirmation_id: order.payment_confirmation_id.clone(),
            order,
            newly_fulfilled: false,
        }
    }
}

/// Turns a confirmed payment into a paid order with download tokens, exactly once.
#[derive(Clone)]
pub struct FulfillmentService {
    orders: OrderRepository,
    tokens: DownloadTokenIssuer,
    coupons: CouponService,
    notifier: Arc<dyn Notifier>,
    events: EventSender,
    notification_timeout: Duration,
}

impl FulfillmentService {
    pub fn new(
        orders: OrderRepository,
        tokens: DownloadTokenIssuer,
        coupons: CouponService,
        notifier: Arc<dyn Notifier>,
        events: EventSender,
        notification_timeout: Duration,
    ) -> Self {
        Self {
            orders,
            tokens,
            coupons,
            notifier,
            events,
            notification_timeout,
        }
    }

    /// Call only after the gateway confirmed success for `order`'s reference.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn fulfill(
        &self,
        order: &OrderModel,
        confirmation_id: &str,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        match order.status {
            OrderStatus::Paid => return Ok(FulfillmentOutcome::replayed(order.clone())),
            status if status.is_terminal_unpaid() => {
                self.integrity_alert(order, confirmation_id, "payment confirmed for a closed order");
                return Err(ServiceError::OrderAlreadyProcessed(order.id));
            }
            _ => {}
        }

        let minted = self
            .tokens
            .mint(&order.buyer_id, order.id, &order.items.0, Utc::now());

        let transition = match self
            .orders
            .transition_to_paid(order.id, confirmation_id, &minted)
            .await
        {
            Ok(transition) => transition,
            Err(ServiceError::OrderAlreadyProcessed(id)) => {
                self.integrity_alert(order, confirmation_id, "order closed while payment confirmed");
                return Err(ServiceError::OrderAlreadyProcessed(id));
            }
            Err(ServiceError::NotFound(_)) => {
                self.integrity_alert(order, confirmation_id, "confirmed order vanished");
                return Err(ServiceError::IntegrityViolation(format!(
                    "order {} missing at fulfillment",
                    order.id
                )));
            }
            Err(e) => return Err(e),
        };

        match transition {
            Transition::AlreadyPaid(existing) => {
                info!("order was fulfilled by a concurrent attempt");
                Ok(FulfillmentOutcome::replayed(existing))
            }
            Transition::Applied(paid) => {
                counter!("storefront.orders.paid", 1);
                info!(tokens = paid.download_tokens.0.len(), "order paid");
                self.run_post_commit(&paid).await;
                Ok(FulfillmentOutcome {
                    tokens: paid.download_tokens.0.clone(),
                    confirmation_id: paid.payment_confirmation_id.clone(),
                    order: paid,
                    newly_fulfilled: true,
                })
            }
        }
    }

    /// Best-effort work after the paid commit. Each step is isolated and never fails the caller.
    async fn run_post_commit(&self, order: &OrderModel) {
        if let Some(code) = order.coupon_code.clone() {
            self.redeem_coupon(order, code).await;
        }

        let notification = PurchaseNotification::for_order(order);
        match tokio::time::timeout(
            self.notification_timeout,
            self.notifier.send_purchase_confirmation(&notification),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counter!("storefront.notifications.failed", 1);
                warn!(order_id = %order.id, error = %e, "purchase notification failed");
            }
            Err(_) => {
                counter!("storefront.notifications.failed", 1);
                warn!(order_id = %order.id, "purchase notification timed out");
            }
        }

        let paid = Event::OrderPaid {
            order_id: order.id,
            buyer_id: order.buyer_id.clone(),
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            coupon_code: order.coupon_code.clone(),
            tokens_issued: order.download_tokens.0.len(),
            paid_at: order.updated_at,
        };
        self.events.publish(paid);
    }

    async fn redeem_coupon(&self, order: &OrderModel, code: String) {
        let record = RedemptionRecord {
            coupon_code: code.clone(),
            order_id: order.id,
            buyer_id: order.buyer_id.clone(),
            buyer_email: order.buyer_email.clone(),
            buyer_name: order.buyer_name.clone(),
            amount: order.total_amount,
            discount_applied: order.discount_amount,
        };

        match self.coupons.record_redemption(record).await {
            Ok(RedemptionOutcome::AlreadyRecorded) => {}
            Ok(_) => {
                let event = Event::CouponRedeemed {
                    coupon_code: code,
                    order_id: order.id,
                    discount_applied: order.discount_amount,
                };
                self.events.publish(event);
            }
            Err(e) => {
                counter!("storefront.coupons.redemption_failed", 1);
                error!(order_id = %order.id, coupon_code = %code, error = %e, "coupon redemption not recorded");
            }
        }
    }

    fn integrity_alert(&self, order: &OrderModel, confirmation_id: &str, detail: &str) {
        error!(
            integrity = true,
            order_id = %order.id,
            status = ?order.status,
            %confirmation_id,
            "{}",
            detail
        );
        let alert = Event::PaymentIntegrityAlert {
            session_ref: order.gateway_reference.clone().unwrap_or_default(),
            order_id: Some(order.id),
            detail: detail.to_string(),
        };
        self.events.publish(alert);
    }

    /// Raised by callers that hold a confirmed payment but no matching order.
    pub fn report_orphan_payment(&self, session_ref: &str, order_id: Option<Uuid>) {
        error!(integrity = true, %session_ref, ?order_id, "payment confirmed for an unknown order");
        let alert = Event::PaymentIntegrityAlert {
            session_ref: session_ref.to_string(),
            order_id,
            detail: "payment confirmed for an unknown order".into(),
        };
        self.events.publish(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::order::LineItem;
    use crate::events;
    use crate::repositories::NewOrder;
    use crate::services::notifications::LogNotifier;
    use sea_orm::{ConnectOptions, Database};

    async fn setup(events: EventSender) -> (FulfillmentService, OrderRepository) {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1).min_connections(1);
        let db = Database::connect(options).await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        let db = Arc::new(db);

        let orders = OrderRepository::new(db.clone());
        let service = FulfillmentService::new(
            orders.clone(),
            DownloadTokenIssuer::new(db.clone(), chrono::Duration::days(7)),
            CouponService::new(db),
            Arc::new(LogNotifier),
            events,
            Duration::from_secs(1),
        );
        (service, orders)
    }

    async fn open_order(orders: &OrderRepository) -> OrderModel {
        orders
            .create_order(NewOrder {
                buyer_id: "buyer-1".into(),
                buyer_email: "buyer@example.com".into(),
                buyer_name: None,
                items: vec![LineItem {
                    template_id: Uuid::new_v4(),
                    title: "Invoice parser".into(),
                    price: 2_000,
                }],
                discount_amount: 0,
                currency: "INR".into(),
                coupon_code: None,
                gateway: "mock".into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn backed_up_event_channel_does_not_stall_fulfillment() {
        let (sender, _rx) = events::channel(1);
        assert!(sender.publish(Event::OrderFailed {
            order_id: Uuid::new_v4(),
            reason: "filler".into(),
        }));
        let (service, orders) = setup(sender).await;
        let order = open_order(&orders).await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            service.fulfill(&order, "pay_1"),
        )
        .await
        .expect("fulfillment must not wait on the event channel")
        .unwrap();

        assert!(outcome.newly_fulfilled);
        assert_eq!(outcome.order.status, OrderStatus::Paid);
        assert_eq!(outcome.tokens.len(), 1);
    }

    #[tokio::test]
    async fn closed_order_raises_alert_without_waiting() {
        let (sender, _rx) = events::channel(1);
        let (service, orders) = setup(sender.clone()).await;
        let order = open_order(&orders).await;
        orders.mark_failed(order.id).await.unwrap();
        let failed = orders.find_by_id(order.id).await.unwrap().unwrap();

        let result = service.fulfill(&failed, "pay_1").await;
        assert!(matches!(result, Err(ServiceError::OrderAlreadyProcessed(_))));

        // The alert took the only slot in the channel.
        assert!(!sender.publish(Event::OrderFailed {
            order_id: order.id,
            reason: "filler".into(),
        }));
    }
}
