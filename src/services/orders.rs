use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::order::{IssuedToken, LineItem, Model as OrderModel, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::{NewOrder, OrderRepository},
    services::{
        catalog::CatalogService,
        coupons::{normalize_code, CouponService},
        fulfillment::{FulfillmentOutcome, FulfillmentService},
        gateway::{GatewaySession, PaymentGateway, PaymentProof, SessionRequest, WebhookRequest},
        velocity::VelocityGuard,
    },
};

/// Authenticated buyer as asserted by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buyer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckoutRequest {
    pub template_id: Uuid,
    #[validate(email)]
    pub buyer_email: Option<String>,
    #[validate(length(max = 200))]
    pub buyer_name: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub coupon_code: Option<String>,
}

/// A fully discounted order comes back already `paid`, with its downloads and no session.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub session_ref: Option<String>,
    pub client_session_token: Option<String>,
    pub gateway: String,
    pub subtotal_amount: i64,
    pub discount_amount: i64,
    pub amount: i64,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub downloads: Vec<IssuedToken>,
}

impl CheckoutResponse {
    fn new(order: OrderModel, session: Option<GatewaySession>) -> Self {
        let (session_ref, client_session_token) = match session {
            Some(session) => (Some(session.session_ref), Some(session.client_session_token)),
            None => (None, None),
        };
        Self {
            order_id: order.id,
            status: order.status,
            session_ref,
            client_session_token,
            gateway: order.gateway,
            subtotal_amount: order.subtotal_amount,
            discount_amount: order.discount_amount,
            amount: order.total_amount,
            currency: order.currency,
            coupon_code: order.coupon_code,
            downloads: order.download_tokens.0,
        }
    }
}

/// Either identifier locates the order; the store id wins when both are present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyRequest {
    pub order_id: Option<Uuid>,
    pub gateway_reference: Option<String>,
    pub payment_id: Option<String>,
    pub signature: Option<String>,
}

impl VerifyRequest {
    fn proof(&self) -> Option<PaymentProof> {
        match (&self.payment_id, &self.signature) {
            (Some(payment_id), Some(signature)) => Some(PaymentProof {
                payment_id: payment_id.clone(),
                signature: signature.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub message: String,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub total_amount: i64,
    pub currency: String,
    pub confirmation_id: Option<String>,
    pub downloads: Vec<IssuedToken>,
    pub already_fulfilled: bool,
}

impl From<FulfillmentOutcome> for VerifyResponse {
    fn from(outcome: FulfillmentOutcome) -> Self {
        Self {
            message: "Payment verified".to_string(),
            order_id: outcome.order.id,
            status: outcome.order.status,
            total_amount: outcome.order.total_amount,
            currency: outcome.order.currency,
            confirmation_id: outcome.confirmation_id,
            downloads: outcome.tokens,
            already_fulfilled: !outcome.newly_fulfilled,
        }
    }
}

/// Buyer-facing view of an order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub id: Uuid,
    pub status: OrderStatus,
    pub items: Vec<LineItem>,
    pub subtotal_amount: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub gateway_reference: Option<String>,
    pub downloads: Vec<IssuedToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrderModel> for OrderView {
    fn from(order: OrderModel) -> Self {
        Self {
            id: order.id,
            status: order.status,
            items: order.items.0,
            subtotal_amount: order.subtotal_amount,
            discount_amount: order.discount_amount,
            total_amount: order.total_amount,
            currency: order.currency,
            coupon_code: order.coupon_code,
            gateway_reference: order.gateway_reference,
            downloads: order.download_tokens.0,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// How an inbound gateway event was settled. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    Fulfilled,
    AlreadyFulfilled,
    NotConfirmed,
    UnknownReference,
    OrderClosed,
}

/// Recorded as the gateway of orders that never needed one.
pub const NO_GATEWAY: &str = "none";

/// Checkout and payment reconciliation.
#[derive(Clone)]
pub struct OrderService {
    orders: OrderRepository,
    catalog: CatalogService,
    coupons: CouponService,
    velocity: VelocityGuard,
    gateway: Arc<dyn PaymentGateway>,
    fulfillment: FulfillmentService,
    events: EventSender,
    payments_enabled: bool,
}

impl OrderService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: OrderRepository,
        catalog: CatalogService,
        coupons: CouponService,
        velocity: VelocityGuard,
        gateway: Arc<dyn PaymentGateway>,
        fulfillment: FulfillmentService,
        events: EventSender,
        payments_enabled: bool,
    ) -> Self {
        Self {
            orders,
            catalog,
            coupons,
            velocity,
            gateway,
            fulfillment,
            events,
            payments_enabled,
        }
    }

    /// Opens a `created` order and a remote payment session for it. Orders that cost nothing
    /// after discount skip the gateway and are fulfilled on the spot.
    #[instrument(skip(self, buyer, request), fields(buyer_id = %buyer.id, template_id = %request.template_id))]
    pub async fn checkout(
        &self,
        buyer: &Buyer,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        request.validate()?;
        if !self.payments_enabled {
            return Err(ServiceError::PaymentsDisabled);
        }

        self.velocity.check(&buyer.id).await?;
        let template = self.catalog.get_purchasable(request.template_id).await?;

        let buyer_email = request
            .buyer_email
            .or_else(|| buyer.email.clone())
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ServiceError::ValidationError("buyer_email is required".into()))?;
        let buyer_name = request.buyer_name.or_else(|| buyer.name.clone());

        let (coupon_code, discount) = match request.coupon_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                let quote = self
                    .coupons
                    .validate(code, &buyer_email, template.price)
                    .await?;
                (Some(normalize_code(code)), quote.discount_amount)
            }
            _ => (None, 0),
        };
        let free = template.price - discount <= 0;

        let order = self
            .orders
            .create_order(NewOrder {
                buyer_id: buyer.id.clone(),
                buyer_email: buyer_email.clone(),
                buyer_name,
                items: vec![LineItem {
                    template_id: template.id,
                    title: template.title.clone(),
                    price: template.price,
                }],
                discount_amount: discount,
                currency: template.currency.clone(),
                coupon_code,
                gateway: if free { NO_GATEWAY } else { self.gateway.name() }.to_string(),
            })
            .await?;
        self.events.publish(Event::OrderCreated {
            order_id: order.id,
            buyer_id: order.buyer_id.clone(),
            total_amount: order.total_amount,
            currency: order.currency.clone(),
        });

        if order.total_amount == 0 {
            return self.fulfill_free_order(order).await;
        }

        let session_request = SessionRequest {
            order_id: order.id,
            amount: order.total_amount,
            currency: order.currency.clone(),
            buyer_email,
            description: template.title,
        };
        let session = match self.gateway.create_session(&session_request).await {
            Ok(session) => session,
            Err(e) => {
                counter!("storefront.orders.gateway_failed", 1);
                self.abandon(&order, &e).await;
                return Err(match e {
                    ServiceError::GatewayError(_) => e,
                    other => ServiceError::GatewayError(other.to_string()),
                });
            }
        };

        if let Err(e) = self
            .orders
            .set_gateway_reference(order.id, &session.session_ref)
            .await
        {
            self.abandon(&order, &e).await;
            return Err(e);
        }

        counter!("storefront.orders.created", 1);
        info!(order_id = %order.id, total = order.total_amount, "checkout session opened");
        Ok(CheckoutResponse::new(order, Some(session)))
    }

    async fn fulfill_free_order(&self, order: OrderModel) -> Result<CheckoutResponse, ServiceError> {
        let confirmation_id = format!("free_{}", order.id.simple());
        match self.fulfillment.fulfill(&order, &confirmation_id).await {
            Ok(outcome) => {
                counter!("storefront.orders.created", 1);
                info!(order_id = %order.id, "fully discounted order fulfilled without a gateway");
                Ok(CheckoutResponse::new(outcome.order, None))
            }
            Err(e) => {
                self.abandon(&order, &e).await;
                Err(e)
            }
        }
    }

    /// Marks an order that could not proceed to payment as failed so it stops counting as pending.
    async fn abandon(&self, order: &OrderModel, cause: &ServiceError) {
        warn!(order_id = %order.id, error = %cause, "order abandoned before payment");
        match self.orders.mark_failed(order.id).await {
            Ok(_) => {
                let failed = Event::OrderFailed {
                    order_id: order.id,
                    reason: cause.code().to_string(),
                };
                self.events.publish(failed);
            }
            Err(e) => warn!(order_id = %order.id, error = %e, "could not mark order failed"),
        }
    }

    /// Buyer-initiated verification. Safe to repeat for the same order.
    #[instrument(skip(self, buyer, request), fields(buyer_id = %buyer.id))]
    pub async fn verify(
        &self,
        buyer: &Buyer,
        request: VerifyRequest,
    ) -> Result<VerifyResponse, ServiceError> {
        let order = match (&request.order_id, request.gateway_reference.as_deref()) {
            (Some(id), _) => self.orders.find_by_id(*id).await?,
            (None, Some(reference)) if !reference.trim().is_empty() => {
                self.orders.get_by_gateway_reference(reference.trim()).await?
            }
            _ => {
                return Err(ServiceError::ValidationError(
                    "order_id or gateway_reference is required".into(),
                ))
            }
        }
        .filter(|order| order.buyer_id == buyer.id)
        .ok_or_else(|| ServiceError::NotFound("Order not found".into()))?;

        let proof = request.proof();
        self.reconcile(order, proof.as_ref()).await.map(Into::into)
    }

    pub fn session_ref_from_event(&self, event: &serde_json::Value) -> Option<String> {
        self.gateway.session_ref_from_event(event)
    }

    /// Checks the webhook against the configured processor's signing scheme.
    pub fn verify_webhook(&self, request: &WebhookRequest<'_>) -> bool {
        self.gateway.verify_webhook(request)
    }

    /// Server-to-server path: the gateway names a session, the order is looked up by it.
    #[instrument(skip(self))]
    pub async fn handle_gateway_event(
        &self,
        session_ref: &str,
    ) -> Result<WebhookDisposition, ServiceError> {
        let Some(order) = self.orders.get_by_gateway_reference(session_ref).await? else {
            let confirmation = self.gateway.confirm_payment(session_ref, None).await?;
            if confirmation.succeeded {
                self.fulfillment.report_orphan_payment(session_ref, None);
            } else {
                warn!(%session_ref, "webhook for unknown payment session");
            }
            return Ok(WebhookDisposition::UnknownReference);
        };

        match self.reconcile(order, None).await {
            Ok(outcome) if outcome.newly_fulfilled => Ok(WebhookDisposition::Fulfilled),
            Ok(_) => Ok(WebhookDisposition::AlreadyFulfilled),
            Err(ServiceError::PaymentNotConfirmed) => Ok(WebhookDisposition::NotConfirmed),
            Err(ServiceError::OrderAlreadyProcessed(_)) => Ok(WebhookDisposition::OrderClosed),
            Err(e) => Err(e),
        }
    }

    /// Asks the gateway for a definitive outcome and fulfills on success.
    async fn reconcile(
        &self,
        order: OrderModel,
        proof: Option<&PaymentProof>,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        if order.status == OrderStatus::Paid {
            return self.fulfillment.fulfill(&order, "").await;
        }

        let Some(session_ref) = order.gateway_reference.clone() else {
            return Err(if order.status.is_terminal_unpaid() {
                ServiceError::OrderAlreadyProcessed(order.id)
            } else {
                ServiceError::PaymentNotConfirmed
            });
        };

        let confirmation = self.gateway.confirm_payment(&session_ref, proof).await?;
        if !confirmation.succeeded {
            if order.status.is_terminal_unpaid() {
                return Err(ServiceError::OrderAlreadyProcessed(order.id));
            }
            info!(order_id = %order.id, "payment not confirmed yet");
            return Err(ServiceError::PaymentNotConfirmed);
        }

        let confirmation_id = confirmation.confirmation_id.unwrap_or(session_ref);
        self.fulfillment.fulfill(&order, &confirmation_id).await
    }

    /// The caller's own order.
    pub async fn get_order(&self, buyer: &Buyer, order_id: Uuid) -> Result<OrderView, ServiceError> {
        self.orders
            .find_by_id(order_id)
            .await?
            .filter(|order| order.buyer_id == buyer.id)
            .map(OrderView::from)
            .ok_or_else(|| ServiceError::NotFound("Order not found".into()))
    }

    pub async fn list_orders(&self, buyer: &Buyer) -> Result<Vec<OrderView>, ServiceError> {
        Ok(self
            .orders
            .list_for_buyer(&buyer.id)
            .await?
            .into_iter()
            .map(OrderView::from)
            .collect())
    }
}
