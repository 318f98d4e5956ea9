use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    repositories::OrderRepository,
    services::{
        catalog::CatalogService,
        coupons::CouponService,
        download_tokens::DownloadTokenIssuer,
        fulfillment::FulfillmentService,
        gateway::PaymentGateway,
        notifications::Notifier,
        orders::OrderService,
        velocity::VelocityGuard,
    },
};

pub mod admin;
pub mod coupons;
pub mod downloads;
pub mod health;
pub mod orders;
pub mod payment_webhooks;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub coupons: Arc<CouponService>,
    pub catalog: Arc<CatalogService>,
    pub downloads: Arc<DownloadTokenIssuer>,
}

impl AppServices {
    /// Wires every service from explicitly passed collaborators.
    pub fn new(
        db: Arc<DbPool>,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        event_sender: EventSender,
    ) -> Self {
        let orders = OrderRepository::new(db.clone());
        let catalog = CatalogService::new(db.clone(), config.default_currency.clone());
        let coupons = CouponService::new(db.clone());
        let downloads = DownloadTokenIssuer::new(db, config.download_token_ttl());
        let velocity = VelocityGuard::new(
            orders.clone(),
            config.velocity_max_pending_orders,
            config.velocity_window(),
        );
        let fulfillment = FulfillmentService::new(
            orders.clone(),
            downloads.clone(),
            coupons.clone(),
            notifier,
            event_sender.clone(),
            config.notification_timeout(),
        );
        let order_service = OrderService::new(
            orders,
            catalog.clone(),
            coupons.clone(),
            velocity,
            gateway,
            fulfillment,
            event_sender,
            config.payments_enabled,
        );

        Self {
            orders: Arc::new(order_service),
            coupons: Arc::new(coupons),
            catalog: Arc::new(catalog),
            downloads: Arc::new(downloads),
        }
    }
}
