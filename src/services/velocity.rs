use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{instrument, warn};

use crate::{errors::ServiceError, repositories::OrderRepository};

/// Caps how many unpaid orders a buyer may open inside a trailing window.
#[derive(Debug, Clone)]
pub struct VelocityGuard {
    orders: OrderRepository,
    max_pending: u64,
    window: Duration,
}

impl VelocityGuard {
    pub fn new(orders: OrderRepository, max_pending: u64, window: Duration) -> Self {
        Self {
            orders,
            max_pending,
            window,
        }
    }

    #[instrument(skip(self))]
    pub async fn check(&self, buyer_id: &str) -> Result<(), ServiceError> {
        self.check_at(buyer_id, Utc::now()).await
    }

    pub async fn check_at(&self, buyer_id: &str, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let pending = self
            .orders
            .count_pending_since(buyer_id, now - self.window)
            .await?;

        if pending >= self.max_pending {
            warn!(buyer_id, pending, limit = self.max_pending, "order velocity limit hit");
            counter!("storefront.orders.velocity_rejected", 1);
            return Err(ServiceError::VelocityLimitExceeded);
        }
        Ok(())
    }
}
