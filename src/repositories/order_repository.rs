use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::download_token::Entity as DownloadToken;
use crate::entities::order::{
    self, ActiveModel as OrderActiveModel, Column, Entity as Order, IssuedTokens, LineItem,
    LineItems, Model as OrderModel, OrderStatus,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;
use crate::services::download_tokens::MintedToken;

use super::BaseRepository;

/// Input for a fresh `created` order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub buyer_id: String,
    pub buyer_email: String,
    pub buyer_name: Option<String>,
    pub items: Vec<LineItem>,
    pub discount_amount: i64,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub gateway: String,
}

/// Result of a `created -> paid` attempt.
#[derive(Debug, Clone)]
pub enum Transition {
    /// This call flipped the order; post-commit effects are due
    Applied(OrderModel),
    /// Another attempt already did; nothing was written
    AlreadyPaid(OrderModel),
}

impl Transition {
    pub fn order(&self) -> &OrderModel {
        match self {
            Transition::Applied(order) | Transition::AlreadyPaid(order) => order,
        }
    }

    pub fn into_order(self) -> OrderModel {
        match self {
            Transition::Applied(order) | Transition::AlreadyPaid(order) => order,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Order store backed by the `orders` and `download_tokens` tables.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    base: BaseRepository,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Writes a new order in status `created` with no gateway reference and no tokens.
    #[instrument(skip(self, new_order), fields(buyer_id = %new_order.buyer_id))]
    pub async fn create_order(&self, new_order: NewOrder) -> Result<OrderModel, ServiceError> {
        if new_order.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "an order needs at least one item".into(),
            ));
        }

        let items = LineItems(new_order.items);
        let subtotal = items.subtotal();
        let discount = new_order.discount_amount.clamp(0, subtotal.max(0));
        let now = Utc::now();

        let model = OrderActiveModel {
            id: Set(Uuid::new_v4()),
            buyer_id: Set(new_order.buyer_id),
            buyer_email: Set(new_order.buyer_email),
            buyer_name: Set(new_order.buyer_name),
            items: Set(items),
            subtotal_amount: Set(subtotal),
            discount_amount: Set(discount),
            total_amount: Set(subtotal - discount),
            currency: Set(new_order.currency),
            coupon_code: Set(new_order.coupon_code),
            status: Set(OrderStatus::Created),
            gateway: Set(new_order.gateway),
            gateway_reference: Set(None),
            payment_confirmation_id: Set(None),
            download_tokens: Set(IssuedTokens::default()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = model.insert(self.base.get_db()).await?;
        debug!(order_id = %created.id, total = created.total_amount, "order created");
        Ok(created)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<OrderModel>, ServiceError> {
        Order::find_by_id(id)
            .one(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Lookup used by callbacks, which only know the gateway's own id.
    pub async fn get_by_gateway_reference(
        &self,
        reference: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Order::find()
            .filter(Column::GatewayReference.eq(reference))
            .one(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    pub async fn list_for_buyer(&self, buyer_id: &str) -> Result<Vec<OrderModel>, ServiceError> {
        Order::find()
            .filter(Column::BuyerId.eq(buyer_id))
            .order_by_desc(Column::CreatedAt)
            .all(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Records the remote session reference on a still-`created` order.
    pub async fn set_gateway_reference(
        &self,
        order_id: Uuid,
        reference: &str,
    ) -> Result<(), ServiceError> {
        let result = Order::update_many()
            .col_expr(Column::GatewayReference, Expr::value(reference.to_string()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(order_id))
            .filter(Column::Status.eq(OrderStatus::Created))
            .exec(self.base.get_db())
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "order {} is no longer awaiting payment",
                order_id
            )));
        }
        Ok(())
    }

    /// `created -> failed`; returns whether this call changed the order.
    pub async fn mark_failed(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        self.conditional_status(order_id, OrderStatus::Created, OrderStatus::Failed)
            .await
    }

    /// `paid -> refunded`; returns whether this call changed the order.
    pub async fn mark_refunded(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        self.conditional_status(order_id, OrderStatus::Paid, OrderStatus::Refunded)
            .await
    }

    async fn conditional_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, ServiceError> {
        let result = Order::update_many()
            .col_expr(Column::Status, Expr::value(next))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(order_id))
            .filter(Column::Status.eq(expected))
            .exec(self.base.get_db())
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Pending orders of a buyer created at or after `since`.
    pub async fn count_pending_since(
        &self,
        buyer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        Order::find()
            .filter(Column::BuyerId.eq(buyer_id))
            .filter(Column::Status.eq(OrderStatus::Created))
            .filter(Column::CreatedAt.gte(since))
            .count(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Flips `created -> paid` together with the token rows and confirmation id, all or nothing.
    ///
    /// An already `paid` order is returned untouched. `failed` and `refunded` orders are rejected.
    /// The write is conditional on the prior status, so concurrent callers cannot both apply it.
    #[instrument(skip(self, tokens), fields(order_id = %order_id, tokens = tokens.len()))]
    pub async fn transition_to_paid(
        &self,
        order_id: Uuid,
        confirmation_id: &str,
        tokens: &[MintedToken],
    ) -> Result<Transition, ServiceError> {
        let current = self
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;

        match current.status {
            OrderStatus::Paid => return Ok(Transition::AlreadyPaid(current)),
            OrderStatus::Failed | OrderStatus::Refunded => {
                return Err(ServiceError::OrderAlreadyProcessed(order_id))
            }
            OrderStatus::Created => {}
        }

        let db = self.base.get_db();
        let txn = db.begin().await?;
        let applied = match apply_paid(&txn, order_id, confirmation_id, tokens).await {
            Ok(rows) => rows == 1,
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed paid transition also failed");
                }
                return Err(e.into());
            }
        };

        if !applied {
            txn.rollback().await?;
            // Lost the race: report whatever the winner left behind.
            let latest = self
                .find_by_id(order_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;
            return match latest.status {
                OrderStatus::Paid => Ok(Transition::AlreadyPaid(latest)),
                _ => Err(ServiceError::OrderAlreadyProcessed(order_id)),
            };
        }

        txn.commit().await?;

        let paid = self.find_by_id(order_id).await?.ok_or_else(|| {
            ServiceError::InternalError(format!("order {} vanished after commit", order_id))
        })?;
        Ok(Transition::Applied(paid))
    }
}

async fn apply_paid<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    confirmation_id: &str,
    tokens: &[MintedToken],
) -> Result<u64, DbErr> {
    if !tokens.is_empty() {
        DownloadToken::insert_many(tokens.iter().map(MintedToken::to_active_model))
            .exec_without_returning(conn)
            .await?;
    }

    let issued = IssuedTokens(tokens.iter().map(MintedToken::issued).collect());
    let result = Order::update_many()
        .col_expr(Column::Status, Expr::value(OrderStatus::Paid))
        .col_expr(
            Column::PaymentConfirmationId,
            Expr::value(Some(confirmation_id.to_string())),
        )
        .col_expr(order::Column::DownloadTokens, Expr::value(issued))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::Id.eq(order_id))
        .filter(Column::Status.eq(OrderStatus::Created))
        .exec(conn)
        .await?;

    Ok(result.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::download_tokens::DownloadTokenIssuer;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use sea_orm::{ConnectOptions, Database};

    async fn repository() -> (OrderRepository, DownloadTokenIssuer) {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1).min_connections(1);
        let db = Database::connect(options).await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        let db = Arc::new(db);
        (
            OrderRepository::new(db.clone()),
            DownloadTokenIssuer::new(db, Duration::days(7)),
        )
    }

    fn new_order(buyer_id: &str, discount: i64) -> NewOrder {
        NewOrder {
            buyer_id: buyer_id.into(),
            buyer_email: "buyer@example.com".into(),
            buyer_name: None,
            items: vec![LineItem {
                template_id: Uuid::new_v4(),
                title: "CRM lead sync".into(),
                price: 10_000,
            }],
            discount_amount: discount,
            currency: "USD".into(),
            coupon_code: None,
            gateway: "mock".into(),
        }
    }

    #[tokio::test]
    async fn new_orders_start_created_with_clamped_discount() {
        let (repo, _) = repository().await;

        let order = repo.create_order(new_order("buyer-1", 2_000)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Created);
        assert_eq!(order.subtotal_amount, 10_000);
        assert_eq!(order.total_amount, 8_000);
        assert!(order.gateway_reference.is_none());
        assert!(order.download_tokens.0.is_empty());

        let over = repo.create_order(new_order("buyer-1", 50_000)).await.unwrap();
        assert_eq!(over.discount_amount, 10_000);
        assert_eq!(over.total_amount, 0);
    }

    #[tokio::test]
    async fn gateway_reference_is_the_callback_lookup_key() {
        let (repo, _) = repository().await;
        let order = repo.create_order(new_order("buyer-1", 0)).await.unwrap();

        repo.set_gateway_reference(order.id, "sess_1").await.unwrap();

        let found = repo.get_by_gateway_reference("sess_1").await.unwrap().unwrap();
        assert_eq!(found.id, order.id);
        assert!(repo.get_by_gateway_reference("sess_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paid_transition_applies_once_and_then_replays() {
        let (repo, issuer) = repository().await;
        let order = repo.create_order(new_order("buyer-1", 0)).await.unwrap();
        let minted = issuer.mint(&order.buyer_id, order.id, &order.items.0, Utc::now());

        let first = repo.transition_to_paid(order.id, "pay_1", &minted).await.unwrap();
        assert!(first.was_applied());
        assert_eq!(first.order().status, OrderStatus::Paid);
        assert_eq!(first.order().payment_confirmation_id.as_deref(), Some("pay_1"));
        assert_eq!(first.order().download_tokens.0, vec![minted[0].issued()]);

        let again = issuer.mint(&order.buyer_id, order.id, &order.items.0, Utc::now());
        let second = repo.transition_to_paid(order.id, "pay_2", &again).await.unwrap();
        assert_matches!(second, Transition::AlreadyPaid(_));
        let replayed = second.into_order();
        assert_eq!(replayed.payment_confirmation_id.as_deref(), Some("pay_1"));
        assert_eq!(replayed.download_tokens, first.order().download_tokens);

        assert_eq!(issuer.tokens_for_order(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_orders_cannot_be_paid() {
        let (repo, issuer) = repository().await;
        let order = repo.create_order(new_order("buyer-1", 0)).await.unwrap();
        assert!(repo.mark_failed(order.id).await.unwrap());
        assert!(!repo.mark_failed(order.id).await.unwrap());

        let minted = issuer.mint(&order.buyer_id, order.id, &order.items.0, Utc::now());
        let result = repo.transition_to_paid(order.id, "pay_1", &minted).await;

        assert_matches!(result, Err(ServiceError::OrderAlreadyProcessed(id)) if id == order.id);
        assert!(issuer.tokens_for_order(order.id).await.unwrap().is_empty());
        assert_matches!(
            repo.transition_to_paid(Uuid::new_v4(), "pay_1", &[]).await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn refunds_only_apply_to_paid_orders() {
        let (repo, issuer) = repository().await;
        let order = repo.create_order(new_order("buyer-1", 0)).await.unwrap();
        assert!(!repo.mark_refunded(order.id).await.unwrap());

        let minted = issuer.mint(&order.buyer_id, order.id, &order.items.0, Utc::now());
        repo.transition_to_paid(order.id, "pay_1", &minted).await.unwrap();
        assert!(repo.mark_refunded(order.id).await.unwrap());

        let refunded = repo.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(refunded.status, OrderStatus::Refunded);
        assert_matches!(
            repo.transition_to_paid(order.id, "pay_1", &[]).await,
            Err(ServiceError::OrderAlreadyProcessed(_))
        );
    }

    #[tokio::test]
    async fn pending_count_ignores_other_buyers_and_closed_orders() {
        let (repo, _) = repository().await;
        let since = Utc::now() - Duration::minutes(60);

        repo.create_order(new_order("buyer-1", 0)).await.unwrap();
        let failed = repo.create_order(new_order("buyer-1", 0)).await.unwrap();
        repo.mark_failed(failed.id).await.unwrap();
        repo.create_order(new_order("buyer-2", 0)).await.unwrap();

        assert_eq!(repo.count_pending_since("buyer-1", since).await.unwrap(), 1);
        assert_eq!(
            repo.count_pending_since("buyer-1", Utc::now() + Duration::minutes(1))
                .await
                .unwrap(),
            0
        );
        assert_eq!(repo.list_for_buyer("buyer-1").await.unwrap().len(), 2);
    }
}
