use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Identity-provider subject of the buyer
    pub buyer_id: String,
    pub buyer_email: String,
    pub buyer_name: Option<String>,
    #[sea_orm(column_type = "Json")]
    pub items: LineItems,
    pub subtotal_amount: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub status: OrderStatus,
    /// Adapter that opened the payment session
    pub gateway: String,
    #[sea_orm(unique)]
    pub gateway_reference: Option<String>,
    pub payment_confirmation_id: Option<String>,
    #[sea_orm(column_type = "Json")]
    pub download_tokens: IssuedTokens,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "created")]
    Created,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl OrderStatus {
    /// Statuses from which no further payment transition is possible.
    pub fn is_terminal_unpaid(self) -> bool {
        matches!(self, OrderStatus::Failed | OrderStatus::Refunded)
    }
}

/// Snapshot of a purchased template at checkout time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub template_id: Uuid,
    pub title: String,
    pub price: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct LineItems(pub Vec<LineItem>);

impl LineItems {
    pub fn subtotal(&self) -> i64 {
        self.0.iter().map(|item| item.price).sum()
    }
}

/// Token reference kept on the order so a replayed verification can answer without re-minting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub template_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct IssuedTokens(pub Vec<IssuedToken>);

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::download_token::Entity")]
    DownloadTokens,
}

impl Related<super::download_token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DownloadTokens.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
