use crate::{
    entities::{
        download_token::{self, Entity as DownloadToken},
        order::{IssuedToken, LineItem},
    },
    errors::ServiceError,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// 256 bits of OS randomness per token.
const TOKEN_BYTES: usize = 32;

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Freshly minted token, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedToken {
    pub id: Uuid,
    pub token: String,
    pub buyer_id: String,
    pub template_id: Uuid,
    pub order_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl MintedToken {
    pub fn to_active_model(&self) -> download_token::ActiveModel {
        download_token::ActiveModel {
            id: Set(self.id),
            token: Set(self.token.clone()),
            buyer_id: Set(self.buyer_id.clone()),
            template_id: Set(self.template_id),
            order_id: Set(self.order_id),
            expires_at: Set(self.expires_at),
            created_at: Set(self.created_at),
            used_at: Set(None),
        }
    }

    pub fn issued(&self) -> IssuedToken {
        IssuedToken {
            template_id: self.template_id,
            token: self.token.clone(),
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RedeemedDownload {
    pub template_id: Uuid,
    pub order_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub first_use: bool,
}

/// Mints per-item download tokens and checks them at redemption time.
#[derive(Clone)]
pub struct DownloadTokenIssuer {
    db: Arc<DatabaseConnection>,
    ttl: Duration,
}

impl DownloadTokenIssuer {
    pub fn new(db: Arc<DatabaseConnection>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// One token per line item, expiring `ttl` after `now`.
    pub fn mint(
        &self,
        buyer_id: &str,
        order_id: Uuid,
        items: &[LineItem],
        now: DateTime<Utc>,
    ) -> Vec<MintedToken> {
        items
            .iter()
            .map(|item| MintedToken {
                id: Uuid::new_v4(),
                token: generate_token(),
                buyer_id: buyer_id.to_string(),
                template_id: item.template_id,
                order_id,
                expires_at: now + self.ttl,
                created_at: now,
            })
            .collect()
    }

    pub async fn tokens_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<download_token::Model>, ServiceError> {
        DownloadToken::find()
            .filter(download_token::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::from)
    }

    /// Validates ownership and expiry, stamping `used_at` on first use.
    #[instrument(skip(self, token), fields(buyer_id = %buyer_id))]
    pub async fn redeem(
        &self,
        token: &str,
        buyer_id: &str,
    ) -> Result<RedeemedDownload, ServiceError> {
        let record = DownloadToken::find()
            .filter(download_token::Column::Token.eq(token))
            .one(&*self.db)
            .await?
            .filter(|t| t.buyer_id == buyer_id)
            .ok_or_else(|| ServiceError::NotFound("download link not found".into()))?;

        let now = Utc::now();
        if record.is_expired_at(now) {
            return Err(ServiceError::DownloadExpired);
        }

        let stamped = DownloadToken::update_many()
            .col_expr(download_token::Column::UsedAt, Expr::value(now))
            .filter(download_token::Column::Id.eq(record.id))
            .filter(download_token::Column::UsedAt.is_null())
            .exec(&*self.db)
            .await?;

        let first_use = stamped.rows_affected == 1;
        if first_use {
            info!(order_id = %record.order_id, template_id = %record.template_id, "download token used");
        }

        Ok(RedeemedDownload {
            template_id: record.template_id,
            order_id: record.order_id,
            expires_at: record.expires_at,
            first_use,
        })
    }
}
