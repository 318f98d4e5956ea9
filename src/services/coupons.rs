use crate::{
    common::{normalize_epoch_millis, TimestampInput},
    entities::{
        coupon::{self, DiscountType, Entity as Coupon, Model as CouponModel},
        coupon_redemption,
    },
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::{Condition, Expr},
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, SqlErr,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Why a coupon was not applied. The first failing check wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouponRejection {
    /// Unknown, inactive or misconfigured code
    Invalid,
    /// Outside the validity window (too early or too late)
    Expired,
    LimitReached,
    InvalidEmail,
}

impl CouponRejection {
    pub fn code(self) -> &'static str {
        match self {
            CouponRejection::Invalid => "COUPON_INVALID",
            CouponRejection::Expired => "COUPON_EXPIRED",
            CouponRejection::LimitReached => "COUPON_LIMIT_REACHED",
            CouponRejection::InvalidEmail => "COUPON_INVALID_EMAIL",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            CouponRejection::Invalid => "Coupon code is not valid",
            CouponRejection::Expired => "Coupon is expired or not active yet",
            CouponRejection::LimitReached => "Coupon usage limit has been reached",
            CouponRejection::InvalidEmail => "Coupon is not valid for this email address",
        }
    }
}

/// Pricing outcome of an accepted coupon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CouponQuote {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_amount: i64,
    pub final_price: i64,
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Discount for `price`, rounded half away from zero to a whole minor unit and clamped to `[0, price]`.
pub fn compute_discount(discount_type: DiscountType, value: i64, price: i64) -> i64 {
    let price = price.max(0);
    let raw = match discount_type {
        DiscountType::Percentage => (Decimal::from(price) * Decimal::from(value)
            / Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or(price),
        DiscountType::Fixed => value,
    };
    raw.clamp(0, price)
}

/// Pure validation and pricing. `coupon` is the lookup result for the normalized code.
pub fn evaluate(
    coupon: Option<&CouponModel>,
    buyer_email: &str,
    price: i64,
    now_ms: i64,
) -> Result<CouponQuote, CouponRejection> {
    let coupon = match coupon {
        Some(c) if c.is_active => c,
        _ => return Err(CouponRejection::Invalid),
    };

    let window = normalize_epoch_millis(&coupon.valid_from)
        .and_then(|from| normalize_epoch_millis(&coupon.valid_until).map(|until| (from, until)));
    let (from, until) = match window {
        Ok(bounds) => bounds,
        Err(e) => {
            error!(coupon_code = %coupon.code, error = %e, "coupon has an unreadable validity window");
            return Err(CouponRejection::Invalid);
        }
    };
    if now_ms < from || now_ms > until {
        return Err(CouponRejection::Expired);
    }

    if let Some(limit) = coupon.usage_limit {
        if coupon.used_count >= limit {
            return Err(CouponRejection::LimitReached);
        }
    }

    if let Some(restricted) = coupon.specific_email.as_deref() {
        let restricted = restricted.trim();
        if !restricted.is_empty()
            && restricted.to_lowercase() != buyer_email.trim().to_lowercase()
        {
            return Err(CouponRejection::InvalidEmail);
        }
    }

    let discount_amount = compute_discount(coupon.discount_type, coupon.discount_value, price);
    Ok(CouponQuote {
        coupon_id: coupon.id,
        code: coupon.code.clone(),
        discount_type: coupon.discount_type,
        discount_amount,
        final_price: price.max(0) - discount_amount,
    })
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateCouponInput {
    #[validate(length(min = 3, max = 64))]
    pub code: String,
    pub discount_type: DiscountType,
    #[validate(range(min = 0))]
    pub discount_value: i64,
    pub valid_from: TimestampInput,
    pub valid_until: TimestampInput,
    pub usage_limit: Option<i32>,
    #[validate(email)]
    pub specific_email: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Redemption to append once an order carrying a coupon is paid.
#[derive(Debug, Clone)]
pub struct RedemptionRecord {
    pub coupon_code: String,
    pub order_id: Uuid,
    pub buyer_id: String,
    pub buyer_email: String,
    pub buyer_name: Option<String>,
    pub amount: i64,
    pub discount_applied: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionOutcome {
    Recorded,
    /// A redemption for this order already exists; nothing changed
    AlreadyRecorded,
    /// Logged, but the usage cap was reached by a concurrent redemption
    RecordedOverCap,
}

/// Coupon lookup, pricing and usage accounting.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds an active coupon by case-normalized code
    pub async fn find_active(&self, code: &str) -> Result<Option<CouponModel>, ServiceError> {
        Coupon::find()
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .filter(coupon::Column::IsActive.eq(true))
            .one(&*self.db)
            .await
            .map_err(ServiceError::from)
    }

    /// Validates `code` for a buyer and price without side effects.
    #[instrument(skip(self, buyer_email), fields(coupon_code = %code))]
    pub async fn validate(
        &self,
        code: &str,
        buyer_email: &str,
        price: i64,
    ) -> Result<CouponQuote, ServiceError> {
        self.validate_at(code, buyer_email, price, Utc::now()).await
    }

    pub async fn validate_at(
        &self,
        code: &str,
        buyer_email: &str,
        price: i64,
        now: DateTime<Utc>,
    ) -> Result<CouponQuote, ServiceError> {
        let coupon = self.find_active(code).await?;
        evaluate(coupon.as_ref(), buyer_email, price, now.timestamp_millis()).map_err(|rejection| {
            info!(reason = rejection.code(), "coupon rejected");
            ServiceError::Coupon(rejection)
        })
    }

    #[instrument(skip(self, input), fields(coupon_code = %input.code))]
    pub async fn create_coupon(&self, input: CreateCouponInput) -> Result<CouponModel, ServiceError> {
        input.validate()?;

        if input.discount_type == DiscountType::Percentage && input.discount_value > 100 {
            return Err(ServiceError::ValidationError(
                "percentage discount cannot exceed 100".into(),
            ));
        }
        if matches!(input.usage_limit, Some(limit) if limit < 0) {
            return Err(ServiceError::ValidationError(
                "usage_limit cannot be negative".into(),
            ));
        }
        let from = input
            .valid_from
            .to_epoch_millis()
            .map_err(|e| ServiceError::ValidationError(format!("valid_from: {}", e)))?;
        let until = input
            .valid_until
            .to_epoch_millis()
            .map_err(|e| ServiceError::ValidationError(format!("valid_until: {}", e)))?;
        if from > until {
            return Err(ServiceError::ValidationError(
                "valid_from must not be after valid_until".into(),
            ));
        }

        let code = normalize_code(&input.code);
        if Coupon::find()
            .filter(coupon::Column::Code.eq(code.clone()))
            .one(&*self.db)
            .await?
            .is_some()
        {
            return Err(ServiceError::Conflict(format!("coupon {} already exists", code)));
        }

        let now = Utc::now();
        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code),
            discount_type: Set(input.discount_type),
            discount_value: Set(input.discount_value),
            valid_from: Set(input.valid_from.to_json()),
            valid_until: Set(input.valid_until.to_json()),
            usage_limit: Set(input.usage_limit),
            used_count: Set(0),
            specific_email: Set(input.specific_email.map(|e| e.trim().to_string())),
            is_active: Set(input.is_active),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = model.insert(&*self.db).await?;
        info!(coupon_id = %created.id, "coupon created");
        Ok(created)
    }

    /// Appends the redemption log entry and bumps `used_count`, once per order.
    #[instrument(skip(self, record), fields(order_id = %record.order_id, coupon_code = %record.coupon_code))]
    pub async fn record_redemption(
        &self,
        record: RedemptionRecord,
    ) -> Result<RedemptionOutcome, ServiceError> {
        let code = normalize_code(&record.coupon_code);
        let coupon = Coupon::find()
            .filter(coupon::Column::Code.eq(code.clone()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("coupon {} not found", code)))?;

        let txn = self.db.begin().await?;

        let entry = coupon_redemption::ActiveModel {
            id: Set(Uuid::new_v4()),
            coupon_id: Set(coupon.id),
            order_id: Set(record.order_id),
            buyer_id: Set(record.buyer_id),
            buyer_email: Set(record.buyer_email),
            buyer_name: Set(record.buyer_name),
            amount: Set(record.amount),
            discount_applied: Set(record.discount_applied),
            redeemed_at: Set(Utc::now()),
        };
        if let Err(e) = coupon_redemption::Entity::insert(entry)
            .exec_without_returning(&txn)
            .await
        {
            if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                return Ok(RedemptionOutcome::AlreadyRecorded);
            }
            return Err(e.into());
        }

        let updated = Coupon::update_many()
            .col_expr(
                coupon::Column::UsedCount,
                Expr::col(coupon::Column::UsedCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Id.eq(coupon.id))
            .filter(
                Condition::any()
                    .add(coupon::Column::UsageLimit.is_null())
                    .add(
                        Expr::col(coupon::Column::UsedCount)
                            .lt(Expr::col(coupon::Column::UsageLimit)),
                    ),
            )
            .exec(&txn)
            .await?;

        txn.commit().await?;

        if updated.rows_affected == 0 {
            warn!(coupon_id = %coupon.id, "coupon redeemed after its usage cap was reached");
            counter!("storefront.coupons.over_cap", 1);
            return Ok(RedemptionOutcome::RecordedOverCap);
        }

        counter!("storefront.coupons.redeemed", 1);
        Ok(RedemptionOutcome::Recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    const NOW_MS: i64 = 1_717_200_000_000; // 2024-06-01T00:00:00Z
    const FROM_SECS: i64 = 1_717_200_000 - 86_400;
    const UNTIL_SECS: i64 = 1_717_200_000 + 86_400;

    fn coupon(discount_type: DiscountType, value: i64) -> CouponModel {
        let now = Utc.timestamp_millis_opt(NOW_MS).unwrap();
        CouponModel {
            id: Uuid::new_v4(),
            code: "LAUNCH".to_string(),
            discount_type,
            discount_value: value,
            valid_from: json!(FROM_SECS),
            valid_until: json!(UNTIL_SECS),
            usage_limit: None,
            used_count: 0,
            specific_email: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[rstest]
    #[case(DiscountType::Percentage, 20, 10_000, 2_000)]
    #[case(DiscountType::Percentage, 15, 999, 150)]
    #[case(DiscountType::Percentage, 100, 4_500, 4_500)]
    #[case(DiscountType::Fixed, 500, 10_000, 500)]
    #[case(DiscountType::Fixed, 15_000, 10_000, 10_000)]
    #[case(DiscountType::Fixed, 100, 0, 0)]
    fn discount_is_rounded_and_clamped(
        #[case] discount_type: DiscountType,
        #[case] value: i64,
        #[case] price: i64,
        #[case] expected: i64,
    ) {
        assert_eq!(compute_discount(discount_type, value, price), expected);
    }

    #[test]
    fn fixed_discount_above_price_yields_zero_final_price() {
        let quote = evaluate(
            Some(&coupon(DiscountType::Fixed, 25_000)),
            "a@x.com",
            10_000,
            NOW_MS,
        )
        .unwrap();
        assert_eq!(quote.discount_amount, 10_000);
        assert_eq!(quote.final_price, 0);
    }

    #[test]
    fn missing_or_inactive_coupon_is_invalid() {
        assert_eq!(
            evaluate(None, "a@x.com", 100, NOW_MS),
            Err(CouponRejection::Invalid)
        );
        let mut inactive = coupon(DiscountType::Fixed, 10);
        inactive.is_active = false;
        assert_eq!(
            evaluate(Some(&inactive), "a@x.com", 100, NOW_MS),
            Err(CouponRejection::Invalid)
        );
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let c = coupon(DiscountType::Fixed, 10);
        assert!(evaluate(Some(&c), "a@x.com", 100, FROM_SECS * 1000).is_ok());
        assert!(evaluate(Some(&c), "a@x.com", 100, UNTIL_SECS * 1000).is_ok());
        assert_eq!(
            evaluate(Some(&c), "a@x.com", 100, FROM_SECS * 1000 - 1),
            Err(CouponRejection::Expired)
        );
        assert_eq!(
            evaluate(Some(&c), "a@x.com", 100, UNTIL_SECS * 1000 + 1),
            Err(CouponRejection::Expired)
        );
    }

    #[test]
    fn window_accepts_mixed_timestamp_shapes() {
        let mut c = coupon(DiscountType::Fixed, 10);
        c.valid_from = json!({"seconds": FROM_SECS, "nanoseconds": 0});
        c.valid_until = json!("2024-06-02T00:00:00Z");
        assert!(evaluate(Some(&c), "a@x.com", 100, NOW_MS).is_ok());
    }

    #[test]
    fn unparseable_window_is_invalid_not_guessed() {
        let mut c = coupon(DiscountType::Fixed, 10);
        c.valid_until = json!("sometime next year");
        assert_eq!(
            evaluate(Some(&c), "a@x.com", 100, NOW_MS),
            Err(CouponRejection::Invalid)
        );

        let mut c = coupon(DiscountType::Fixed, 10);
        c.valid_from = serde_json::Value::Null;
        assert_eq!(
            evaluate(Some(&c), "a@x.com", 100, NOW_MS),
            Err(CouponRejection::Invalid)
        );
    }

    #[test]
    fn usage_limit_is_checked_before_email() {
        let mut c = coupon(DiscountType::Fixed, 10);
        c.usage_limit = Some(1);
        c.used_count = 1;
        c.specific_email = Some("a@x.com".into());
        assert_eq!(
            evaluate(Some(&c), "a@x.com", 100, NOW_MS),
            Err(CouponRejection::LimitReached)
        );
        assert_eq!(
            evaluate(Some(&c), "someone@else.com", 100, NOW_MS),
            Err(CouponRejection::LimitReached)
        );
    }

    #[test]
    fn email_restriction_is_case_insensitive() {
        let mut c = coupon(DiscountType::Percentage, 10);
        c.specific_email = Some("a@x.com".into());
        assert!(evaluate(Some(&c), "A@X.com", 100, NOW_MS).is_ok());
        assert_eq!(
            evaluate(Some(&c), "B@X.com", 100, NOW_MS),
            Err(CouponRejection::InvalidEmail)
        );
        assert_eq!(
            evaluate(Some(&c), "c@x.com", 100, NOW_MS),
            Err(CouponRejection::InvalidEmail)
        );
    }

    #[test]
    fn expiry_beats_usage_limit() {
        let mut c = coupon(DiscountType::Fixed, 10);
        c.usage_limit = Some(1);
        c.used_count = 1;
        assert_matches!(
            evaluate(Some(&c), "a@x.com", 100, UNTIL_SECS * 1000 + 5),
            Err(CouponRejection::Expired)
        );
    }

    #[test]
    fn codes_are_case_normalized() {
        assert_eq!(normalize_code("  launch20 "), "LAUNCH20");
    }
}
