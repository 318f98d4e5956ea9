use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::coupon::DiscountType,
    errors::ServiceError,
    ApiResponse, ApiResult, AppState,
};

/// Price comes from the catalog when `template_id` is given, otherwise from `price`.
#[derive(Debug, Deserialize, Validate)]
pub struct VerifyCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(email)]
    pub buyer_email: String,
    #[validate(range(min = 0))]
    pub price: Option<i64>,
    pub template_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct VerifyCouponResponse {
    pub valid: bool,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_amount: i64,
    pub final_price: i64,
}

/// POST /api/v1/coupons/verify
pub async fn verify_coupon(
    State(state): State<AppState>,
    Json(request): Json<VerifyCouponRequest>,
) -> ApiResult<VerifyCouponResponse> {
    request.validate()?;

    let price = match (request.template_id, request.price) {
        (Some(template_id), _) => state.services.catalog.get_purchasable(template_id).await?.price,
        (None, Some(price)) => price,
        (None, None) => {
            return Err(ServiceError::ValidationError(
                "price or template_id is required".into(),
            ))
        }
    };

    let quote = state
        .services
        .coupons
        .validate(&request.code, &request.buyer_email, price)
        .await?;

    Ok(Json(ApiResponse::success(VerifyCouponResponse {
        valid: true,
        code: quote.code,
        discount_type: quote.discount_type,
        discount_amount: quote.discount_amount,
        final_price: quote.final_price,
    })))
}
