use axum::{extract::State, http::StatusCode, Json};

use crate::{
    auth::AuthUser,
    entities::{coupon::Model as CouponModel, template::Model as TemplateModel},
    errors::ServiceError,
    services::{catalog::CreateTemplateInput, coupons::CreateCouponInput},
    ApiResponse, AppState,
};

/// POST /api/v1/admin/coupons
pub async fn create_coupon(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(input): Json<CreateCouponInput>,
) -> Result<(StatusCode, Json<ApiResponse<CouponModel>>), ServiceError> {
    auth_user.require_admin()?;
    let coupon = state.services.coupons.create_coupon(input).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(coupon))))
}

/// POST /api/v1/admin/templates
pub async fn create_template(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(input): Json<CreateTemplateInput>,
) -> Result<(StatusCode, Json<ApiResponse<TemplateModel>>), ServiceError> {
    auth_user.require_admin()?;
    let template = state.services.catalog.create_template(input).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(template))))
}
