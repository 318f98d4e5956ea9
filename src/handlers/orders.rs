use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::orders::{
        CheckoutRequest, CheckoutResponse, OrderView, VerifyRequest, VerifyResponse,
    },
    ApiResponse, ApiResult, AppState,
};

/// POST /api/v1/orders
pub async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutResponse>>), ServiceError> {
    let checkout = state
        .services
        .orders
        .checkout(&auth_user.buyer(), request)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(checkout))))
}

/// POST /api/v1/orders/verify
pub async fn verify_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<VerifyResponse> {
    let verified = state
        .services
        .orders
        .verify(&auth_user.buyer(), request)
        .await?;
    let message = verified.message.clone();
    Ok(Json(ApiResponse::success(verified).with_message(message)))
}

/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderView> {
    let order = state
        .services
        .orders
        .get_order(&auth_user.buyer(), order_id)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// GET /api/v1/orders
pub async fn list_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Vec<OrderView>> {
    let orders = state.services.orders.list_orders(&auth_user.buyer()).await?;
    Ok(Json(ApiResponse::success(orders)))
}
