use axum::{extract::State, Json};
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    events::Event,
    services::download_tokens::RedeemedDownload,
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize)]
pub struct RedeemDownloadRequest {
    pub token: String,
}

/// POST /api/v1/downloads/redeem
pub async fn redeem_download(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<RedeemDownloadRequest>,
) -> ApiResult<RedeemedDownload> {
    let token = request.token.trim();
    if token.is_empty() {
        return Err(ServiceError::ValidationError("token is required".into()));
    }

    let redeemed = state
        .services
        .downloads
        .redeem(token, &auth_user.user_id)
        .await?;

    if redeemed.first_use {
        let event = Event::DownloadRedeemed {
            order_id: redeemed.order_id,
            template_id: redeemed.template_id,
        };
        state.event_sender.publish(event);
    }

    Ok(Json(ApiResponse::success(redeemed)))
}
