use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::coupons::CouponRejection;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Bad Request")
    pub error: String,
    /// Stable machine-readable code, e.g. `COUPON_EXPIRED`
    pub code: String,
    /// Buyer-safe description; never carries internal details
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Template {0} not found")]
    TemplateNotFound(Uuid),

    #[error("Template {0} is not available for purchase")]
    TemplateUnavailable(Uuid),

    #[error("Template {0} is out of stock")]
    OutOfStock(Uuid),

    #[error("{}", .0.message())]
    Coupon(CouponRejection),

    #[error("Too many pending orders, try again later")]
    VelocityLimitExceeded,

    #[error("Payments are currently disabled")]
    PaymentsDisabled,

    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    #[error("Payment has not been confirmed yet")]
    PaymentNotConfirmed,

    #[error("Order {0} has already been processed")]
    OrderAlreadyProcessed(Uuid),

    #[error("Download link has expired")]
    DownloadExpired,

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<CouponRejection> for ServiceError {
    fn from(rejection: CouponRejection) -> Self {
        ServiceError::Coupon(rejection)
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::TemplateNotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::TemplateUnavailable(_)
            | Self::OutOfStock(_)
            | Self::Coupon(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::VelocityLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::PaymentsDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::PaymentNotConfirmed => StatusCode::PAYMENT_REQUIRED,
            Self::Conflict(_) | Self::OrderAlreadyProcessed(_) => StatusCode::CONFLICT,
            Self::DownloadExpired => StatusCode::GONE,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_)
            | Self::GatewayError(_)
            | Self::IntegrityViolation(_)
            | Self::ConfigurationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            Self::TemplateUnavailable(_) => "TEMPLATE_UNAVAILABLE",
            Self::OutOfStock(_) => "OUT_OF_STOCK",
            Self::Coupon(rejection) => rejection.code(),
            Self::VelocityLimitExceeded => "VELOCITY_LIMIT_EXCEEDED",
            Self::PaymentsDisabled => "PAYMENTS_DISABLED",
            Self::GatewayError(_) => "GATEWAY_ERROR",
            Self::PaymentNotConfirmed => "PAYMENT_NOT_CONFIRMED",
            Self::OrderAlreadyProcessed(_) => "ORDER_ALREADY_PROCESSED",
            Self::DownloadExpired => "DOWNLOAD_EXPIRED",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
            Self::ConfigurationError(_) => "CONFIGURATION_ERROR",
            Self::IntegrityViolation(_) | Self::InternalError(_) | Self::Other(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_)
            | Self::IntegrityViolation(_)
            | Self::InternalError(_)
            | Self::ExternalServiceError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::ConfigurationError(_) => {
                "The store is temporarily unable to process this request".to_string()
            }
            Self::GatewayError(_) => {
                "The payment provider could not be reached, please try again".to_string()
            }
            Self::InvalidSignature(_) => "Invalid signature".to_string(),
            Self::PaymentNotConfirmed => {
                "Payment has not been confirmed yet, please retry shortly".to_string()
            }
            Self::OrderAlreadyProcessed(_) => {
                "This order can no longer be paid".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn service_error_response_includes_request_id_and_code() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::Coupon(CouponRejection::Expired).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, "COUPON_EXPIRED");
    }

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::TemplateNotFound(Uuid::nil()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::OutOfStock(Uuid::nil()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::VelocityLimitExceeded.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ServiceError::PaymentsDisabled.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::GatewayError("timeout".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::OrderAlreadyProcessed(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::PaymentNotConfirmed.status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::GatewayError("key_secret rejected by api.example".into())
                .response_message(),
            "The payment provider could not be reached, please try again"
        );
        assert_eq!(
            ServiceError::ConfigurationError("razorpay_key_secret missing".into())
                .response_message(),
            "The store is temporarily unable to process this request"
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("disk I/O".into())).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::NotFound("Order not found".into()).response_message(),
            "Not found: Order not found"
        );
    }

    #[test]
    fn coupon_rejections_keep_distinct_codes() {
        assert_eq!(
            ServiceError::from(CouponRejection::LimitReached).code(),
            "COUPON_LIMIT_REACHED"
        );
        assert_eq!(
            ServiceError::from(CouponRejection::InvalidEmail).code(),
            "COUPON_INVALID_EMAIL"
        );
    }
}
