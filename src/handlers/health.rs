use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::time::Instant;
use tracing::warn;

use crate::{db, AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: &'static str,
    pub database: ComponentStatus,
    pub database_latency_ms: u128,
    pub payments_enabled: bool,
    pub timestamp: String,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let database = match db::check_connection(&state.db).await {
        Ok(()) => ComponentStatus::Up,
        Err(e) => {
            warn!(error = %e, "database health check failed");
            ComponentStatus::Down
        }
    };

    let status_code = if database == ComponentStatus::Up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: database,
            version: env!("CARGO_PKG_VERSION"),
            database,
            database_latency_ms: started.elapsed().as_millis(),
            payments_enabled: state.config.payments_enabled,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}
