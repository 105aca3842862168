use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub credentials: String,
    pub model: String,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let credentials_ok = state.config.api_key().is_ok();
    if !credentials_ok {
        tracing::error!("Readiness check: API key missing");
    }

    let status_code = if credentials_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if credentials_ok { "ready" } else { "unready" }.to_string(),
            credentials: if credentials_ok { "ok" } else { "missing" }.to_string(),
            model: state.config.model.clone(),
        }),
    )
}
