use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use sluice_core::ReplicaId;
use sluice_telemetry::metrics::{ADMISSION_DENIED, ADMISSION_ERRORS, ADMISSION_GRANTED};
use sluice_telemetry::MetricsRecorder;

use crate::admission::Admission;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<dyn Admission>,
    pub metrics: Arc<MetricsRecorder>,
    pub replica: ReplicaId,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResult {
    pub message: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_capacity: Option<String>,
}

impl SendMessageResult {
    fn failure(message: impl Into<String>) -> Self {
        Self { message: message.into(), success: false, bucket_capacity: None }
    }
}

pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded.";

/// `GET /`
pub async fn home(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": format!("Welcome to the Rate Limiting API. Served by replica: {}", state.replica),
    }))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    match state.admission.available_tokens().await {
        Ok(available) => Json(serde_json::json!({
            "status": "healthy",
            "availableTokens": available,
            "capacity": state.admission.capacity(),
            "scope": state.admission.scope(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unhealthy", "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `POST /messages`: one token per request.
pub async fn send_message(
    State(state): State<AppState>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> (StatusCode, Json<SendMessageResult>) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "malformed message request");
            state.metrics.counter_inc(ADMISSION_ERRORS, 1);
            return (StatusCode::BAD_REQUEST, Json(SendMessageResult::failure(rejection.body_text())));
        }
    };
    info!(message = %request.message, "received message");

    let granted = match state.admission.try_consume(1).await {
        Ok(granted) => granted,
        Err(e) => return internal_error(&state, e),
    };
    if !granted {
        state.metrics.counter_inc(ADMISSION_DENIED, 1);
        warn!(replica = %state.replica, "rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, Json(SendMessageResult::failure(RATE_LIMIT_EXCEEDED)));
    }

    let remaining = match state.admission.available_tokens().await {
        Ok(n) => n,
        Err(e) => return internal_error(&state, e),
    };
    state.metrics.counter_inc(ADMISSION_GRANTED, 1);
    info!(remaining, replica = %state.replica, "message admitted");
    (
        StatusCode::OK,
        Json(SendMessageResult {
            message: request.message,
            success: true,
            bucket_capacity: Some(format!(
                "{remaining} tokens remaining, Served by replica: {}",
                state.replica
            )),
        }),
    )
}

fn internal_error(state: &AppState, e: impl std::fmt::Display) -> (StatusCode, Json<SendMessageResult>) {
    error!(error = %e, "admission failed");
    state.metrics.counter_inc(ADMISSION_ERRORS, 1);
    (StatusCode::BAD_REQUEST, Json(SendMessageResult::failure(e.to_string())))
}
