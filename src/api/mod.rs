//! Administrative HTTP surface and the stream transport endpoints.

mod instances;
mod mcp;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::{ErrorCategory, HubError};
use crate::instance::InstanceManager;
use crate::logging::LogBuffer;

/// Shared state handed to every handler.
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub logs: Arc<LogBuffer>,
}

impl AppState {
    pub fn new(manager: Arc<InstanceManager>, logs: Arc<LogBuffer>) -> Self {
        Self { manager, logs }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/instances",
            get(instances::list).post(instances::create),
        )
        .route(
            "/api/instances/{id}",
            get(instances::get_one)
                .put(instances::update)
                .delete(instances::delete),
        )
        .route("/api/instances/{id}/start", post(instances::start))
        .route("/api/instances/{id}/stop", post(instances::stop))
        .route("/api/instances/{id}/restart", post(instances::restart))
        .route(
            "/api/instances/{id}/nodes",
            get(instances::nodes).put(instances::replace_nodes),
        )
        .route("/api/instances/{id}/tools", get(instances::tools))
        .route(
            "/api/instances/{id}/logs",
            get(instances::logs).delete(instances::clear_logs),
        )
        .route("/api/mcp/{id}/sse", get(mcp::open_stream))
        .route("/api/mcp/{id}/messages", post(mcp::post_message))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Handler error rendered as `{ "error": message }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<HubError> for ApiError {
    fn from(error: HubError) -> Self {
        let status = match error.category() {
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::Upstream => StatusCode::BAD_GATEWAY,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(%error, "request failed");
        }
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
