//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::detect::DetectError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn fallback() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "not found".to_string())
}

fn error_response(status: StatusCode, kind: &str, message: String) -> Response {
    (status, Json(json!({ "error": { "kind": kind, "message": message } }))).into_response()
}

/// Request-level failure rendered as `{"error": {"kind", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub DetectError);

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            DetectError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DetectError::DetectorUnavailable { .. } | DetectError::InsufficientData { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            DetectError::Computation { .. } | DetectError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.0.kind(), self.0.to_string())
    }
}
