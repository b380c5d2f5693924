//! API layer -- axum routes, handlers, and error mapping.

mod routes;
pub mod state;

use self::state::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;

use crate::jobs::JobError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Handler error rendered as `{"error": {"message": ...}}`.
#[derive(Debug)]
pub struct ApiError(JobError);

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(JobError::Storage(e))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            JobError::AlreadyRunning(_) | JobError::NotRunning(_) => StatusCode::CONFLICT,
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.0);
        }
        let body = json!({ "error": { "message": self.0.to_string() } });
        (status, Json(body)).into_response()
    }
}
