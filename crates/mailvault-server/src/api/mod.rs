//! HTTP API for the dashboard.
//!
//! - Archive reporting: stats, AI status counts, paginated message listing
//! - Sync control: status, trigger, cancel

pub mod reporting;
pub mod sync;

use axum::{Json, Router, http::StatusCode, response::IntoResponse, response::Response};
use serde::Serialize;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(reporting::router())
        .nest("/sync", sync::router())
}

/// Error body shared by every endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message)
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    pub(crate) fn respond(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}
