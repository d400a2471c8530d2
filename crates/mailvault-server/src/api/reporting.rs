//! Read-only archive reporting.
//!
//! Provides:
//! - GET /api/stats - Archive totals, category and provider breakdowns
//! - GET /api/ai-stats - Classification/extraction status counts
//! - GET /api/messages - Paginated, filterable message listing

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;

use mailvault_core::{MessageQuery, Provider};

use super::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/ai-stats", get(ai_stats))
        .route("/messages", get(list_messages))
}

/// GET /api/stats
async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.messages().stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to compute archive stats");
            ApiError::internal(format!("Failed to compute stats: {e}"))
                .respond(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/ai-stats
async fn ai_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.messages().ai_stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to compute AI stats");
            ApiError::internal(format!("Failed to compute AI stats: {e}"))
                .respond(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    limit: Option<u32>,
    offset: Option<u32>,
    /// Substring of subject or sender.
    q: Option<String>,
    category: Option<String>,
    provider: Option<String>,
}

impl ListParams {
    fn into_query(self) -> Result<MessageQuery, ApiError> {
        let provider = match self.provider.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<Provider>()
                    .map_err(|e| ApiError::bad_request(e.to_string()))?,
            ),
        };
        Ok(MessageQuery {
            limit: self.limit,
            offset: self.offset,
            search: self.q,
            category: self.category.map(|c| c.trim().to_lowercase()),
            provider,
        })
    }
}

/// GET /api/messages
///
/// Query parameters:
/// - limit: Items per page (default 50, max 200)
/// - offset: Pagination offset
/// - q: Search subject and sender
/// - category: Classification category
/// - provider: gmail or m365
async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let query = match params.into_query() {
        Ok(query) => query,
        Err(err) => return err.respond(StatusCode::BAD_REQUEST),
    };

    match state.store.messages().list(&query).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list messages");
            ApiError::internal(format!("Failed to list messages: {e}"))
                .respond(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
