//! Sync control endpoints.
//!
//! Provides:
//! - GET /api/sync/status - Active run progress and the last report
//! - POST /api/sync - Start a run in the background
//! - POST /api/sync/cancel - Stop the active run at the next message

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tracing::{Instrument, error, info, info_span};

use mailvault_core::{SyncError, SyncRequest};

use super::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(start_sync))
        .route("/status", get(sync_status))
        .route("/cancel", post(cancel_sync))
}

#[derive(Debug, Serialize)]
struct SyncStarted {
    run_id: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

/// GET /api/sync/status
async fn sync_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.sync.status()))
}

/// POST /api/sync
///
/// Claims the run slot synchronously so a second request gets 409, then runs
/// the sync on a background task.
async fn start_sync(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> impl IntoResponse {
    let guard = match state.sync.begin(&request) {
        Ok(guard) => guard,
        Err(SyncError::AlreadyRunning { run_id }) => {
            return ApiError::conflict(format!("sync run {run_id} is already in progress"))
                .respond(StatusCode::CONFLICT);
        }
        Err(e) => {
            return ApiError::internal(e.to_string()).respond(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let run_id = guard.run_id().to_string();
    info!(run_id = %run_id, provider = %request.provider, "sync requested");
    let ctx = state.sync.clone();
    let span = info_span!("sync_task", run_id = %run_id);
    tokio::spawn(
        async move {
            match ctx.run_guarded(guard, request).await {
                Ok(report) => info!(
                    downloaded = report.downloaded,
                    failed = report.failed,
                    cancelled = report.cancelled,
                    "sync finished"
                ),
                Err(e) => error!(error = %e, "sync failed"),
            }
        }
        .instrument(span),
    );

    (StatusCode::ACCEPTED, Json(SyncStarted { run_id })).into_response()
}

/// POST /api/sync/cancel
async fn cancel_sync(State(state): State<AppState>) -> impl IntoResponse {
    if state.sync.cancel() {
        (StatusCode::ACCEPTED, Json(CancelResponse { cancelled: true })).into_response()
    } else {
        ApiError::conflict("no sync run is in progress").respond(StatusCode::CONFLICT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use mailvault_core::Provider;
    use serde_json::{Value, json};
    use std::time::Duration;

    use crate::test_support;

    async fn body_json(response: axum::response::Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn start_sync_runs_in_background_and_reports_status() {
        let (state, _dir) = test_support::state().await;

        let (status, body) = body_json(
            start_sync(State(state.clone()), Json(SyncRequest::new(Provider::Gmail)))
                .await
                .into_response(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = body["run_id"].as_str().expect("run id").to_string();

        let mut report = None;
        for _ in 0..100 {
            let status = state.sync.status();
            if !status.running {
                report = status.last_report;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let report = report.expect("run finished with a report");
        assert_eq!(report.run_id, run_id);
        assert_eq!(report.candidates, 0);
    }

    #[tokio::test]
    async fn start_sync_conflicts_while_a_run_holds_the_slot() {
        let (state, _dir) = test_support::state().await;
        let request = SyncRequest::new(Provider::Gmail);
        let guard = state.sync.begin(&request).expect("claim slot");

        let (status, body) = body_json(
            start_sync(State(state.clone()), Json(request))
                .await
                .into_response(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("conflict"));
        assert!(
            body["message"]
                .as_str()
                .unwrap_or_default()
                .contains(guard.run_id())
        );

        let (_, body) = body_json(sync_status(State(state)).await.into_response()).await;
        assert_eq!(body["running"], json!(true));
        assert_eq!(body["current"]["run_id"], json!(guard.run_id()));
    }

    #[tokio::test]
    async fn cancel_requires_an_active_run() {
        let (state, _dir) = test_support::state().await;

        let (status, _) = body_json(cancel_sync(State(state.clone())).await.into_response()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let guard = state
            .sync
            .begin(&SyncRequest::new(Provider::Gmail))
            .expect("claim slot");
        let (status, body) = body_json(cancel_sync(State(state)).await.into_response()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["cancelled"], json!(true));
        assert!(guard.is_cancelled());
    }
}
