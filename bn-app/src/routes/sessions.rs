use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{delete, get, post};
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/{user_id}/kill", post(kill_session))
        .route("/api/v1/sessions/{user_id}/window", delete(clear_window))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "sessions": state.sessions().summaries() }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn kill_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    let report = state.sessions().kill(&user_id);
    tracing::info!(%user_id, cancelled_runs = report.cancelled_runs, "kill requested over http");
    Json(serde_json::json!({
        "status": if report.stopped_anything() { "stopped" } else { "idle" },
        "cancelled_runs": report.cancelled_runs,
        "dropped_pending": report.dropped_pending,
    }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn clear_window(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    state.sessions().clear_window(&user_id);
    tracing::info!(%user_id, "conversation window cleared");
    Json(serde_json::json!({ "status": "ok" }))
}
