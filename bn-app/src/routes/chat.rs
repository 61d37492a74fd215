//! Local chat endpoint. Same pipeline as a channel message, minus the allow-list: the
//! server only binds to loopback.

use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChatRequest {
    user_id: String,
    message: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/chat", post(chat))
}

#[tracing::instrument(level = "info", skip_all)]
async fn chat(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if req.user_id.trim().is_empty() || req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "status": "error",
                "error": "user_id and message must be non-empty",
            })),
        );
    }

    let reply = state.handler.handle(&req.message, req.user_id.trim()).await;
    let pending = state.sessions().has_pending(req.user_id.trim());
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "reply": reply,
            "awaiting_approval": pending,
        })),
    )
}

#[cfg(test)]
mod tests {
    use crate::locale::Locale;
    use crate::server::{AppState, app_router};
    use crate::testing::scripted_handler;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Instant;
    use tower::util::ServiceExt;

    fn app(plan: Value) -> axum::Router {
        app_router(Arc::new(AppState {
            handler: scripted_handler(Locale::En, plan, "Paris."),
            locale: Locale::En,
            started_at: Instant::now(),
            channels: Vec::new(),
        }))
    }

    async fn post_chat(app: axum::Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        (status, serde_json::from_slice(&body).expect("response json"))
    }

    #[tokio::test]
    async fn chat_returns_the_reply() {
        let (status, body) = post_chat(
            app(json!({ "autonomy_level": 0 })),
            json!({ "user_id": "u1", "message": "capital of France?" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], "Paris.");
        assert_eq!(body["awaiting_approval"], false);
    }

    #[tokio::test]
    async fn chat_reports_a_pending_approval() {
        let (_, body) = post_chat(
            app(json!({ "autonomy_level": 3 })),
            json!({ "user_id": "u1", "message": "refactor my repo" }),
        )
        .await;
        assert_eq!(body["awaiting_approval"], true);
        assert!(body["reply"].as_str().unwrap().starts_with("Approval required"));
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let (status, body) = post_chat(
            app(json!({})),
            json!({ "user_id": "u1", "message": "   " }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }
}
