// Embedded webhook listener
//
// Receives notifications from the document service and hands them to the
// dispatcher. Rendering dispatch outcomes as HTTP responses happens here.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use docflow_core::{ErrorKind, WebhookDispatcher, EVENT_COMPLETED, EVENT_READY_FOR_REVIEW};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct WebhookState {
    dispatcher: Arc<WebhookDispatcher>,
}

pub fn router(dispatcher: Arc<WebhookDispatcher>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/ready", post(ready_for_review))
        .route("/webhooks/completed", post(completed))
        .with_state(WebhookState { dispatcher })
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn ready_for_review(State(state): State<WebhookState>, body: String) -> Response {
    dispatch(&state, EVENT_READY_FOR_REVIEW, &body)
}

async fn completed(State(state): State<WebhookState>, body: String) -> Response {
    dispatch(&state, EVENT_COMPLETED, &body)
}

fn dispatch(state: &WebhookState, event_type: &str, body: &str) -> Response {
    match state.dispatcher.dispatch(event_type, body) {
        Ok(true) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no handler registered for {event_type}") })),
        )
            .into_response(),
        Err(e) => {
            let status = match e.kind() {
                ErrorKind::MalformedPayload => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(event_type, error = %e, status = status.as_u16(), "webhook rejected");
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Serve the webhook routes on `port` until `shutdown` fires
pub async fn serve(
    dispatcher: Arc<WebhookDispatcher>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webhook listener to {addr}"))?;
    tracing::info!(%addr, "webhook listener started");

    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Webhook listener error")?;

    tracing::info!("webhook listener stopped");
    Ok(())
}
