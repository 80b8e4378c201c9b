//! Chat relay HTTP API.
//!
//! - POST /chat
//! - GET /health
//! - GET /metrics
//! - everything else: static files from the configured public directory

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::provider::{ImagePayload, ModelSelection, Prompt, SharedProvider};
use crate::server::error::{RelayError, MESSAGE_REQUIRED};
use crate::server::metrics::{Outcome, RelayMetrics};
use crate::server::streaming::{relay_events, sse_response, start_relay, RelayGuard};

/// Application state shared across handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: SharedProvider,
    pub metrics: RelayMetrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, provider: SharedProvider, metrics: RelayMetrics) -> Self {
        Self {
            config,
            provider,
            metrics,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all routes and layers.
pub fn build_router(state: Arc<AppState>) -> Router {
    let static_files = ServeDir::new(&state.config.server.public_dir);
    let max_body_bytes = state.config.server.max_body_bytes;

    Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback_service(static_files)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Body of `POST /chat`.
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image: Option<ImagePayload>,
}

impl ChatRequest {
    /// Validate the request and pick the model for it.
    pub fn into_prompt(self, models: &ModelSelection) -> Result<Prompt, RelayError> {
        let text = self.message.unwrap_or_default();
        let image = self.image.filter(|image| !image.data.is_empty());

        if text.is_empty() && image.is_none() {
            return Err(RelayError::BadRequest(MESSAGE_REQUIRED.to_string()));
        }

        Ok(Prompt {
            model: models.select(image.is_some()).to_string(),
            text,
            image,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub provider: String,
    pub uptime_secs: u64,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, RelayError> {
    let request_id = Uuid::new_v4().to_string();

    let request = match payload {
        Ok(Json(req)) => Ok(req),
        // A body that is not declared as JSON is not read at all.
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(ChatRequest::default()),
        Err(rejection) => Err(RelayError::from(rejection)),
    };

    let prompt = match request.and_then(|req| req.into_prompt(state.provider.models())) {
        Ok(prompt) => prompt,
        Err(e) => {
            info!(request_id, "Rejected chat request: {e}");
            state.metrics.record_outcome(Outcome::BadRequest);
            return Err(e);
        }
    };

    info!(
        request_id,
        provider = state.provider.name(),
        model = prompt.model,
        image = prompt.image.is_some(),
        "Chat request"
    );

    // Dropped with this future if the client leaves while we wait upstream.
    let mut guard = RelayGuard::new(request_id, state.metrics.clone());

    let timeout = state.config.server.request_timeout();
    let deadline = tokio::time::Instant::now() + timeout;

    let primed = match start_relay(state.provider.as_ref(), prompt, deadline, timeout).await {
        Ok(primed) => primed,
        Err(e) => {
            error!(request_id = guard.request_id(), "Error in /chat endpoint: {e}");
            state.metrics.record_upstream_error();
            guard.finish(Outcome::Rejected);
            return Err(e);
        }
    };

    let events = relay_events(primed, guard);
    Ok(sse_response(events))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        provider: state.provider.name().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models() -> ModelSelection {
        ModelSelection::new("text-model", "vision-model")
    }

    #[test]
    fn test_text_only_selects_text_model() {
        let req: ChatRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        let prompt = req.into_prompt(&models()).unwrap();
        assert_eq!(prompt.model, "text-model");
        assert_eq!(prompt.text, "hi");
        assert!(prompt.image.is_none());
    }

    #[test]
    fn test_image_selects_vision_model() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"message": "what is it", "image": {"mimeType": "image/png", "data": "iVBOR"}}"#,
        )
        .unwrap();
        let prompt = req.into_prompt(&models()).unwrap();
        assert_eq!(prompt.model, "vision-model");
    }

    #[test]
    fn test_image_without_message_is_accepted() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"image": {"mimeType": "image/png", "data": "iVBOR"}}"#)
                .unwrap();
        let prompt = req.into_prompt(&models()).unwrap();
        assert_eq!(prompt.model, "vision-model");
        assert_eq!(prompt.text, "");
    }

    #[test]
    fn test_missing_message_and_image_rejected() {
        for body in [
            r#"{}"#,
            r#"{"message": ""}"#,
            r#"{"message": null}"#,
            r#"{"image": {"mimeType": "image/png", "data": ""}}"#,
        ] {
            let req: ChatRequest = serde_json::from_str(body).unwrap();
            assert!(
                matches!(req.into_prompt(&models()), Err(RelayError::BadRequest(m)) if m == MESSAGE_REQUIRED),
                "body {body} should be rejected"
            );
        }
    }
}
