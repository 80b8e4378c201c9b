//! Per-request failure taxonomy and its HTTP rendering.

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::provider::ProviderError;

pub const MESSAGE_REQUIRED: &str = "Message is required";

const INTERNAL_SERVER_ERROR: &str = "Internal Server Error";

#[derive(Error, Debug)]
pub enum RelayError {
    /// Required input missing; nothing was sent upstream.
    #[error("{0}")]
    BadRequest(String),

    /// Body could not be read or parsed as a chat request.
    #[error("{0}")]
    InvalidBody(#[from] JsonRejection),

    #[error("upstream failure: {0}")]
    Upstream(#[from] ProviderError),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::BadRequest(_) | RelayError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream(_) | RelayError::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            RelayError::BadRequest(message) => {
                (status, Json(json!({ "error": message }))).into_response()
            }
            RelayError::InvalidBody(rejection) => {
                (status, Json(json!({ "error": rejection.body_text() }))).into_response()
            }
            // Upstream details stay in the server log.
            RelayError::Upstream(_) | RelayError::Timeout(_) => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                INTERNAL_SERVER_ERROR,
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upstream_failure_is_plain_text_500() {
        let response =
            RelayError::Upstream(ProviderError::Stream("reset".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Internal Server Error");
    }

    #[tokio::test]
    async fn test_bad_request_is_json_400() {
        let response = RelayError::BadRequest(MESSAGE_REQUIRED.to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({ "error": "Message is required" }));
    }
}
