//! Google Gemini streaming driver.
//!
//! Uses `models/{model}:streamGenerateContent?alt=sse`. Each SSE event is a
//! complete `GenerateContentResponse`; its text is the concatenation of the
//! first candidate's parts. Images travel as `inline_data` parts.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::sse::sse_payloads;
use super::{
    status_error, ChunkStream, ModelSelection, Prompt, ProviderError,
    StreamingCompletionProvider, UpstreamChunk,
};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    models: ModelSelection,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, models: ModelSelection) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            models,
        }
    }

    /// Point the driver at another host (proxies, tests).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:streamGenerateContent",
            self.base_url.trim_end_matches('/')
        )
    }

    fn request_body(prompt: &Prompt) -> Value {
        let mut parts = Vec::new();
        if !prompt.text.is_empty() {
            parts.push(json!({ "text": prompt.text }));
        }
        if let Some(image) = &prompt.image {
            parts.push(json!({
                "inline_data": {
                    "mime_type": image.mime_type,
                    "data": image.data,
                }
            }));
        }

        json!({
            "contents": [{ "role": "user", "parts": parts }],
        })
    }
}

#[async_trait]
impl StreamingCompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn models(&self) -> &ModelSelection {
        &self.models
    }

    async fn stream(&self, prompt: Prompt) -> Result<ChunkStream, ProviderError> {
        debug!(model = %prompt.model, image = prompt.image.is_some(), "Calling Gemini");

        let response = self
            .client
            .post(self.endpoint(&prompt.model))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::request_body(&prompt))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let chunks = sse_payloads(response.bytes_stream())
            .map(|payload| payload.and_then(|p| parse_chunk(&p)));
        Ok(Box::pin(chunks))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Normalize one `GenerateContentResponse` event into a chunk.
pub(crate) fn parse_chunk(payload: &str) -> Result<UpstreamChunk, ProviderError> {
    let response: GenerateContentResponse =
        serde_json::from_str(payload).map_err(|e| ProviderError::Decode(e.to_string()))?;

    if let Some(error) = response.error {
        return Err(ProviderError::Upstream(error.message));
    }

    let text = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default();

    Ok(UpstreamChunk { text })
}
