//! OpenAI-compatible chat-completions streaming driver.
//!
//! Works against api.openai.com and the many gateways that mimic it. The
//! stream is a sequence of `chat.completion.chunk` events terminated by
//! `data: [DONE]`.

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

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DONE_MARKER: &str = "[DONE]";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    models: ModelSelection,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, models: ModelSelection) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            models,
        }
    }

    /// Base URL including the version segment, e.g. `https://api.openai.com/v1`.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(prompt: &Prompt) -> Value {
        // Plain string content keeps text-only requests valid on gateways
        // that do not understand content arrays.
        let content = match &prompt.image {
            None => json!(prompt.text),
            Some(image) => {
                let mut parts = Vec::new();
                if !prompt.text.is_empty() {
                    parts.push(json!({ "type": "text", "text": prompt.text }));
                }
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", image.mime_type, image.data),
                    }
                }));
                Value::Array(parts)
            }
        };

        json!({
            "model": prompt.model,
            "stream": true,
            "messages": [{ "role": "user", "content": content }],
        })
    }
}

#[async_trait]
impl StreamingCompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn models(&self) -> &ModelSelection {
        &self.models
    }

    async fn stream(&self, prompt: Prompt) -> Result<ChunkStream, ProviderError> {
        debug!(model = %prompt.model, image = prompt.image.is_some(), "Calling OpenAI-compatible endpoint");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(&prompt))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let payloads = sse_payloads(response.bytes_stream());
        let chunks = async_stream::stream! {
            let mut payloads = std::pin::pin!(payloads);
            while let Some(payload) = payloads.next().await {
                let chunk = match payload {
                    Ok(p) if p.trim() == DONE_MARKER => return,
                    Ok(p) => parse_chunk(&p),
                    Err(e) => Err(e),
                };
                let failed = chunk.is_err();
                yield chunk;
                if failed {
                    return;
                }
            }
            // Without the marker the reply may have been cut off.
            yield Err(ProviderError::Stream(format!("stream ended before {DONE_MARKER}")));
        };
        Ok(Box::pin(chunks))
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Normalize one `chat.completion.chunk` event into a chunk.
pub(crate) fn parse_chunk(payload: &str) -> Result<UpstreamChunk, ProviderError> {
    let chunk: CompletionChunk =
        serde_json::from_str(payload).map_err(|e| ProviderError::Decode(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Upstream(error.message));
    }

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .unwrap_or_default();

    Ok(UpstreamChunk { text })
}
