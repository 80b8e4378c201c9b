//! Upstream LLM providers.
//!
//! - [`gemini`]: Google Generative Language API (`streamGenerateContent`)
//! - [`openai`]: OpenAI-compatible `/chat/completions`
//! - [`sse`]: Decoder for the event streams both vendors answer with
//!
//! The relay only ever talks to a [`StreamingCompletionProvider`]; vendor
//! request and response shapes stay inside the concrete implementations.

pub mod gemini;
pub mod openai;
pub mod sse;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{Config, ConfigError, ProviderKind};

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed upstream payload: {0}")]
    Decode(String),

    #[error("upstream reported an error: {0}")]
    Upstream(String),

    #[error("stream read error: {0}")]
    Stream(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One incremental unit of generated text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamChunk {
    pub text: String,
}

impl UpstreamChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Inline image attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    #[serde(rename = "mimeType")]
    pub mime_type: String,

    /// Base64-encoded image bytes.
    pub data: String,
}

/// What the relay hands to a provider once the model has been chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub model: String,
    pub text: String,
    pub image: Option<ImagePayload>,
}

/// Text-only and vision-capable model names for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub text_model: String,
    pub vision_model: String,
}

impl ModelSelection {
    pub fn new(text_model: impl Into<String>, vision_model: impl Into<String>) -> Self {
        Self {
            text_model: text_model.into(),
            vision_model: vision_model.into(),
        }
    }

    pub fn select(&self, has_image: bool) -> &str {
        if has_image {
            &self.vision_model
        } else {
            &self.text_model
        }
    }
}

/// Lazily produced chunks of one upstream completion.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<UpstreamChunk, ProviderError>> + Send>>;

/// A vendor client able to stream a completion for a single prompt.
///
/// `stream` resolves once the upstream accepted the request; chunks then
/// arrive through the returned stream in generation order. Dropping the
/// stream abandons the upstream call.
#[async_trait]
pub trait StreamingCompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn models(&self) -> &ModelSelection;

    async fn stream(&self, prompt: Prompt) -> Result<ChunkStream, ProviderError>;
}

pub type SharedProvider = Arc<dyn StreamingCompletionProvider>;

/// Build the provider selected by `config`.
pub fn from_config(config: &Config) -> Result<SharedProvider, ProviderError> {
    let api_key = config.api_key()?.to_string();
    let client = reqwest::Client::builder().build()?;

    let provider: SharedProvider = match config.provider {
        ProviderKind::Gemini => Arc::new(
            GeminiProvider::new(
                client,
                api_key,
                ModelSelection::new(&config.gemini.text_model, &config.gemini.vision_model),
            )
            .base_url(&config.gemini.base_url),
        ),
        ProviderKind::OpenAi => Arc::new(
            OpenAiProvider::new(
                client,
                api_key,
                ModelSelection::new(&config.openai.text_model, &config.openai.vision_model),
            )
            .base_url(&config.openai.base_url),
        ),
    };
    Ok(provider)
}

/// Read an error body for diagnostics without failing the caller twice.
pub(crate) async fn status_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Status { status, body }
}
