//! chat-relay: streaming chat relay for hosted LLMs.
//!
//! Accepts a chat message (optionally with an inline image), forwards it to
//! a Google Gemini or OpenAI-compatible endpoint, and relays the generated
//! text back to the caller as server-sent events, one frame per upstream
//! chunk.

pub mod config;
pub mod provider;
pub mod server;
