//! Generation backend capability interface.
//!
//! A backend is selected by configuration; additional providers implement
//! this trait without touching the worker.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::pipeline::messages::SentenceChunk;

/// One message in the prompt sent to the model.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// A completed batch generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub tokens_used: u64,
}

/// A language-model inference backend.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether [`LlmBackend::generate_streaming`] is implemented; the
    /// worker falls back to batch generation otherwise.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Single blocking generation call.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend call fails.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Generation>;

    /// Stream sentence chunks into `tx` as the model generates.
    ///
    /// Implementations must send exactly one chunk with `is_final = true`,
    /// carrying the completion token count; the final chunk may hold a
    /// trailing text fragment or be empty.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend call fails mid-stream.
    async fn generate_streaming(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
        tx: mpsc::Sender<SentenceChunk>,
    ) -> Result<()>;

    /// Whether the backend is reachable and the model is available.
    async fn health_check(&self) -> bool;

    /// Release backend resources.
    async fn close(&self) {}
}
