//! Ollama backend for local model inference.
//!
//! Drives the Ollama `/api/chat` endpoint with streaming enabled; response
//! lines are newline-delimited JSON chunks. The HTTP stream runs in its own
//! task feeding a token channel, and the consumer side finds sentence
//! boundaries incrementally so the first sentence reaches synthesis while
//! the model is still generating the rest.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::LlmSettings;
use crate::error::{PipelineError, Result};
use crate::llm::backend::{ChatMessage, Generation, LlmBackend};
use crate::llm::sentence::SentenceSplitter;
use crate::pipeline::messages::SentenceChunk;

/// Operation deadline for a generation call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connect deadline for the backend socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for pulling a missing model; downloads can take a while.
const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Token channel depth between the HTTP task and the splitter loop.
const TOKEN_CHANNEL_SIZE: usize = 64;

pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

/// One NDJSON line from `/api/chat`.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    #[serde(default)]
    name: String,
}

impl OllamaBackend {
    /// Build the backend client from worker settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Llm(format!("http client: {e}")))?;

        info!(url = %settings.ollama_url, model = %settings.llm_model, "ollama_configured");

        Ok(Self {
            client,
            base_url: settings.ollama_url.trim_end_matches('/').to_owned(),
            model: settings.llm_model.clone(),
        })
    }

    /// Spawn the HTTP streaming task; content deltas arrive on the returned
    /// channel and the task resolves to the completion token count.
    fn spawn_chat_stream(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> (
        mpsc::Receiver<String>,
        tokio::task::JoinHandle<Result<u64>>,
    ) {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages.iter().map(|m| serde_json::json!({
                "role": m.role,
                "content": m.content,
            })).collect::<Vec<_>>(),
            "stream": true,
            "options": {
                "num_predict": max_tokens,
                "temperature": temperature,
            },
        });

        let client = self.client.clone();
        let url = format!("{}/api/chat", self.base_url);
        let (delta_tx, delta_rx) = mpsc::channel::<String>(TOKEN_CHANNEL_SIZE);

        let handle = tokio::spawn(async move {
            let response = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| PipelineError::Llm(format!("chat request failed: {e}")))?
                .error_for_status()
                .map_err(|e| PipelineError::Llm(format!("chat status: {e}")))?;

            let started = Instant::now();
            let mut first_token_seen = false;
            let mut pending: Vec<u8> = Vec::new();
            let mut stream = response.bytes_stream();

            // Feed one NDJSON line to the channel; the outcome says whether
            // the stream reported completion.
            async fn process_line(
                line: &[u8],
                started: Instant,
                first_token_seen: &mut bool,
                delta_tx: &mpsc::Sender<String>,
            ) -> Option<u64> {
                let text = String::from_utf8_lossy(line);
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }

                let parsed: ChatChunk = match serde_json::from_str(text) {
                    Ok(parsed) => parsed,
                    Err(_) => return None,
                };

                if let Some(message) = &parsed.message {
                    if !message.content.is_empty() {
                        if !*first_token_seen {
                            *first_token_seen = true;
                            let ttft_ms = started.elapsed().as_secs_f64() * 1000.0;
                            info!(ttft_ms = ttft_ms, "llm_first_token");
                        }
                        if delta_tx.send(message.content.clone()).await.is_err() {
                            // Consumer went away; report completion.
                            return Some(0);
                        }
                    }
                }

                if parsed.done {
                    return Some(parsed.eval_count.unwrap_or(0));
                }
                None
            }

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| PipelineError::Llm(format!("chat stream: {e}")))?;
                pending.extend_from_slice(&chunk);

                // NDJSON: one chat chunk per line.
                while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    if let Some(tokens) =
                        process_line(&line, started, &mut first_token_seen, &delta_tx).await
                    {
                        return Ok(tokens);
                    }
                }
            }

            // A final chunk without a trailing newline still counts.
            if let Some(tokens) =
                process_line(&pending, started, &mut first_token_seen, &delta_tx).await
            {
                return Ok(tokens);
            }

            Ok(0)
        });

        (delta_rx, handle)
    }

    async fn join_stream(handle: tokio::task::JoinHandle<Result<u64>>) -> Result<u64> {
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Llm(format!("chat task panicked: {e}"))),
        }
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Generation> {
        let (mut delta_rx, handle) = self.spawn_chat_stream(messages, max_tokens, temperature);

        let mut text = String::new();
        while let Some(delta) = delta_rx.recv().await {
            text.push_str(&delta);
        }
        let tokens_used = Self::join_stream(handle).await?;

        Ok(Generation {
            text,
            model: self.model.clone(),
            tokens_used,
        })
    }

    async fn generate_streaming(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
        tx: mpsc::Sender<SentenceChunk>,
    ) -> Result<()> {
        let (mut delta_rx, handle) = self.spawn_chat_stream(messages, max_tokens, temperature);

        let mut splitter = SentenceSplitter::new();
        while let Some(delta) = delta_rx.recv().await {
            for sentence in splitter.push(&delta) {
                info!(
                    sentence = %sentence.chars().take(50).collect::<String>(),
                    "llm_sentence_complete"
                );
                tx.send(SentenceChunk {
                    sentence,
                    is_final: false,
                    tokens_used: 0,
                })
                .await
                .map_err(|e| PipelineError::Channel(format!("sentence channel closed: {e}")))?;
            }
        }
        let tokens_used = Self::join_stream(handle).await?;

        // Exactly one final chunk, carrying any trailing fragment.
        let fragment = splitter.finish().unwrap_or_default();
        tx.send(SentenceChunk {
            sentence: fragment,
            is_final: true,
            tokens_used,
        })
        .await
        .map_err(|e| PipelineError::Channel(format!("sentence channel closed: {e}")))?;

        Ok(())
    }

    async fn health_check(&self) -> bool {
        let tags = match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "ollama_health_check_failed");
                return false;
            }
        };

        let parsed: TagsResponse = match tags.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "ollama_tags_parse_failed");
                return false;
            }
        };

        let available = parsed
            .models
            .iter()
            .any(|m| m.name == self.model || m.name.contains(&self.model));
        if available {
            return true;
        }

        // Model not present; try pulling it before giving up.
        info!(model = %self.model, "pulling_ollama_model");
        match self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .timeout(PULL_TIMEOUT)
            .json(&serde_json::json!({ "name": self.model }))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(error = %e, "ollama_pull_failed");
                false
            }
        }
    }
}
