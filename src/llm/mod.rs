//! Response-generation worker.
//!
//! Consumes `llm.requests` and streams the model's reply sentence by
//! sentence: every completed sentence is published to `tts.requests`
//! immediately, so synthesis overlaps generation. The full response is
//! published once to `llm.responses` for history tracking. If the backend
//! fails, a canned reassurance phrase keeps the conversation alive.

pub mod backend;
pub mod fallback;
pub mod ollama;
pub mod sentence;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{decode_message, groups, streams, StreamBus};
use crate::config::LlmSettings;
use crate::error::{PipelineError, Result};
use crate::metrics::metrics;
use crate::pipeline::messages::{Intent, LlmRequest, LlmResponse, SentenceChunk, TtsRequest};

use backend::{ChatMessage, LlmBackend};
use fallback::{FallbackResponder, FALLBACK_MODEL};
use ollama::OllamaBackend;

/// Sentence channel depth between the backend and the fan-out loop.
const SENTENCE_CHANNEL_SIZE: usize = 8;

/// Reply used when the backend produced no text at all.
const EMPTY_RESPONSE_TEXT: &str = "I'm here for you.";

/// Run the LLM worker with the configured backend.
///
/// # Errors
///
/// Returns an error if the backend is unknown, its startup health check
/// fails, or the bus is unreachable.
pub async fn run(settings: &LlmSettings, shutdown: CancellationToken) -> Result<()> {
    let backend: Arc<dyn LlmBackend> = match settings.llm_backend.as_str() {
        "ollama" => Arc::new(OllamaBackend::new(settings)?),
        other => {
            return Err(PipelineError::Config(format!(
                "unknown LLM backend: {other}"
            )))
        }
    };
    run_with_backend(settings, backend, shutdown).await
}

/// Run the worker against any backend (tests inject fakes here).
pub async fn run_with_backend(
    settings: &LlmSettings,
    backend: Arc<dyn LlmBackend>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(backend = backend.name(), model = %settings.llm_model, "llm_worker_starting");

    // A dead backend at startup is fatal; mid-session failures fall back.
    if !backend.health_check().await {
        metrics().set_component_health(backend.name(), false);
        error!(backend = backend.name(), "backend_unavailable");
        return Err(PipelineError::Llm(format!(
            "{} backend is not available, refusing to start",
            backend.name()
        )));
    }
    metrics().set_component_health(backend.name(), true);

    let bus = StreamBus::connect(&settings.base.redis_url).await?;
    metrics().set_component_health("redis", true);

    info!("llm_worker_started");

    let responder = Arc::new(Mutex::new(FallbackResponder::new()));
    let model_name = settings.llm_model.clone();

    let publisher = bus.clone();
    let consumer_backend = Arc::clone(&backend);
    bus.consume(
        streams::LLM_REQUESTS,
        groups::LLM,
        "llm-main",
        shutdown,
        move |_message_id, value| {
            let bus = publisher.clone();
            let backend = Arc::clone(&consumer_backend);
            let responder = Arc::clone(&responder);
            let model_name = model_name.clone();
            async move {
                let request: LlmRequest = match decode_message(value) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "malformed_llm_request");
                        return Ok(());
                    }
                };
                handle_request(&bus, backend, &responder, &model_name, request).await
            }
        },
    )
    .await?;

    backend.close().await;
    Ok(())
}

/// What a completed generation produced.
struct GenerationSummary {
    text: String,
    tokens_used: u64,
    sentences: usize,
}

async fn handle_request(
    bus: &StreamBus,
    backend: Arc<dyn LlmBackend>,
    responder: &Arc<Mutex<FallbackResponder>>,
    model_name: &str,
    request: LlmRequest,
) -> Result<()> {
    let started = Instant::now();
    info!(
        request_id = %request.request_id,
        message_preview = %request.user_message.chars().take(50).collect::<String>(),
        "processing_llm_request"
    );

    let messages = build_messages(&request);

    let outcome = if backend.supports_streaming() {
        stream_response(bus, Arc::clone(&backend), &request, messages).await
    } else {
        batch_response(bus, backend.as_ref(), &request, &messages).await
    };

    let latency_ms = started.elapsed().as_millis() as u64;

    let response = match outcome {
        Ok(summary) => {
            metrics()
                .llm_latency_ms
                .with_label_values(&[model_name, backend.name()])
                .observe(latency_ms as f64);
            if summary.tokens_used > 0 {
                metrics()
                    .llm_tokens_used
                    .with_label_values(&[model_name])
                    .inc_by(summary.tokens_used);
            }
            info!(
                request_id = %request.request_id,
                latency_ms = latency_ms,
                sentences = summary.sentences,
                "llm_complete"
            );
            LlmResponse {
                request_id: request.request_id.clone(),
                device_id: request.device_id.clone(),
                session_id: request.session_id.clone(),
                text: if summary.text.is_empty() {
                    EMPTY_RESPONSE_TEXT.to_owned()
                } else {
                    summary.text
                },
                detected_intent: Intent::Unknown,
                model: model_name.to_owned(),
                latency_ms,
                tokens_used: summary.tokens_used,
                is_fallback: false,
            }
        }
        Err(e) => {
            warn!(request_id = %request.request_id, error = %e, "using_static_fallback");
            metrics()
                .llm_fallback_count
                .with_label_values(&["backend_failed"])
                .inc();

            let phrase = {
                let mut responder = responder
                    .lock()
                    .map_err(|_| PipelineError::Llm("fallback lock poisoned".to_owned()))?;
                responder.next_phrase()
            };

            // The canned phrase still gets spoken.
            bus.publish(
                streams::TTS_REQUESTS,
                &TtsRequest {
                    request_id: format!("{}-0", request.request_id),
                    device_id: request.device_id.clone(),
                    session_id: request.session_id.clone(),
                    text: phrase.to_owned(),
                },
            )
            .await?;

            LlmResponse {
                request_id: request.request_id.clone(),
                device_id: request.device_id.clone(),
                session_id: request.session_id.clone(),
                text: phrase.to_owned(),
                detected_intent: Intent::Unknown,
                model: FALLBACK_MODEL.to_owned(),
                latency_ms,
                tokens_used: 0,
                is_fallback: true,
            }
        }
    };

    bus.publish(streams::LLM_RESPONSES, &response).await?;
    Ok(())
}

/// Stream sentences from the backend, fanning each one out to TTS as soon
/// as it completes.
async fn stream_response(
    bus: &StreamBus,
    backend: Arc<dyn LlmBackend>,
    request: &LlmRequest,
    messages: Vec<ChatMessage>,
) -> Result<GenerationSummary> {
    let (tx, mut rx) = mpsc::channel::<SentenceChunk>(SENTENCE_CHANNEL_SIZE);

    let max_tokens = request.max_tokens;
    let temperature = request.temperature;
    let generation = tokio::spawn(async move {
        backend
            .generate_streaming(&messages, max_tokens, temperature, tx)
            .await
    });

    let mut parts: Vec<String> = Vec::new();
    let mut tokens_used = 0u64;

    while let Some(chunk) = rx.recv().await {
        if !chunk.sentence.is_empty() {
            let index = parts.len();
            bus.publish(
                streams::TTS_REQUESTS,
                &TtsRequest {
                    request_id: format!("{}-{index}", request.request_id),
                    device_id: request.device_id.clone(),
                    session_id: request.session_id.clone(),
                    text: chunk.sentence.clone(),
                },
            )
            .await?;
            info!(
                request_id = %request.request_id,
                index = index,
                text = %chunk.sentence.chars().take(40).collect::<String>(),
                "sentence_to_tts"
            );
            parts.push(chunk.sentence);
        }
        if chunk.is_final {
            tokens_used = chunk.tokens_used;
        }
    }

    match generation.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if parts.is_empty() => return Err(e),
        Ok(Err(e)) => {
            // Sentences already reached the device; report what was spoken.
            warn!(request_id = %request.request_id, error = %e, "generation_truncated");
        }
        Err(e) if parts.is_empty() => {
            return Err(PipelineError::Llm(format!("generation task panicked: {e}")))
        }
        Err(e) => {
            warn!(request_id = %request.request_id, error = %e, "generation_truncated");
        }
    }

    Ok(GenerationSummary {
        text: parts.join(" "),
        sentences: parts.len(),
        tokens_used,
    })
}

/// Single-call path for backends without streaming support; the whole reply
/// becomes one synthesis request.
async fn batch_response(
    bus: &StreamBus,
    backend: &dyn LlmBackend,
    request: &LlmRequest,
    messages: &[ChatMessage],
) -> Result<GenerationSummary> {
    let generation = backend
        .generate(messages, request.max_tokens, request.temperature)
        .await?;

    let text = generation.text.trim().to_owned();
    if !text.is_empty() {
        bus.publish(
            streams::TTS_REQUESTS,
            &TtsRequest {
                request_id: request.request_id.clone(),
                device_id: request.device_id.clone(),
                session_id: request.session_id.clone(),
                text: text.clone(),
            },
        )
        .await?;
    }

    Ok(GenerationSummary {
        sentences: usize::from(!text.is_empty()),
        text,
        tokens_used: generation.tokens_used,
    })
}

/// Assemble the prompt: optional system message, then history oldest to
/// newest, then the new user message.
fn build_messages(request: &LlmRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.conversation_history.len() + 2);
    if !request.system_prompt.is_empty() {
        messages.push(ChatMessage::system(request.system_prompt.clone()));
    }
    for turn in &request.conversation_history {
        messages.push(ChatMessage {
            role: turn.role.as_str(),
            content: turn.content.clone(),
        });
    }
    messages.push(ChatMessage::user(request.user_message.clone()));
    messages
}
