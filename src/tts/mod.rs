//! Speech-synthesis worker.
//!
//! Consumes `tts.requests`, synthesizes each sentence, and publishes the
//! WAV-wrapped result to `audio.outbound`. Requests arrive in consumer-group
//! order, so a single consumer delivers sentences in the order the LLM
//! produced them.

pub mod synthesizer;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{decode_message, groups, streams, StreamBus};
use crate::config::TtsSettings;
use crate::error::Result;
use crate::metrics::metrics;
use crate::pipeline::messages::{TtsRequest, TtsResult, UiHints};

use synthesizer::{encode_wav, samples_duration_ms, SynthesisEngine};

/// Run the TTS worker with the configured synthesizer.
///
/// # Errors
///
/// Returns an error if the bus is unreachable at startup. Engine
/// unavailability is not fatal; the silence fallback takes over.
pub async fn run(settings: &TtsSettings, shutdown: CancellationToken) -> Result<()> {
    info!(voice = %settings.piper_voice, "tts_worker_starting");

    let engine: Arc<dyn SynthesisEngine> = Arc::from(synthesizer::load_engine(settings).await?);
    metrics().set_component_health("tts_engine", engine.name() != "silence");

    run_with_engine(settings, engine, shutdown).await
}

/// Run the worker against any synthesis engine (tests inject fakes here).
pub async fn run_with_engine(
    settings: &TtsSettings,
    engine: Arc<dyn SynthesisEngine>,
    shutdown: CancellationToken,
) -> Result<()> {
    let bus = StreamBus::connect(&settings.base.redis_url).await?;
    metrics().set_component_health("redis", true);

    info!(engine = engine.name(), "tts_worker_started");

    let publisher = bus.clone();
    bus.consume(
        streams::TTS_REQUESTS,
        groups::TTS,
        "tts-main",
        shutdown,
        move |_message_id, value| {
            let bus = publisher.clone();
            let engine = Arc::clone(&engine);
            async move {
                let request: TtsRequest = match decode_message(value) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "malformed_tts_request");
                        return Ok(());
                    }
                };
                handle_request(&bus, engine.as_ref(), request).await
            }
        },
    )
    .await
}

async fn handle_request(
    bus: &StreamBus,
    engine: &dyn SynthesisEngine,
    request: TtsRequest,
) -> Result<()> {
    if request.text.trim().is_empty() {
        warn!(request_id = %request.request_id, "empty_tts_request");
        return Ok(());
    }

    let started = Instant::now();
    info!(
        request_id = %request.request_id,
        text_length = request.text.len(),
        "synthesizing_speech"
    );

    let samples = match engine.synthesize(&request.text).await {
        Ok(samples) => samples,
        Err(e) => {
            error!(request_id = %request.request_id, error = %e, "synthesis_failed");
            return Ok(());
        }
    };

    let duration_ms = samples_duration_ms(samples.len());
    let wav = encode_wav(&samples)?;
    let latency_ms = started.elapsed().as_millis() as u64;
    metrics().tts_latency_ms.observe(latency_ms as f64);

    info!(
        request_id = %request.request_id,
        audio_duration_ms = duration_ms,
        latency_ms = latency_ms,
        "speech_synthesized"
    );

    let result = TtsResult {
        request_id: request.request_id,
        device_id: request.device_id,
        session_id: request.session_id,
        audio_data: wav,
        duration_ms,
        latency_ms,
        text: request.text,
        ui_hints: UiHints::default(),
    };
    bus.publish(streams::AUDIO_OUTBOUND, &result).await?;
    Ok(())
}
