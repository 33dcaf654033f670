//! Speech-recognition worker.
//!
//! Consumes `audio.segments`, transcribes each utterance through the
//! recognizer engine, and publishes non-empty transcripts to
//! `text.transcripts`. Empty recognizer output is not an error — the
//! utterance is dropped silently.

pub mod transcriber;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{decode_message, groups, streams, StreamBus};
use crate::config::AsrSettings;
use crate::error::Result;
use crate::metrics::metrics;
use crate::pipeline::messages::{Transcript, Utterance};

use transcriber::{
    joined_text, mean_confidence, normalize_pcm, RecognizerEngine, WhisperHttpEngine,
};

/// Run the ASR worker with the configured recognizer engine.
///
/// # Errors
///
/// Returns an error if the engine client cannot be built or the bus is
/// unreachable at startup.
pub async fn run(settings: &AsrSettings, shutdown: CancellationToken) -> Result<()> {
    let engine = Arc::new(WhisperHttpEngine::new(settings)?);
    run_with_engine(settings, engine, shutdown).await
}

/// Run the worker against any recognizer engine (tests inject fakes here).
pub async fn run_with_engine(
    settings: &AsrSettings,
    engine: Arc<dyn RecognizerEngine>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(engine = engine.name(), "asr_worker_starting");

    let bus = StreamBus::connect(&settings.base.redis_url).await?;
    metrics().set_component_health("redis", true);
    metrics().set_component_health("recognizer", true);

    info!("asr_worker_started");

    let publisher = bus.clone();
    bus.consume(
        streams::AUDIO_SEGMENTS,
        groups::ASR,
        "asr-main",
        shutdown,
        move |_message_id, value| {
            let bus = publisher.clone();
            let engine = Arc::clone(&engine);
            async move {
                let utterance: Utterance = match decode_message(value) {
                    Ok(utterance) => utterance,
                    Err(e) => {
                        warn!(error = %e, "malformed_utterance");
                        return Ok(());
                    }
                };
                handle_utterance(&bus, engine.as_ref(), utterance).await
            }
        },
    )
    .await
}

async fn handle_utterance(
    bus: &StreamBus,
    engine: &dyn RecognizerEngine,
    utterance: Utterance,
) -> Result<()> {
    let started = Instant::now();
    let samples = normalize_pcm(&utterance.audio_data);

    let segments = match engine.transcribe(&samples).await {
        Ok(segments) => segments,
        Err(e) => {
            // Engine failures are logged per message and skipped; the
            // consumer moves on.
            error!(session_id = %utterance.session_id, error = %e, "transcription_failed");
            return Ok(());
        }
    };

    let text = joined_text(&segments);
    let confidence = mean_confidence(&segments);
    let processing_ms = started.elapsed().as_millis() as u64;

    metrics().asr_latency_ms.observe(processing_ms as f64);
    metrics().asr_confidence.observe(f64::from(confidence));

    if text.trim().is_empty() {
        debug!(session_id = %utterance.session_id, "empty_transcription");
        return Ok(());
    }

    info!(
        session_id = %utterance.session_id,
        confidence = confidence,
        processing_ms = processing_ms,
        text = %preview(&text),
        "transcription_complete"
    );

    let transcript = Transcript {
        device_id: utterance.device_id,
        session_id: utterance.session_id,
        text,
        confidence,
        language: "en".to_owned(),
        processing_ms,
    };
    bus.publish(streams::TEXT_TRANSCRIPTS, &transcript).await?;
    Ok(())
}

/// First 50 characters for log lines.
fn preview(text: &str) -> String {
    if text.chars().count() > 50 {
        let truncated: String = text.chars().take(50).collect();
        format!("{truncated}...")
    } else {
        text.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_text() {
        let long = "a".repeat(80);
        let shown = preview(&long);
        assert_eq!(shown.len(), 53);
        assert!(shown.ends_with("..."));
    }

    #[test]
    fn preview_passes_short_text_through() {
        assert_eq!(preview("hello"), "hello");
    }
}
