//! Voice-activity detection worker.
//!
//! Consumes `audio.inbound` and forwards complete utterances to
//! `audio.segments`. Two modes per chunk: passthrough (the client already
//! segmented the utterance) and streaming (the boundary state machine owns
//! segmentation).

pub mod detector;
pub mod segmenter;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{decode_message, groups, streams, StreamBus};
use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::metrics::metrics;
use crate::pipeline::messages::{pcm_duration_ms, AudioChunk, Utterance};

use detector::SpeechDetector;
use segmenter::UtteranceSegmenter;

/// Mutable per-worker state behind the consumer loop.
struct WorkerState {
    detector: SpeechDetector,
    sessions: HashMap<String, UtteranceSegmenter>,
}

/// Run the VAD worker until shutdown.
///
/// # Errors
///
/// Returns an error if the bus is unreachable at startup.
pub async fn run(settings: &Settings, shutdown: CancellationToken) -> Result<()> {
    info!("vad_worker_starting");

    let bus = StreamBus::connect(&settings.redis_url).await?;
    metrics().set_component_health("redis", true);

    let model = detector::load_model();
    metrics().set_component_health("vad_model", model.is_some());

    let state = Arc::new(Mutex::new(WorkerState {
        detector: SpeechDetector::new(model),
        sessions: HashMap::new(),
    }));

    info!("vad_worker_started");

    let publisher = bus.clone();
    bus.consume(
        streams::AUDIO_INBOUND,
        groups::VAD,
        "vad-main",
        shutdown,
        move |_message_id, value| {
            let state = Arc::clone(&state);
            let bus = publisher.clone();
            async move {
                let chunk: AudioChunk = match decode_message(value) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "malformed_audio_chunk");
                        return Ok(());
                    }
                };
                handle_chunk(&bus, &state, chunk).await
            }
        },
    )
    .await
}

/// What one chunk resolved to.
enum ChunkDecision {
    Silence,
    Buffered,
    Emit(Vec<u8>),
}

async fn handle_chunk(
    bus: &StreamBus,
    state: &Arc<Mutex<WorkerState>>,
    chunk: AudioChunk,
) -> Result<()> {
    let started = Instant::now();

    let decision = {
        let mut state = state
            .lock()
            .map_err(|_| PipelineError::Vad("worker state lock poisoned".to_owned()))?;

        let detection = state.detector.detect(&chunk.audio_data);

        if chunk.is_streaming {
            let segmenter = state.sessions.entry(chunk.session_id.clone()).or_default();
            let output = segmenter.push_chunk(&chunk.audio_data, detection.is_speech);

            if output.speech_started {
                info!(
                    session_id = %chunk.session_id,
                    probability = detection.probability,
                    "speech_started"
                );
            }
            if output.discarded_too_short {
                info!(session_id = %chunk.session_id, "too_short");
            }

            match output.utterance {
                Some(pcm) => ChunkDecision::Emit(pcm),
                None if detection.is_speech => ChunkDecision::Buffered,
                None => ChunkDecision::Silence,
            }
        } else if detection.is_speech {
            // Passthrough: the client did boundary detection, the whole
            // chunk is one utterance.
            ChunkDecision::Emit(chunk.audio_data.clone())
        } else {
            debug!(
                session_id = %chunk.session_id,
                probability = detection.probability,
                "passthrough_chunk_dropped"
            );
            ChunkDecision::Silence
        }
    };

    metrics()
        .vad_latency_ms
        .observe(started.elapsed().as_secs_f64() * 1000.0);

    if let ChunkDecision::Emit(pcm) = decision {
        let utterance = Utterance {
            device_id: chunk.device_id,
            session_id: chunk.session_id,
            duration_ms: pcm_duration_ms(&pcm),
            audio_data: pcm,
            emitted_at: Utc::now(),
        };
        info!(
            session_id = %utterance.session_id,
            duration_ms = utterance.duration_ms,
            "utterance_emitted"
        );
        bus.publish(streams::AUDIO_SEGMENTS, &utterance).await?;
    }

    Ok(())
}
