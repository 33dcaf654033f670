//! Audio routing between the device socket and the stream bus.
//!
//! Inbound PCM becomes `audio.inbound` chunks; the response listener drains
//! `audio.outbound` and pushes synthesized replies back to the device,
//! closing the latency accounting loop for the non-streaming path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{decode_message, groups, streams, StreamBus};
use crate::error::Result;
use crate::gateway::session::ConnectionManager;
use crate::metrics::metrics;
use crate::pipeline::messages::{pcm_duration_ms, AudioChunk, TtsResult};

/// Routes audio between the device and the processing pipeline.
pub struct AudioRouter {
    bus: StreamBus,
    /// Request-start instants by session id, non-streaming path only. For
    /// the streaming path the utterance start is defined by VAD emission.
    pending_requests: Mutex<HashMap<String, Instant>>,
    /// Per-session inbound frame counters.
    sequences: Mutex<HashMap<String, u64>>,
}

impl AudioRouter {
    pub fn new(bus: StreamBus) -> Self {
        Self {
            bus,
            pending_requests: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Publish one inbound audio frame to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error when the bus append fails.
    pub async fn route_audio(
        &self,
        device_id: &str,
        session_id: &str,
        pcm: Vec<u8>,
        is_streaming: bool,
    ) -> Result<String> {
        let sequence = {
            let mut sequences = match self.sequences.lock() {
                Ok(sequences) => sequences,
                Err(poisoned) => poisoned.into_inner(),
            };
            let counter = sequences.entry(session_id.to_owned()).or_insert(0);
            *counter += 1;
            *counter
        };

        if !is_streaming {
            let mut pending = match self.pending_requests.lock() {
                Ok(pending) => pending,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.insert(session_id.to_owned(), Instant::now());
        }

        let chunk = AudioChunk {
            device_id: device_id.to_owned(),
            session_id: session_id.to_owned(),
            sequence,
            captured_at: Utc::now(),
            duration_ms: pcm_duration_ms(&pcm),
            audio_data: pcm,
            is_streaming,
        };

        let message_id = self.bus.publish(streams::AUDIO_INBOUND, &chunk).await?;

        metrics()
            .audio_chunks_received
            .with_label_values(&[device_id])
            .inc();
        debug!(
            device_id,
            duration_ms = chunk.duration_ms,
            is_streaming,
            "audio_routed"
        );

        Ok(message_id)
    }

    /// Drop stale latency bookkeeping for a session that went away.
    pub fn forget_session(&self, session_id: &str) {
        if let Ok(mut pending) = self.pending_requests.lock() {
            pending.remove(session_id);
        }
        if let Ok(mut sequences) = self.sequences.lock() {
            sequences.remove(session_id);
        }
    }

    /// Consume `audio.outbound` and push responses to the device until
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer group cannot be created.
    pub async fn listen_for_responses(
        self: std::sync::Arc<Self>,
        connections: std::sync::Arc<ConnectionManager>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("response_listener_started");

        let bus = self.bus.clone();
        bus.consume(
            streams::AUDIO_OUTBOUND,
            groups::GATEWAY,
            "gateway-main",
            shutdown,
            move |_message_id, value| {
                let router = std::sync::Arc::clone(&self);
                let connections = std::sync::Arc::clone(&connections);
                async move {
                    let result: TtsResult = match decode_message(value) {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(error = %e, "malformed_tts_result");
                            return Ok(());
                        }
                    };
                    router.handle_response(&connections, result).await;
                    Ok(())
                }
            },
        )
        .await
    }

    async fn handle_response(&self, connections: &ConnectionManager, result: TtsResult) {
        // Latency accounting: matches only the non-streaming path, which
        // recorded a request start for this session.
        let request_start = {
            let mut pending = match self.pending_requests.lock() {
                Ok(pending) => pending,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.remove(&result.session_id)
        };
        if let Some(start) = request_start {
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            metrics().record_pipeline_latency(&result.device_id, latency_ms);
            info!(
                session_id = %result.session_id,
                latency_ms = latency_ms,
                "pipeline_complete"
            );
        }

        let frame = device_frame(&result);
        let sent = connections.send_response(frame).await;
        if sent {
            debug!(
                text_length = result.text.len(),
                audio_bytes = result.audio_data.len(),
                "response_sent"
            );
        } else {
            // No buffering: a disconnected device misses the response.
            warn!(
                session_id = %result.session_id,
                reason = "device_not_connected",
                "response_send_failed"
            );
        }
    }
}

/// Pack a synthesis result into the JSON frame the device expects.
fn device_frame(result: &TtsResult) -> String {
    serde_json::json!({
        "type": "response",
        "session_id": result.session_id,
        "text": result.text,
        "ui_hints": result.ui_hints,
        "timestamp": Utc::now().to_rfc3339(),
        "audio": STANDARD.encode(&result.audio_data),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::messages::UiHints;

    #[test]
    fn device_frame_is_the_documented_shape() {
        let result = TtsResult {
            request_id: "r1-0".to_owned(),
            device_id: "companion-001".to_owned(),
            session_id: "companion-001-abc".to_owned(),
            audio_data: vec![82, 73, 70, 70],
            duration_ms: 250,
            latency_ms: 40,
            text: "Hello there.".to_owned(),
            ui_hints: UiHints::default(),
        };

        let frame: serde_json::Value = serde_json::from_str(&device_frame(&result)).unwrap();
        assert_eq!(frame["type"], "response");
        assert_eq!(frame["session_id"], "companion-001-abc");
        assert_eq!(frame["text"], "Hello there.");
        assert_eq!(frame["ui_hints"]["show_text"], true);
        assert_eq!(frame["ui_hints"]["mood"], "neutral");
        assert_eq!(frame["audio"], STANDARD.encode([82u8, 73, 70, 70]));
        assert!(frame["timestamp"].as_str().unwrap().contains('T'));
    }
}
