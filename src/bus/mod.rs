//! Stream bus client backed by Redis Streams.
//!
//! The bus is the only inter-stage communication primitive: named, durable,
//! append-only logs read through consumer groups with explicit
//! acknowledgement. Publishing trims each stream to an approximate cap so a
//! crashed consumer cannot grow a stream without bound.

use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};

/// Named streams of the pipeline.
pub mod streams {
    pub const AUDIO_INBOUND: &str = "audio.inbound";
    pub const AUDIO_SEGMENTS: &str = "audio.segments";
    pub const TEXT_TRANSCRIPTS: &str = "text.transcripts";
    pub const LLM_REQUESTS: &str = "llm.requests";
    pub const LLM_RESPONSES: &str = "llm.responses";
    pub const TTS_REQUESTS: &str = "tts.requests";
    pub const AUDIO_OUTBOUND: &str = "audio.outbound";
    pub const EVENTS_CAREGIVER: &str = "events.caregiver";
}

/// Consumer groups, one per stage.
pub mod groups {
    pub const VAD: &str = "vad";
    pub const ASR: &str = "asr";
    pub const ORCHESTRATOR: &str = "orchestrator";
    pub const LLM: &str = "llm";
    pub const TTS: &str = "tts";
    pub const GATEWAY: &str = "gateway";
}

/// Approximate per-stream entry cap; oldest entries are trimmed first.
const STREAM_MAXLEN: usize = 10_000;

/// Blocking read timeout; doubles as the shutdown poll interval.
const BLOCK_MS: usize = 1_000;

/// Back-off after a transient consumer error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Basic stream statistics from `XINFO STREAM`.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub length: usize,
    pub groups: usize,
}

/// Client handle for the stream bus. Cheap to clone; all clones share the
/// underlying multiplexed connection.
#[derive(Clone)]
pub struct StreamBus {
    conn: ConnectionManager,
}

impl StreamBus {
    /// Connect to the bus and verify the connection with a ping.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BusUnavailable`] if the backing store is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| PipelineError::BusUnavailable(format!("invalid redis url: {e}")))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| PipelineError::BusUnavailable(format!("connect failed: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::BusUnavailable(format!("ping failed: {e}")))?;

        info!(url = redis_url, "bus_connected");
        Ok(Self { conn })
    }

    /// Append a record to a stream, trimming it to the approximate cap.
    ///
    /// Returns the message id assigned by the store.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BusUnavailable`] when the append fails.
    pub async fn publish<T: Serialize>(&self, stream: &str, message: &T) -> Result<String> {
        let payload = encode_envelope(message)?;
        let mut conn = self.conn.clone();

        let id: String = conn
            .xadd_maxlen(
                stream,
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[("data", payload.as_str())],
            )
            .await
            .map_err(|e| PipelineError::BusUnavailable(format!("publish to {stream}: {e}")))?;

        debug!(stream, message_id = %id, "message_published");
        Ok(id)
    }

    /// Consume a stream through a consumer group until shutdown.
    ///
    /// The group is created lazily (idempotent). Each message is
    /// acknowledged after the handler returns, giving at-least-once
    /// delivery. Envelope decode failures are logged, acknowledged and
    /// dropped so a poison pill cannot wedge the group cursor; any other
    /// error backs off for one second and resumes at the group cursor.
    ///
    /// # Errors
    ///
    /// Returns an error only when the consumer group cannot be created.
    pub async fn consume<F, Fut>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        shutdown: CancellationToken,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(String, serde_json::Value) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.ensure_group(stream, group).await?;
        info!(stream, group, consumer, "consumer_started");

        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(BLOCK_MS);

        while !shutdown.is_cancelled() {
            let mut conn = self.conn.clone();
            let read = tokio::select! {
                r = async {
                    let reply: redis::RedisResult<StreamReadReply> =
                        conn.xread_options(&[stream], &[">"], &options).await;
                    reply
                } => r,
                () = shutdown.cancelled() => break,
            };

            let reply = match read {
                Ok(reply) => reply,
                Err(e) => {
                    error!(stream, error = %e, "consumer_read_error");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            for key in reply.keys {
                for entry in key.ids {
                    let message_id = entry.id.clone();

                    match entry.get::<String>("data") {
                        Some(data) => match serde_json::from_str::<serde_json::Value>(&data) {
                            Ok(value) => {
                                if let Err(e) = handler(message_id.clone(), value).await {
                                    error!(stream, message_id = %message_id, error = %e,
                                           "handler_error");
                                }
                            }
                            Err(e) => {
                                error!(stream, message_id = %message_id, error = %e,
                                       "message_decode_error");
                            }
                        },
                        None => {
                            warn!(stream, message_id = %message_id, "message_missing_data_field");
                        }
                    }

                    // Ack regardless of handler outcome; redelivery of a
                    // failed message would fail the same way.
                    let acked: redis::RedisResult<u64> =
                        conn.xack(stream, group, &[&message_id]).await;
                    if let Err(e) = acked {
                        warn!(stream, message_id = %message_id, error = %e, "ack_failed");
                    }
                }
            }
        }

        info!(stream, group, "consumer_stopped");
        Ok(())
    }

    /// Ping the backing store.
    pub async fn health_check(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    /// Length and group count of a stream, for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BusUnavailable`] when the query fails.
    pub async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamInfoStreamReply = conn
            .xinfo_stream(stream)
            .await
            .map_err(|e| PipelineError::BusUnavailable(format!("xinfo {stream}: {e}")))?;
        Ok(StreamInfo {
            length: reply.length,
            groups: reply.groups,
        })
    }

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(_) => {
                info!(stream, group, "consumer_group_created");
                Ok(())
            }
            Err(e) if is_busygroup(&e) => Ok(()),
            Err(e) => Err(PipelineError::BusUnavailable(format!(
                "group create {group} on {stream}: {e}"
            ))),
        }
    }
}

/// Wrap a record in the bus envelope: `{"data": <json string>}` is flattened
/// to a single stream field named `data` holding the JSON text.
fn encode_envelope<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).map_err(|e| PipelineError::Codec(format!("encode: {e}")))
}

/// Decode an envelope payload into a typed record.
///
/// # Errors
///
/// Returns [`PipelineError::Codec`] on schema mismatch; callers log and drop.
pub fn decode_message<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| PipelineError::Codec(format!("decode: {e}")))
}

/// A group-already-exists reply to `XGROUP CREATE`, which is expected and
/// swallowed.
fn is_busygroup(error: &redis::RedisError) -> bool {
    error.code() == Some("BUSYGROUP") || error.to_string().contains("BUSYGROUP")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::messages::{pcm_duration_ms, AudioChunk};
    use chrono::Utc;

    #[test]
    fn envelope_round_trips_typed_records() {
        let chunk = AudioChunk {
            device_id: "companion-001".to_owned(),
            session_id: "companion-001-deadbeef".to_owned(),
            sequence: 1,
            captured_at: Utc::now(),
            audio_data: vec![1, 2, 3, 4],
            duration_ms: pcm_duration_ms(&[0u8; 64]),
            is_streaming: false,
        };

        let payload = encode_envelope(&chunk).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let back: AudioChunk = decode_message(value).unwrap();
        assert_eq!(back.audio_data, chunk.audio_data);
        assert_eq!(back.session_id, chunk.session_id);
    }

    #[test]
    fn decode_rejects_schema_mismatch() {
        let value = serde_json::json!({"not": "an audio chunk"});
        let result: Result<AudioChunk> = decode_message(value);
        assert!(matches!(result, Err(PipelineError::Codec(_))));
    }

    #[test]
    fn busygroup_errors_are_recognized() {
        let err = redis::RedisError::from((
            redis::ErrorKind::ExtensionError,
            "BUSYGROUP",
            "Consumer Group name already exists".to_owned(),
        ));
        assert!(is_busygroup(&err));

        let other = redis::RedisError::from((redis::ErrorKind::IoError, "io", "refused".to_owned()));
        assert!(!is_busygroup(&other));
    }
}
