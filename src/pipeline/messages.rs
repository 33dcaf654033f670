//! Message types passed between pipeline stages over the stream bus.
//!
//! Every record is JSON inside the bus envelope; raw audio travels as a
//! base64 string field so the envelope stays valid UTF-8.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 16 kHz mono s16le audio is 32 bytes per millisecond.
pub const PCM_BYTES_PER_MS: usize = 32;

/// Estimate the duration of a 16 kHz mono s16le buffer.
pub fn pcm_duration_ms(pcm: &[u8]) -> u64 {
    (pcm.len() / PCM_BYTES_PER_MS) as u64
}

/// Base64 (standard alphabet) codec for binary payload fields.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One frame of microphone audio routed from the gateway to VAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunk {
    pub device_id: String,
    pub session_id: String,
    /// Per-session frame counter assigned by the gateway.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    /// Raw PCM, 16 kHz mono signed-16 little-endian.
    #[serde(with = "b64")]
    pub audio_data: Vec<u8>,
    pub duration_ms: u64,
    /// True when the client streams continuously and server-side VAD owns
    /// utterance boundary detection.
    pub is_streaming: bool,
}

/// A complete utterance emitted by the VAD segmenter, ready for recognition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub device_id: String,
    pub session_id: String,
    /// Concatenated PCM for the whole utterance.
    #[serde(with = "b64")]
    pub audio_data: Vec<u8>,
    pub duration_ms: u64,
    pub emitted_at: DateTime<Utc>,
}

/// Recognized text for one utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub device_id: String,
    pub session_id: String,
    pub text: String,
    /// Mean recognizer confidence in [0, 1].
    pub confidence: f32,
    pub language: String,
    pub processing_ms: u64,
}

/// Chat role on a conversation turn. History never carries system turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of conversation history, oldest first when in a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Persistent profile of the person the companion speaks with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub device_id: String,
    pub name: String,
    #[serde(default)]
    pub preferred_name: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub life_details: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub preferences: serde_json::Map<String, serde_json::Value>,
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_owned()
}

impl UserProfile {
    /// Name to address the user by.
    pub fn display_name(&self) -> &str {
        match self.preferred_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }
}

/// Care information consulted when building request context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarePlan {
    pub user_id: String,
    #[serde(default)]
    pub medications: Vec<serde_json::Value>,
    #[serde(default)]
    pub routines: Vec<serde_json::Value>,
    #[serde(default)]
    pub contacts: Vec<serde_json::Value>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A generation request from the orchestrator to the LLM worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub request_id: String,
    pub device_id: String,
    pub session_id: String,
    pub user_id: String,
    pub user_message: String,
    /// Ordered oldest to newest; user/assistant turns only.
    #[serde(default)]
    pub conversation_history: Vec<ChatTurn>,
    pub user_profile: UserProfile,
    #[serde(default)]
    pub care_plan: Option<CarePlan>,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Coarse intent label attached to a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    #[default]
    Unknown,
}

/// The completed generation, published once per request for history tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub request_id: String,
    pub device_id: String,
    pub session_id: String,
    pub text: String,
    pub detected_intent: Intent,
    pub model: String,
    pub latency_ms: u64,
    pub tokens_used: u64,
    pub is_fallback: bool,
}

/// A synthesis request; sentence fan-out uses `<parent>-<index>` request ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    pub request_id: String,
    pub device_id: String,
    pub session_id: String,
    pub text: String,
}

/// Display hints forwarded to the device alongside audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiHints {
    pub show_text: bool,
    pub mood: String,
}

impl Default for UiHints {
    fn default() -> Self {
        Self {
            show_text: true,
            mood: "neutral".to_owned(),
        }
    }
}

/// Synthesized speech for one sentence, consumed by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsResult {
    pub request_id: String,
    pub device_id: String,
    pub session_id: String,
    /// RIFF/WAVE, 22.05 kHz mono signed-16.
    #[serde(with = "b64")]
    pub audio_data: Vec<u8>,
    pub duration_ms: u64,
    pub latency_ms: u64,
    pub text: String,
    pub ui_hints: UiHints,
}

/// A sentence produced by the streaming splitter, in-process only.
///
/// Exactly one chunk per generation carries `is_final = true`; the final
/// chunk also reports the completion token count.
#[derive(Debug, Clone)]
pub struct SentenceChunk {
    pub sentence: String,
    pub is_final: bool,
    pub tokens_used: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_duration_uses_32_bytes_per_ms() {
        assert_eq!(pcm_duration_ms(&[0u8; 3200]), 100);
        assert_eq!(pcm_duration_ms(&[0u8; 31]), 0);
        assert_eq!(pcm_duration_ms(&[]), 0);
    }

    #[test]
    fn audio_chunk_round_trips_binary_payload() {
        let chunk = AudioChunk {
            device_id: "companion-001".to_owned(),
            session_id: "companion-001-abc123".to_owned(),
            sequence: 7,
            captured_at: Utc::now(),
            audio_data: vec![0, 1, 2, 253, 254, 255],
            duration_ms: 0,
            is_streaming: true,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        // The payload must be base64 text, never a JSON byte array.
        assert!(json.contains("\"audio_data\":\"AAEC/f7/\""));
        let back: AudioChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back.audio_data, chunk.audio_data);
        assert_eq!(back.sequence, 7);
        assert!(back.is_streaming);
    }

    #[test]
    fn roles_serialize_lowercase() {
        let turn = ChatTurn {
            role: Role::Assistant,
            content: "hello".to_owned(),
        };
        let json = serde_json::to_string(&turn).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hello"}"#);
    }

    #[test]
    fn intent_serializes_screaming_snake() {
        let json = serde_json::to_string(&Intent::Unknown).unwrap();
        assert_eq!(json, "\"UNKNOWN\"");
    }

    #[test]
    fn profile_prefers_preferred_name() {
        let mut profile = UserProfile {
            user_id: "user-001".to_owned(),
            device_id: "companion-001".to_owned(),
            name: "Margaret".to_owned(),
            preferred_name: Some("Peggy".to_owned()),
            timezone: default_timezone(),
            life_details: serde_json::Map::new(),
            preferences: serde_json::Map::new(),
        };
        assert_eq!(profile.display_name(), "Peggy");
        profile.preferred_name = None;
        assert_eq!(profile.display_name(), "Margaret");
        profile.preferred_name = Some(String::new());
        assert_eq!(profile.display_name(), "Margaret");
    }

    #[test]
    fn llm_request_defaults_optional_fields() {
        let json = r#"{
            "request_id": "r1",
            "device_id": "companion-001",
            "session_id": "s1",
            "user_id": "user-001",
            "user_message": "hello",
            "user_profile": {
                "user_id": "user-001",
                "device_id": "companion-001",
                "name": "Friend"
            },
            "system_prompt": "be kind",
            "max_tokens": 60,
            "temperature": 0.7
        }"#;
        let request: LlmRequest = serde_json::from_str(json).unwrap();
        assert!(request.conversation_history.is_empty());
        assert!(request.care_plan.is_none());
        assert_eq!(request.user_profile.timezone, "America/Los_Angeles");
    }

    #[test]
    fn ui_hints_default_shows_text_neutral() {
        let hints = UiHints::default();
        assert!(hints.show_text);
        assert_eq!(hints.mood, "neutral");
    }
}
