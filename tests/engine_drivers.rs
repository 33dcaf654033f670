//! Integration tests for the recognizer and synthesizer HTTP drivers.

use hearth::asr::transcriber::{RecognizerEngine, WhisperHttpEngine};
use hearth::config::{AsrSettings, Settings, TtsSettings};
use hearth::tts::synthesizer::{load_engine, PiperHttpEngine, SynthesisEngine};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn asr_settings_for(url: &str) -> AsrSettings {
    AsrSettings {
        base: Settings::from_env(),
        whisper_model: "tiny.en".to_owned(),
        whisper_device: "cpu".to_owned(),
        whisper_url: url.to_owned(),
    }
}

fn tts_settings_for(url: &str) -> TtsSettings {
    TtsSettings {
        base: Settings::from_env(),
        piper_voice: "en_US-lessac-medium".to_owned(),
        piper_model_path: "./models".to_owned(),
        piper_url: url.to_owned(),
    }
}

#[tokio::test]
async fn recognizer_driver_parses_segment_hypotheses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/inference"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "segments": [
                {"text": " hello there", "avg_logprob": -0.2},
                {"text": " how are you", "avg_logprob": -0.4}
            ]
        })))
        .mount(&server)
        .await;

    let engine = WhisperHttpEngine::new(&asr_settings_for(&server.uri())).unwrap();
    let samples = vec![0.0f32; 16_000];
    let segments = engine.transcribe(&samples).await.unwrap();

    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].text, " hello there");
    assert!((segments[1].avg_logprob + 0.4).abs() < 1e-6);
}

#[tokio::test]
async fn recognizer_driver_errors_on_engine_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/inference"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let engine = WhisperHttpEngine::new(&asr_settings_for(&server.uri())).unwrap();
    assert!(engine.transcribe(&[0.0f32; 160]).await.is_err());
}

#[tokio::test]
async fn synthesizer_driver_decodes_streamed_pcm() {
    let server = MockServer::start().await;
    // Four s16le samples: 100, -100, 32000, 0.
    let pcm: Vec<u8> = [100i16, -100, 32_000, 0]
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(pcm, "application/octet-stream"))
        .mount(&server)
        .await;

    let engine = PiperHttpEngine::new(&tts_settings_for(&server.uri())).unwrap();
    let samples = engine.synthesize("hello").await.unwrap();
    assert_eq!(samples, vec![100, -100, 32_000, 0]);
}

#[tokio::test]
async fn engine_loader_falls_back_to_silence_when_unreachable() {
    let engine = load_engine(&tts_settings_for("http://127.0.0.1:9")).await.unwrap();
    assert_eq!(engine.name(), "silence");

    // The fallback still honors the synthesis contract.
    let samples = engine.synthesize("hi").await.unwrap();
    assert_eq!(samples.len(), (22_050 * 100) / 1000);
}

#[tokio::test]
async fn engine_loader_prefers_the_voice_engine_when_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let engine = load_engine(&tts_settings_for(&server.uri())).await.unwrap();
    assert_eq!(engine.name(), "piper");
}
