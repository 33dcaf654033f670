//! Speech-recognizer engine seam.
//!
//! The recognizer itself runs out of process; the driver here normalizes
//! audio, ships it to the engine, and folds segment hypotheses into a
//! transcript with a mean confidence.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tracing::info;

use crate::config::AsrSettings;
use crate::error::{PipelineError, Result};

/// Utterance audio is 16 kHz mono.
pub const SAMPLE_RATE: u32 = 16_000;

/// Beam width requested from the recognizer.
const BEAM_SIZE: u32 = 5;

/// Recognizer-side VAD filter: minimum silence between sub-segments.
const VAD_MIN_SILENCE_MS: u32 = 500;

/// Recognizer-side VAD filter: padding around detected speech.
const VAD_SPEECH_PAD_MS: u32 = 200;

/// One recognized sub-segment with its average log-probability.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentHypothesis {
    pub text: String,
    pub avg_logprob: f32,
}

/// A speech recognizer reachable from the worker.
#[async_trait]
pub trait RecognizerEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transcribe normalized mono samples in [-1, 1] at 16 kHz.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine call fails; the worker logs and
    /// skips the message.
    async fn transcribe(&self, samples: &[f32]) -> Result<Vec<SegmentHypothesis>>;
}

/// Normalize s16le PCM bytes to f32 samples in [-1, 1].
pub fn normalize_pcm(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Mean confidence across segments: `mean(exp(avg_logprob))`.
pub fn mean_confidence(segments: &[SegmentHypothesis]) -> f32 {
    if segments.is_empty() {
        return 0.0;
    }
    let sum: f32 = segments.iter().map(|s| s.avg_logprob.exp()).sum();
    sum / segments.len() as f32
}

/// Join segment texts into the transcript line.
pub fn joined_text(segments: &[SegmentHypothesis]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whisper-style recognizer driven over HTTP.
///
/// Ships the utterance as a 16 kHz WAV inside a JSON request:
/// `POST {base}/inference {model, language, beam_size, vad_filter,
/// vad_min_silence_ms, vad_speech_pad_ms, audio: <base64 wav>}` and expects
/// `{segments: [{text, avg_logprob}]}` back.
pub struct WhisperHttpEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
    device: String,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    segments: Vec<SegmentHypothesis>,
}

impl WhisperHttpEngine {
    /// Build the engine client from worker settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(settings: &AsrSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Asr(format!("http client: {e}")))?;

        info!(
            model = %settings.whisper_model,
            device = %settings.whisper_device,
            url = %settings.whisper_url,
            "recognizer_configured"
        );

        Ok(Self {
            client,
            base_url: settings.whisper_url.trim_end_matches('/').to_owned(),
            model: settings.whisper_model.clone(),
            device: settings.whisper_device.clone(),
        })
    }
}

#[async_trait]
impl RecognizerEngine for WhisperHttpEngine {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn transcribe(&self, samples: &[f32]) -> Result<Vec<SegmentHypothesis>> {
        let wav = encode_wav_s16(samples, SAMPLE_RATE)?;
        let body = serde_json::json!({
            "model": self.model,
            "device": self.device,
            "language": "en",
            "beam_size": BEAM_SIZE,
            "vad_filter": true,
            "vad_min_silence_ms": VAD_MIN_SILENCE_MS,
            "vad_speech_pad_ms": VAD_SPEECH_PAD_MS,
            "audio": STANDARD.encode(&wav),
        });

        let response = self
            .client
            .post(format!("{}/inference", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Asr(format!("inference request failed: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::Asr(format!("inference status: {e}")))?;

        let parsed: InferenceResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Asr(format!("inference body: {e}")))?;

        Ok(parsed.segments)
    }
}

/// Encode f32 samples as a mono s16 RIFF/WAVE blob.
fn encode_wav_s16(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buf, spec)
            .map_err(|e| PipelineError::Asr(format!("wav header: {e}")))?;
        for &sample in samples {
            let clamped = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer
                .write_sample(clamped)
                .map_err(|e| PipelineError::Asr(format!("wav sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| PipelineError::Asr(format!("wav finalize: {e}")))?;
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_divides_by_32768() {
        let pcm: Vec<u8> = [0i16, 16384, -16384, 32767, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = normalize_pcm(&pcm);
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.5).abs() < 1e-6);
        assert!((samples[2] + 0.5).abs() < 1e-6);
        assert!(samples[3] < 1.0 && samples[3] > 0.999);
        assert_eq!(samples[4], -1.0);
    }

    #[test]
    fn confidence_is_mean_of_exp_logprobs() {
        let segments = vec![
            SegmentHypothesis {
                text: "hello".to_owned(),
                avg_logprob: 0.0,
            },
            SegmentHypothesis {
                text: "there".to_owned(),
                avg_logprob: -1.0,
            },
        ];
        let expected = (1.0 + (-1.0f32).exp()) / 2.0;
        assert!((mean_confidence(&segments) - expected).abs() < 1e-6);
    }

    #[test]
    fn confidence_of_no_segments_is_zero() {
        assert_eq!(mean_confidence(&[]), 0.0);
    }

    #[test]
    fn joined_text_skips_blank_segments() {
        let segments = vec![
            SegmentHypothesis {
                text: " hello ".to_owned(),
                avg_logprob: -0.1,
            },
            SegmentHypothesis {
                text: "   ".to_owned(),
                avg_logprob: -0.2,
            },
            SegmentHypothesis {
                text: "world".to_owned(),
                avg_logprob: -0.3,
            },
        ];
        assert_eq!(joined_text(&segments), "hello world");
    }

    #[test]
    fn wav_blob_carries_riff_header_and_samples() {
        let wav = encode_wav_s16(&[0.0, 0.5, -0.5], SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte canonical header + 3 samples * 2 bytes.
        assert_eq!(wav.len(), 44 + 6);
    }
}
