//! Speech-synthesis engine seam.
//!
//! The neural synthesizer runs out of process and streams raw sample
//! chunks; the driver concatenates them and wraps the result in a RIFF/WAVE
//! container. When no voice engine is reachable the silence engine keeps
//! the downstream contract intact instead of erroring.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::config::TtsSettings;
use crate::error::{PipelineError, Result};

/// Synthesized audio is 22.05 kHz mono.
pub const SAMPLE_RATE: u32 = 22_050;

/// Silence fallback length per character of input text.
const SILENCE_MS_PER_CHAR: u64 = 50;

/// A text-to-speech engine reachable from the worker.
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Synthesize text to mono s16 samples at [`SAMPLE_RATE`].
    ///
    /// # Errors
    ///
    /// Returns an error when synthesis fails; the worker logs and skips.
    async fn synthesize(&self, text: &str) -> Result<Vec<i16>>;
}

/// Piper-style synthesizer driven over HTTP.
///
/// `POST {base}/synthesize {text, voice}` answers with a stream of raw
/// s16le PCM at 22.05 kHz which is concatenated into one utterance.
pub struct PiperHttpEngine {
    client: reqwest::Client,
    base_url: String,
    voice: String,
}

impl PiperHttpEngine {
    /// Build the engine client from worker settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(settings: &TtsSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Tts(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.piper_url.trim_end_matches('/').to_owned(),
            voice: settings.piper_voice.clone(),
        })
    }

    /// Probe the engine; used at startup to decide on the fallback.
    pub async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SynthesisEngine for PiperHttpEngine {
    fn name(&self) -> &'static str {
        "piper"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<i16>> {
        let response = self
            .client
            .post(format!("{}/synthesize", self.base_url))
            .json(&serde_json::json!({ "text": text, "voice": self.voice }))
            .send()
            .await
            .map_err(|e| PipelineError::Tts(format!("synthesize request failed: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::Tts(format!("synthesize status: {e}")))?;

        let mut pcm: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::Tts(format!("synthesize stream: {e}")))?;
            pcm.extend_from_slice(&chunk);
        }

        Ok(pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Fallback engine producing silence sized to the text length.
pub struct SilenceEngine;

#[async_trait]
impl SynthesisEngine for SilenceEngine {
    fn name(&self) -> &'static str {
        "silence"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<i16>> {
        let duration_ms = SILENCE_MS_PER_CHAR * text.chars().count() as u64;
        let samples = (u64::from(SAMPLE_RATE) * duration_ms / 1000) as usize;
        Ok(vec![0i16; samples])
    }
}

/// Pick the synthesis engine: the voice engine when reachable, silence
/// otherwise. Engine unavailability is non-fatal.
pub async fn load_engine(settings: &TtsSettings) -> Result<Box<dyn SynthesisEngine>> {
    let piper = PiperHttpEngine::new(settings)?;
    if piper.health_check().await {
        info!(voice = %settings.piper_voice, url = %settings.piper_url, "tts_engine_ready");
        Ok(Box::new(piper))
    } else {
        warn!(url = %settings.piper_url, "tts_engine_unreachable_using_silence_fallback");
        Ok(Box::new(SilenceEngine))
    }
}

/// Wrap mono s16 samples in a RIFF/WAVE container at [`SAMPLE_RATE`].
pub fn encode_wav(samples: &[i16]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buf, spec)
            .map_err(|e| PipelineError::Tts(format!("wav header: {e}")))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| PipelineError::Tts(format!("wav sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| PipelineError::Tts(format!("wav finalize: {e}")))?;
    }
    Ok(buf.into_inner())
}

/// Playback duration of a sample buffer at [`SAMPLE_RATE`].
pub fn samples_duration_ms(samples: usize) -> u64 {
    (samples as u64) * 1000 / u64::from(SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silence_engine_sizes_output_to_text_length() {
        let engine = SilenceEngine;
        let samples = engine.synthesize("hello").await.unwrap();
        // 5 chars * 50 ms = 250 ms of silence.
        assert_eq!(samples.len(), (22_050 * 250) / 1000);
        assert!(samples.iter().all(|&s| s == 0));
    }

    #[tokio::test]
    async fn silence_engine_handles_empty_text() {
        let engine = SilenceEngine;
        let samples = engine.synthesize("").await.unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn wav_container_is_valid_riff() {
        let samples = vec![0i16, 100, -100, 2000];
        let wav = encode_wav(&samples).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + samples.len() * 2);

        // Readable back with the same codec.
        let mut reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        let back: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(back, samples);
    }

    #[test]
    fn duration_math_matches_sample_rate() {
        assert_eq!(samples_duration_ms(22_050), 1000);
        assert_eq!(samples_duration_ms(11_025), 500);
        assert_eq!(samples_duration_ms(0), 0);
    }
}
