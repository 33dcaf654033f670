//! Per-chunk speech detection.
//!
//! The primary detector is a neural model producing a speech probability;
//! when no model is available the detector falls back to RMS energy
//! thresholding, which is robust enough for close-mic capture.

use tracing::{debug, info};

use crate::error::Result;

/// Probability threshold above which a chunk counts as speech.
pub const SPEECH_PROBABILITY_THRESHOLD: f32 = 0.5;

/// RMS energy above this value counts as speech (s16 sample domain).
pub const ENERGY_SPEECH_THRESHOLD: f32 = 800.0;

/// RMS value mapped to probability 1.0 in the energy fallback.
const ENERGY_PROBABILITY_CEILING: f32 = 5000.0;

/// A neural voice-activity model. Implementations run out of process or
/// behind their own inference runtime; the worker only needs a probability.
pub trait SpeechModel: Send {
    /// Speech probability in [0, 1] for one 16 kHz mono s16le chunk.
    ///
    /// # Errors
    ///
    /// Returns an error when inference fails; the detector degrades the
    /// chunk to silence.
    fn speech_probability(&mut self, samples: &[i16]) -> Result<f32>;
}

/// Outcome of detection on one chunk.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub is_speech: bool,
    pub probability: f32,
}

/// Chunk classifier combining the neural model with the energy fallback.
pub struct SpeechDetector {
    model: Option<Box<dyn SpeechModel>>,
    threshold: f32,
}

impl SpeechDetector {
    pub fn new(model: Option<Box<dyn SpeechModel>>) -> Self {
        if model.is_none() {
            info!("no neural VAD model available, using energy detection");
        }
        Self {
            model,
            threshold: SPEECH_PROBABILITY_THRESHOLD,
        }
    }

    /// Classify one PCM chunk.
    pub fn detect(&mut self, pcm: &[u8]) -> Detection {
        let samples = decode_s16le(pcm);

        if let Some(model) = self.model.as_mut() {
            return match model.speech_probability(&samples) {
                Ok(probability) => Detection {
                    is_speech: probability >= self.threshold,
                    probability,
                },
                Err(e) => {
                    // A failed inference must not stall the stream; treat
                    // the chunk as silence.
                    debug!(error = %e, "vad_inference_failed");
                    Detection {
                        is_speech: false,
                        probability: 0.0,
                    }
                }
            };
        }

        let rms = rms_energy(&samples);
        Detection {
            is_speech: rms > ENERGY_SPEECH_THRESHOLD,
            probability: (rms / ENERGY_PROBABILITY_CEILING).min(1.0),
        }
    }
}

/// Load the neural VAD model if one is available.
///
/// Model load failure is non-fatal; the worker runs on energy detection.
/// Silero-style ONNX integration plugs in here.
pub fn load_model() -> Option<Box<dyn SpeechModel>> {
    info!("neural VAD model not configured, falling back to energy detection");
    None
}

/// Decode little-endian signed-16 PCM bytes. A trailing odd byte is ignored.
pub fn decode_s16le(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// RMS energy over s16 samples.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn pcm_of(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn silence_has_zero_energy() {
        assert_eq!(rms_energy(&[0; 1600]), 0.0);
        assert_eq!(rms_energy(&[]), 0.0);
    }

    #[test]
    fn loud_tone_clears_energy_threshold() {
        let samples = vec![4000i16; 1600];
        let mut detector = SpeechDetector::new(None);
        let detection = detector.detect(&pcm_of(&samples));
        assert!(detection.is_speech);
        assert!((detection.probability - 0.8).abs() < 0.01);
    }

    #[test]
    fn quiet_noise_stays_below_threshold() {
        let samples = vec![100i16; 1600];
        let mut detector = SpeechDetector::new(None);
        let detection = detector.detect(&pcm_of(&samples));
        assert!(!detection.is_speech);
        assert!(detection.probability < 0.05);
    }

    #[test]
    fn probability_saturates_at_one() {
        let samples = vec![20_000i16; 1600];
        let mut detector = SpeechDetector::new(None);
        let detection = detector.detect(&pcm_of(&samples));
        assert_eq!(detection.probability, 1.0);
    }

    struct FixedModel(f32);
    impl SpeechModel for FixedModel {
        fn speech_probability(&mut self, _samples: &[i16]) -> crate::error::Result<f32> {
            Ok(self.0)
        }
    }

    struct BrokenModel;
    impl SpeechModel for BrokenModel {
        fn speech_probability(&mut self, _samples: &[i16]) -> crate::error::Result<f32> {
            Err(PipelineError::Vad("inference failed".to_owned()))
        }
    }

    #[test]
    fn model_probability_drives_decision() {
        let mut detector = SpeechDetector::new(Some(Box::new(FixedModel(0.7))));
        let detection = detector.detect(&pcm_of(&[0i16; 1600]));
        assert!(detection.is_speech);
        assert_eq!(detection.probability, 0.7);

        let mut detector = SpeechDetector::new(Some(Box::new(FixedModel(0.49))));
        assert!(!detector.detect(&pcm_of(&[0i16; 1600])).is_speech);
    }

    #[test]
    fn model_error_degrades_chunk_to_silence() {
        let mut detector = SpeechDetector::new(Some(Box::new(BrokenModel)));
        let detection = detector.detect(&pcm_of(&[20_000i16; 1600]));
        assert!(!detection.is_speech);
        assert_eq!(detection.probability, 0.0);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let samples = decode_s16le(&[0x01, 0x02, 0xff]);
        assert_eq!(samples, vec![0x0201]);
    }
}
