//! Prometheus metrics shared by the pipeline workers.
//!
//! The registry is a process-wide singleton built once at worker startup.
//! Only the Gateway serves an exposition endpoint; the other workers record
//! into their own process registry for debugging and tests.

use std::sync::OnceLock;

use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// All pipeline metrics, registered against one [`Registry`].
pub struct Metrics {
    registry: Registry,
    /// End-to-end latency from audio receipt to response send, per device.
    pub pipeline_latency_ms: HistogramVec,
    /// Per-stage processing latencies.
    pub vad_latency_ms: Histogram,
    pub asr_latency_ms: Histogram,
    pub llm_latency_ms: HistogramVec,
    pub tts_latency_ms: Histogram,
    /// Recognizer confidence distribution.
    pub asr_confidence: Histogram,
    /// Completion tokens consumed, per model.
    pub llm_tokens_used: IntCounterVec,
    /// Static-fallback responses served, per reason.
    pub llm_fallback_count: IntCounterVec,
    /// Inbound audio chunks accepted by the gateway, per device.
    pub audio_chunks_received: IntCounterVec,
    /// Currently connected device sessions (0 or 1).
    pub active_sessions: IntGauge,
    /// Health of named components (1 healthy, 0 unhealthy).
    pub component_health: GaugeVec,
    /// Static service identity (value always 1).
    pub service_info: GaugeVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let pipeline_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "hearth_pipeline_latency_ms",
                "End-to-end latency from audio receipt to response send",
            )
            .buckets(vec![
                100.0, 250.0, 500.0, 800.0, 1200.0, 2000.0, 5000.0, 10000.0,
            ]),
            &["device_id"],
        )
        .expect("metric definition is valid");

        let vad_latency_ms = Histogram::with_opts(HistogramOpts::new(
            "hearth_vad_latency_ms",
            "Per-chunk voice activity detection latency",
        ))
        .expect("metric definition is valid");

        let asr_latency_ms = Histogram::with_opts(HistogramOpts::new(
            "hearth_asr_latency_ms",
            "Per-utterance transcription latency",
        ))
        .expect("metric definition is valid");

        let llm_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "hearth_llm_latency_ms",
                "Per-request language model latency",
            )
            .buckets(vec![100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 15000.0]),
            &["model", "backend"],
        )
        .expect("metric definition is valid");

        let tts_latency_ms = Histogram::with_opts(HistogramOpts::new(
            "hearth_tts_latency_ms",
            "Per-sentence speech synthesis latency",
        ))
        .expect("metric definition is valid");

        let asr_confidence = Histogram::with_opts(
            HistogramOpts::new(
                "hearth_asr_confidence",
                "Mean recognizer confidence per transcript",
            )
            .buckets(vec![0.1, 0.25, 0.5, 0.7, 0.85, 0.95, 1.0]),
        )
        .expect("metric definition is valid");

        let llm_tokens_used = IntCounterVec::new(
            Opts::new("hearth_llm_tokens_used", "Completion tokens consumed"),
            &["model"],
        )
        .expect("metric definition is valid");

        let llm_fallback_count = IntCounterVec::new(
            Opts::new(
                "hearth_llm_fallback_count",
                "Static fallback responses served",
            ),
            &["reason"],
        )
        .expect("metric definition is valid");

        let audio_chunks_received = IntCounterVec::new(
            Opts::new(
                "hearth_audio_chunks_received",
                "Inbound audio chunks accepted by the gateway",
            ),
            &["device_id"],
        )
        .expect("metric definition is valid");

        let active_sessions = IntGauge::new(
            "hearth_active_sessions",
            "Currently connected device sessions",
        )
        .expect("metric definition is valid");

        let component_health = GaugeVec::new(
            Opts::new("hearth_component_health", "Component health (1 = healthy)"),
            &["component"],
        )
        .expect("metric definition is valid");

        let service_info = GaugeVec::new(
            Opts::new("hearth_service_info", "Service identity"),
            &["service", "version", "environment"],
        )
        .expect("metric definition is valid");

        for metric in [
            Box::new(pipeline_latency_ms.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(vad_latency_ms.clone()),
            Box::new(asr_latency_ms.clone()),
            Box::new(llm_latency_ms.clone()),
            Box::new(tts_latency_ms.clone()),
            Box::new(asr_confidence.clone()),
            Box::new(llm_tokens_used.clone()),
            Box::new(llm_fallback_count.clone()),
            Box::new(audio_chunks_received.clone()),
            Box::new(active_sessions.clone()),
            Box::new(component_health.clone()),
            Box::new(service_info.clone()),
        ] {
            registry.register(metric).expect("metric definition is valid");
        }

        Self {
            registry,
            pipeline_latency_ms,
            vad_latency_ms,
            asr_latency_ms,
            llm_latency_ms,
            tts_latency_ms,
            asr_confidence,
            llm_tokens_used,
            llm_fallback_count,
            audio_chunks_received,
            active_sessions,
            component_health,
            service_info,
        }
    }

    /// Record the identity of the running worker.
    pub fn set_service_info(&self, service: &str, version: &str, environment: &str) {
        self.service_info
            .with_label_values(&[service, version, environment])
            .set(1.0);
    }

    /// Flag a named component healthy or unhealthy.
    pub fn set_component_health(&self, component: &str, healthy: bool) {
        self.component_health
            .with_label_values(&[component])
            .set(if healthy { 1.0 } else { 0.0 });
    }

    /// Record a completed end-to-end pipeline pass.
    pub fn record_pipeline_latency(&self, device_id: &str, latency_ms: f64) {
        self.pipeline_latency_ms
            .with_label_values(&[device_id])
            .observe(latency_ms);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Process-wide metrics handle, built on first use.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_renders_registered_metrics() {
        let m = metrics();
        m.set_service_info("test", "0.1.0", "development");
        m.set_component_health("redis", true);
        m.record_pipeline_latency("companion-001", 420.0);
        let text = m.render();
        assert!(text.contains("hearth_pipeline_latency_ms"));
        assert!(text.contains("hearth_component_health"));
        assert!(text.contains("hearth_service_info"));
    }

    #[test]
    fn component_health_flips_between_states() {
        let m = metrics();
        m.set_component_health("engine", true);
        m.set_component_health("engine", false);
        let text = m.render();
        assert!(text.contains("hearth_component_health{component=\"engine\"} 0"));
    }
}
