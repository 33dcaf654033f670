//! TTS worker entry point.

use std::process::ExitCode;

use hearth::config::TtsSettings;
use hearth::metrics::metrics;
use hearth::{runtime, tts};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = TtsSettings::from_env();
    runtime::init_tracing(&settings.base);
    metrics().set_service_info(
        "tts",
        env!("CARGO_PKG_VERSION"),
        if settings.base.is_development() {
            "development"
        } else {
            "production"
        },
    );

    let shutdown = runtime::shutdown_token();
    match tts::run(&settings, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "tts_worker_failed");
            ExitCode::FAILURE
        }
    }
}
