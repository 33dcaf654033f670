//! VAD worker entry point.

use std::process::ExitCode;

use hearth::config::Settings;
use hearth::metrics::metrics;
use hearth::{runtime, vad};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = Settings::from_env();
    runtime::init_tracing(&settings);
    metrics().set_service_info(
        "vad",
        env!("CARGO_PKG_VERSION"),
        if settings.is_development() {
            "development"
        } else {
            "production"
        },
    );

    let shutdown = runtime::shutdown_token();
    match vad::run(&settings, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "vad_worker_failed");
            ExitCode::FAILURE
        }
    }
}
