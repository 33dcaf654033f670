//! ASR worker entry point.

use std::process::ExitCode;

use hearth::config::AsrSettings;
use hearth::metrics::metrics;
use hearth::{asr, runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = AsrSettings::from_env();
    runtime::init_tracing(&settings.base);
    metrics().set_service_info(
        "asr",
        env!("CARGO_PKG_VERSION"),
        if settings.base.is_development() {
            "development"
        } else {
            "production"
        },
    );

    let shutdown = runtime::shutdown_token();
    match asr::run(&settings, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "asr_worker_failed");
            ExitCode::FAILURE
        }
    }
}
