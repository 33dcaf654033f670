//! LLM worker entry point.

use std::process::ExitCode;

use hearth::config::LlmSettings;
use hearth::metrics::metrics;
use hearth::{llm, runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = LlmSettings::from_env();
    runtime::init_tracing(&settings.base);
    metrics().set_service_info(
        "llm",
        env!("CARGO_PKG_VERSION"),
        if settings.base.is_development() {
            "development"
        } else {
            "production"
        },
    );

    let shutdown = runtime::shutdown_token();
    match llm::run(&settings, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "llm_worker_failed");
            ExitCode::FAILURE
        }
    }
}
