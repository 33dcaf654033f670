//! Orchestrator worker entry point.

use std::process::ExitCode;

use hearth::config::OrchestratorSettings;
use hearth::metrics::metrics;
use hearth::{orchestrator, runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = OrchestratorSettings::from_env();
    runtime::init_tracing(&settings.base);
    metrics().set_service_info(
        "orchestrator",
        env!("CARGO_PKG_VERSION"),
        if settings.base.is_development() {
            "development"
        } else {
            "production"
        },
    );

    let shutdown = runtime::shutdown_token();
    match orchestrator::run(&settings, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "orchestrator_failed");
            ExitCode::FAILURE
        }
    }
}
