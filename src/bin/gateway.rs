//! Gateway worker entry point.

use std::process::ExitCode;

use hearth::config::GatewaySettings;
use hearth::metrics::metrics;
use hearth::{gateway, runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match GatewaySettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime::init_tracing(&settings.base);
    metrics().set_service_info(
        "gateway",
        env!("CARGO_PKG_VERSION"),
        if settings.base.is_development() {
            "development"
        } else {
            "production"
        },
    );

    let shutdown = runtime::shutdown_token();
    match gateway::run(&settings, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "gateway_failed");
            ExitCode::FAILURE
        }
    }
}
