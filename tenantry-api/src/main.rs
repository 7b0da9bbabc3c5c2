//! `tenantry-server`: the control plane as a standalone process.
//!
//! Configuration comes from `TENANTRY_*` environment variables, an optional
//! `.env` file and an optional config file given as the first argument.

use std::path::PathBuf;
use std::process::ExitCode;
use tenantry_config::ControlPlaneConfig;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tenantry_log::init_from_env();

    let file = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match ControlPlaneConfig::load(file.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store_backend,
        "Starting tenantry control plane"
    );

    match tenantry_api::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Control plane exited with an error");
            ExitCode::FAILURE
        }
    }
}
