//! `intermesh` – runs the interoperability middleware.
//!
//! Startup:
//!
//! 1. Installs tracing (see [`telemetry`]).
//! 2. Loads `~/.intermesh/config.toml`, or the path given as the first
//!    argument. A missing file is created with defaults.
//! 3. Builds the shared context (bus, registry, translation client, bridge
//!    manager) and starts the routing pipeline, which restores persisted
//!    platforms, virtual subscriptions and client subscriptions.
//! 4. Runs until Ctrl-C, then shuts every stage and bridge down.

mod config;
mod context;
mod pipeline;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info, warn};

use crate::context::MiddlewareContext;
use crate::pipeline::Pipeline;

#[tokio::main]
async fn main() -> ExitCode {
    let _telemetry = telemetry::init_tracing("intermesh");

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::config_path);

    let cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            info!(path = %path.display(), "config loaded");
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save_to(&cfg, &path) {
                Ok(()) => info!(path = %path.display(), "no config found; defaults written"),
                Err(e) => warn!(path = %path.display(), error = %e, "cannot write default config"),
            }
            cfg
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "invalid config");
            return ExitCode::FAILURE;
        }
    };
    info!(config = ?cfg, "starting intermesh v{}", env!("CARGO_PKG_VERSION"));

    let ctx = match MiddlewareContext::from_config(&cfg) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "cannot build middleware context");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = match Pipeline::start(&ctx).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "recovery failed");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C; shutting down");
    }
    info!("shutdown requested");
    pipeline.shutdown().await;
    ExitCode::SUCCESS
}
