// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar - local multi-region mesh daemon.
//!
//! Runs `HANGAR_PACKAGE` as several instances spread over virtual regions
//! and routes HTTP traffic between them.

use std::sync::Arc;
use tracing::{info, warn};

use hangar_daemon::config::Config;
use hangar_daemon::runner::{ProcessRunner, Runner};
use hangar_daemon::runtime::DaemonRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hangar_daemon=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        package = %config.package,
        port = config.port,
        count = config.count,
        regions = ?config.regions,
        "Starting Hangar"
    );

    let runner = Arc::new(ProcessRunner::new());
    info!(runner_type = runner.runner_type(), "Runner initialized");

    let runtime = DaemonRuntime::builder()
        .config(config)
        .runner(runner)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Hangar ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Hangar shut down");

    Ok(())
}
