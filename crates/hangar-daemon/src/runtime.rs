// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hangar-daemon.
//!
//! [`DaemonRuntime`] runs the front-facing server inside an existing tokio
//! application, which is how the binary and the integration tests use it.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hangar_daemon::{Config, DaemonRuntime, runner::ProcessRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = DaemonRuntime::builder()
//!         .config(Config::from_env()?)
//!         .runner(Arc::new(ProcessRunner::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handlers::DaemonHandlerState;
use crate::proxy::ReverseProxy;
use crate::registry::InstanceRegistry;
use crate::router::{MeshRouter, RouterSettings};
use crate::runner::Runner;
use crate::server;

/// Builder for creating a [`DaemonRuntime`].
#[derive(Default)]
pub struct DaemonRuntimeBuilder {
    config: Option<Config>,
    runner: Option<Arc<dyn Runner>>,
}

impl DaemonRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the daemon configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the runner used to launch instances.
    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if a field is missing or the config is invalid.
    pub fn build(self) -> Result<DaemonRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| Error::Other("config is required".to_string()))?;
        let runner = self
            .runner
            .ok_or_else(|| Error::Other("runner is required".to_string()))?;
        config.validate()?;

        Ok(DaemonRuntimeConfig { config, runner })
    }
}

/// Validated configuration for a [`DaemonRuntime`].
pub struct DaemonRuntimeConfig {
    config: Config,
    runner: Arc<dyn Runner>,
}

impl DaemonRuntimeConfig {
    /// Bind the server, spawn it, and start instances if configured to.
    pub async fn start(self) -> Result<DaemonRuntime> {
        let config = self.config;
        let registry = Arc::new(InstanceRegistry::from_config(&config, self.runner.clone()));
        let proxy = ReverseProxy::new(config.upstream_host.clone())?;
        let router = MeshRouter::new(registry.clone(), proxy, RouterSettings::from(&config));

        let state = Arc::new(DaemonHandlerState {
            router,
            alive_only: config.alive_only,
            start_time: std::time::Instant::now(),
        });

        let listener = server::bind(config.bind_addr()).await?;
        let bind_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(server::run_daemon_server(
            listener,
            state.clone(),
            async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            },
        ));

        for instance in registry.all() {
            info!(
                machine = %instance.machine_id(),
                region = %instance.region(),
                port = instance.port(),
                "Instance configured"
            );
        }

        if config.start_all {
            registry.start_all().await;
        }

        info!(
            bind_addr = %bind_addr,
            runner = self.runner.runner_type(),
            instances = registry.all().len(),
            default_region = %registry.default_region(),
            "DaemonRuntime started"
        );

        Ok(DaemonRuntime {
            server_handle,
            shutdown_tx,
            state,
            bind_addr,
        })
    }
}

/// A running daemon.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct DaemonRuntime {
    server_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<DaemonHandlerState>,
    bind_addr: SocketAddr,
}

impl DaemonRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> DaemonRuntimeBuilder {
        DaemonRuntimeBuilder::new()
    }

    /// Address the server is listening on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Shared handler state.
    pub fn state(&self) -> &Arc<DaemonHandlerState> {
        &self.state
    }

    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Stop accepting requests, wait for in-flight ones, then terminate
    /// every running instance.
    pub async fn shutdown(self) -> Result<()> {
        info!("DaemonRuntime shutting down...");
        let _ = self.shutdown_tx.send(true);

        let result = match self.server_handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Daemon server task panicked: {}", e);
                Err(Error::Other(format!("server task panicked: {}", e)))
            }
        };

        self.state.registry().stop_all().await;
        info!(uptime_secs = self.state.start_time.elapsed().as_secs(), "DaemonRuntime shutdown complete");
        result
    }
}
