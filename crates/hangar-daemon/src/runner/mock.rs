// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Serves an in-process axum app on the instance's port instead of spawning
//! a process. The app is built per launch from the launch options, so each
//! fake instance knows its own machine ID and region.

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::traits::*;

/// Builds the app a fake instance serves.
pub type AppFactory = Arc<dyn Fn(&LaunchOptions) -> Router + Send + Sync>;

/// Mock runner for testing.
pub struct MockRunner {
    app: AppFactory,
    bind_ip: IpAddr,
    /// Delay between launch and the fake instance accepting connections
    pub startup_delay: Duration,
    /// If true, launched instances never start listening
    pub never_listen: bool,
    /// If true, every launch fails
    pub fail_launch: bool,
    launches: AtomicUsize,
    running: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl MockRunner {
    /// Create a mock runner serving the app built by `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&LaunchOptions) -> Router + Send + Sync + 'static,
    {
        Self {
            app: Arc::new(factory),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            startup_delay: Duration::ZERO,
            never_listen: false,
            fail_launch: false,
            launches: AtomicUsize::new(0),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Create a mock runner whose instances never accept connections.
    pub fn never_listening() -> Self {
        Self {
            never_listen: true,
            ..Self::new(|_| Router::new())
        }
    }

    /// Create a mock runner whose launches always fail.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new(|_| Router::new())
        }
    }

    /// Delay accepting connections after each launch.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Number of launches attempted so far.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Make a running fake instance exit.
    ///
    /// Returns false if no instance with that machine ID is running.
    pub fn exit_instance(&self, machine_id: &str) -> bool {
        let sender = match self.running.lock() {
            Ok(mut running) => running.remove(machine_id),
            Err(_) => None,
        };
        sender.is_some_and(|tx| tx.send(()).is_ok())
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Launched> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        if self.fail_launch {
            return Err(RunnerError::StartFailed("mock launch failure".to_string()));
        }

        let (tx, rx) = oneshot::channel::<()>();
        self.running
            .lock()
            .map_err(|_| RunnerError::Other("mock state poisoned".to_string()))?
            .insert(options.machine_id.clone(), tx);

        let app = (self.app)(options);
        let addr = SocketAddr::new(self.bind_ip, options.port);
        let delay = self.startup_delay;
        let never_listen = self.never_listen;
        let machine_id = options.machine_id.clone();

        let server = tokio::spawn(async move {
            if never_listen {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(delay).await;
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    debug!(machine = %machine_id, %addr, "Mock instance listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        warn!(machine = %machine_id, error = %e, "Mock instance failed");
                    }
                }
                Err(e) => warn!(machine = %machine_id, %addr, error = %e, "Mock instance bind failed"),
            }
        });

        let exit = Box::pin(async move {
            let _ = rx.await;
            server.abort();
            Some(0)
        });

        Ok(Launched {
            pid: None,
            started_at: Utc::now(),
            exit,
        })
    }
}
