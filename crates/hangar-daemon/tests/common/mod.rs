// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for daemon integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use hangar_daemon::handlers::DaemonHandlerState;
use hangar_daemon::instance::InstanceRecord;
use hangar_daemon::proxy::ReverseProxy;
use hangar_daemon::registry::InstanceRegistry;
use hangar_daemon::router::{MeshRouter, RouterSettings};
use hangar_daemon::runner::MockRunner;
use hangar_daemon::server;
use tower::ServiceExt;

/// Find a port nothing is listening on.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Router settings with short probe intervals.
pub fn fast_settings() -> RouterSettings {
    RouterSettings {
        load_threshold: 2,
        max_replays: 4,
        healthy_retries: 25,
        healthy_interval: Duration::from_millis(20),
        max_body_bytes: 1024,
    }
}

/// A daemon app wired to mock instances.
pub struct TestMesh {
    pub app: axum::Router,
    pub state: Arc<DaemonHandlerState>,
    pub runner: Arc<MockRunner>,
}

impl TestMesh {
    /// Build a mesh with one instance per `(machine_id, region)` pair.
    ///
    /// The first region listed is the default.
    pub fn new(runner: MockRunner, instances: &[(&str, &str)]) -> Self {
        Self::with_settings(runner, instances, fast_settings(), false)
    }

    pub fn with_settings(
        runner: MockRunner,
        instances: &[(&str, &str)],
        settings: RouterSettings,
        alive_only: bool,
    ) -> Self {
        let runner = Arc::new(runner);
        let control_port = free_port();
        let records = instances
            .iter()
            .map(|(machine, region)| {
                InstanceRecord::new(
                    *machine,
                    *region,
                    free_port(),
                    control_port,
                    "mock",
                    runner.clone(),
                )
            })
            .collect();
        let default_region = instances.first().map(|(_, r)| *r).unwrap_or("syd");
        let registry = Arc::new(InstanceRegistry::from_records(default_region, records));

        let proxy = ReverseProxy::new("127.0.0.1").unwrap();
        let state = Arc::new(DaemonHandlerState {
            router: MeshRouter::new(registry, proxy, settings),
            alive_only,
            start_time: std::time::Instant::now(),
        });

        Self {
            app: server::app(state.clone()),
            state,
            runner,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        self.state.registry()
    }

    pub fn instance(&self, machine_id: &str) -> &Arc<InstanceRecord> {
        self.registry().get(machine_id).unwrap()
    }

    /// Send a request through the daemon app and collect the response.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    /// Serve the daemon app on a real listener, for traffic that needs a
    /// connection of its own such as protocol upgrades.
    pub async fn serve(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.app.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// `GET path` with an optional preferred region.
    pub async fn get(&self, path: &str, region: Option<&str>) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder().uri(path);
        if let Some(region) = region {
            builder = builder.header("fly-prefer-region", region);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }
}
