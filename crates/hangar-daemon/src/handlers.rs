// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers.
//!
//! Paths under `/__/` belong to the daemon. Everything else is routed to
//! instances.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use hangar_mesh::ControlInfo;
use serde::Deserialize;
use tracing::{debug, info};

use crate::registry::InstanceRegistry;
use crate::router::MeshRouter;

/// Shared state for daemon handlers.
#[derive(Debug)]
pub struct DaemonHandlerState {
    /// Router for instance traffic.
    pub router: MeshRouter,
    /// Control endpoint lists only live instances.
    pub alive_only: bool,
    /// When the daemon started.
    pub start_time: std::time::Instant,
}

impl DaemonHandlerState {
    /// The instance registry.
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        self.router.registry()
    }
}

/// Query of the control endpoint.
#[derive(Debug, Deserialize)]
pub struct ControlQuery {
    /// Machine ID of the caller, excluded from the answer.
    pub machine: Option<String>,
}

/// `/__/control?machine=<id>`: peer list for an instance. Any method.
pub async fn handle_control(
    State(state): State<Arc<DaemonHandlerState>>,
    Query(query): Query<ControlQuery>,
) -> Json<ControlInfo> {
    let mut info = ControlInfo::empty_now();
    for instance in state.registry().all() {
        if query.machine.as_deref() == Some(instance.machine_id()) {
            continue;
        }
        if state.alive_only && !instance.is_alive().await {
            continue;
        }
        info.instances.push(instance.info());
    }

    debug!(
        machine = ?query.machine,
        peers = info.instances.len(),
        "Served control request"
    );
    Json(info)
}

/// `/__/start`: start every instance that is not running. Any method.
pub async fn handle_start(State(state): State<Arc<DaemonHandlerState>>) -> Json<String> {
    let registry = state.registry();
    let started = registry.start_all().await;
    info!(started, total = registry.all().len(), "Start requested");
    Json(format!("ok, started {}/{}", started, registry.all().len()))
}

/// Any other path under `/__/`.
pub async fn handle_unknown_control() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Everything outside `/__/`.
pub async fn handle_route(
    State(state): State<Arc<DaemonHandlerState>>,
    request: Request,
) -> Response {
    state.router.route(request).await
}
