// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Front-facing HTTP server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::any;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Result;
use crate::handlers::{
    DaemonHandlerState, handle_control, handle_route, handle_start, handle_unknown_control,
};

/// Build the daemon's axum app.
pub fn app(state: Arc<DaemonHandlerState>) -> Router {
    Router::new()
        .route("/__/control", any(handle_control))
        .route("/__/start", any(handle_start))
        .route("/__", any(handle_unknown_control))
        .route("/__/", any(handle_unknown_control))
        .route("/__/{*rest}", any(handle_unknown_control))
        .fallback(handle_route)
        .with_state(state)
}

/// Bind the front-facing listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Daemon HTTP server listening");
    Ok(listener)
}

/// Serve `state` on `listener` until `shutdown` completes.
///
/// In-flight requests are allowed to finish. A caller that disconnects
/// drops its request future, which cancels any outstanding proxy call.
pub async fn run_daemon_server<F>(
    listener: TcpListener,
    state: Arc<DaemonHandlerState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Daemon HTTP server stopped");
    Ok(())
}
