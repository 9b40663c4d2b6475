// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Region router.
//!
//! Picks a region for each inbound request, picks an instance within it
//! (starting one if needed), and follows `fly-replay` answers until some
//! instance produces a final response or the replay budget runs out.
//!
//! Every failure the router decides on itself is answered with an empty
//! body. Instance responses pass through untouched, and a 101 from an
//! instance is spliced to the caller's connection.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use hangar_mesh::{HEADER_PREFER_REGION, ReplayRecord};
use hyper::upgrade::OnUpgrade;
use rand::seq::IndexedRandom;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::instance::InstanceRecord;
use crate::proxy::{ForwardRequest, ProxyOutcome, ReverseProxy, Switching, upgrade_protocol};
use crate::registry::InstanceRegistry;
use crate::selector;

/// Tunables for routing.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Fast path skips instances with this many requests in flight.
    pub load_threshold: usize,
    /// Maximum replays honoured per request.
    pub max_replays: u32,
    /// Probes against a freshly started instance.
    pub healthy_retries: u32,
    /// Delay between probes.
    pub healthy_interval: Duration,
    /// Largest inbound body accepted.
    pub max_body_bytes: usize,
}

impl From<&Config> for RouterSettings {
    fn from(config: &Config) -> Self {
        Self {
            load_threshold: config.load_threshold,
            max_replays: config.max_replays,
            healthy_retries: config.healthy_retries,
            healthy_interval: config.healthy_interval(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Outcome of serving a request within one region.
enum Dispatch {
    Done(Response),
    Switching(Switching),
    Replay {
        origin: Arc<InstanceRecord>,
        payload: String,
    },
}

/// Routes inbound requests to instances.
#[derive(Debug)]
pub struct MeshRouter {
    registry: Arc<InstanceRegistry>,
    proxy: ReverseProxy,
    settings: RouterSettings,
}

impl MeshRouter {
    /// Create a router over `registry`.
    pub fn new(registry: Arc<InstanceRegistry>, proxy: ReverseProxy, settings: RouterSettings) -> Self {
        Self {
            registry,
            proxy,
            settings,
        }
    }

    /// The registry requests are routed over.
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Serve an inbound request.
    ///
    /// The body is buffered so the request can be replayed; bodies over
    /// the configured limit are rejected with 413.
    pub async fn route(&self, mut request: Request) -> Response {
        let inbound = upgrade_protocol(request.headers()).map(|_| hyper::upgrade::on(&mut request));
        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, self.settings.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                warn!(uri = %parts.uri, error = %e, "Rejected request body");
                return empty(StatusCode::PAYLOAD_TOO_LARGE);
            }
        };

        let preferred = parts
            .headers
            .get(HEADER_PREFER_REGION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let forward = ForwardRequest::new(parts.method, path_and_query, parts.headers, body);
        self.serve(&forward, preferred, inbound).await
    }

    /// Serve a prepared request, following replays.
    ///
    /// `inbound` is the caller's side of an upgrade request. Without it a
    /// 101 from an instance cannot be honoured and is answered with 502.
    pub async fn serve(
        &self,
        request: &ForwardRequest,
        preferred_region: Option<String>,
        inbound: Option<OnUpgrade>,
    ) -> Response {
        let mut target = preferred_region;
        let mut source: Option<HeaderValue> = None;
        let mut replays = 0u32;

        loop {
            let Some(region) = self.registry.resolve_region(target.as_deref()) else {
                error!(path = %request.path_and_query, "No instances configured");
                return empty(StatusCode::BAD_GATEWAY);
            };

            let (origin, payload) = match self.dispatch(region, request, source.as_ref()).await {
                Dispatch::Done(response) => return response,
                Dispatch::Switching(switching) => {
                    return match inbound {
                        Some(inbound) => switching.splice(inbound),
                        None => {
                            error!(path = %request.path_and_query, "Instance switched protocols without a caller connection");
                            empty(StatusCode::BAD_GATEWAY)
                        }
                    };
                }
                Dispatch::Replay { origin, payload } => (origin, payload),
            };

            let record = match ReplayRecord::parse(&payload) {
                Ok(record) => record,
                Err(e) => {
                    error!(machine = %origin.machine_id(), payload = %payload, error = %e, "Malformed replay header");
                    return empty(StatusCode::INTERNAL_SERVER_ERROR);
                }
            };

            let unsupported = record.unsupported_fields();
            if !unsupported.is_empty() {
                error!(
                    machine = %origin.machine_id(),
                    payload = %payload,
                    fields = ?unsupported,
                    "Replay fields not supported locally"
                );
                return empty(StatusCode::INTERNAL_SERVER_ERROR);
            }

            replays += 1;
            if replays > self.settings.max_replays {
                error!(
                    path = %request.path_and_query,
                    replays,
                    max = self.settings.max_replays,
                    "Got excessively replayed request"
                );
                return empty(StatusCode::INTERNAL_SERVER_ERROR);
            }

            let src = ReplayRecord {
                instance: Some(origin.machine_id().to_string()),
                region: Some(origin.region().to_string()),
                state: record.state.clone(),
                timestamp: Some(Utc::now().timestamp_micros()),
                ..Default::default()
            };
            source = match src
                .to_header_value()
                .ok()
                .and_then(|v| HeaderValue::from_str(&v).ok())
            {
                Some(value) => Some(value),
                None => {
                    error!(machine = %origin.machine_id(), payload = %payload, "Cannot encode replay source");
                    return empty(StatusCode::INTERNAL_SERVER_ERROR);
                }
            };

            info!(
                from = %origin.machine_id(),
                from_region = %origin.region(),
                to_region = ?record.region,
                replays,
                "Replaying request"
            );
            target = record.region;
        }
    }

    async fn dispatch(
        &self,
        region: &str,
        request: &ForwardRequest,
        source: Option<&HeaderValue>,
    ) -> Dispatch {
        let candidates = selector::rank(self.registry.in_region(region)).await;

        for candidate in candidates
            .iter()
            .filter(|c| c.alive && c.active < self.settings.load_threshold)
        {
            if let Some(dispatch) = self.attempt(&candidate.instance, request, source).await {
                return dispatch;
            }
        }

        for candidate in &candidates {
            let instance = &candidate.instance;
            if !instance.ensure_running().await {
                continue;
            }
            for probe in 1..=self.settings.healthy_retries {
                if let Some(dispatch) = self.attempt(instance, request, source).await {
                    return dispatch;
                }
                debug!(machine = %instance.machine_id(), probe, "Waiting for instance to listen");
                if probe < self.settings.healthy_retries {
                    tokio::time::sleep(self.settings.healthy_interval).await;
                }
            }
            warn!(machine = %instance.machine_id(), "Instance did not become healthy");
        }

        let last_resort = {
            let mut rng = rand::rng();
            candidates.choose(&mut rng).map(|c| c.instance.clone())
        };
        if let Some(instance) = last_resort {
            debug!(machine = %instance.machine_id(), region, "Trying random instance");
            if let Some(dispatch) = self.attempt(&instance, request, source).await {
                return dispatch;
            }
        }

        error!(region, path = %request.path_and_query, "No instance could serve request");
        Dispatch::Done(empty(StatusCode::INTERNAL_SERVER_ERROR))
    }

    /// One proxy attempt. `None` when the instance refused the connection.
    async fn attempt(
        &self,
        instance: &Arc<InstanceRecord>,
        request: &ForwardRequest,
        source: Option<&HeaderValue>,
    ) -> Option<Dispatch> {
        match self.proxy.forward(instance, request, source).await {
            ProxyOutcome::Delivered(response) => Some(Dispatch::Done(response)),
            ProxyOutcome::Switching(switching) => Some(Dispatch::Switching(switching)),
            ProxyOutcome::Replay { payload } => Some(Dispatch::Replay {
                origin: instance.clone(),
                payload,
            }),
            ProxyOutcome::Refused => {
                info!(machine = %instance.machine_id(), region = %instance.region(), "Instance refused connection");
                None
            }
            ProxyOutcome::Failed(_) => Some(Dispatch::Done(empty(StatusCode::BAD_GATEWAY))),
        }
    }
}

fn empty(status: StatusCode) -> Response {
    (status, Body::empty()).into_response()
}
