// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reverse proxy to a single instance.
//!
//! Forwards a buffered request to an instance and classifies the result.
//! A response carrying `fly-replay` is never passed through: its body is
//! discarded and the payload handed back to the router.
//!
//! Protocol upgrades (`Connection: upgrade`) keep their `Upgrade` header.
//! When the instance answers 101 the two upgraded connections are spliced
//! together until either side closes.

use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use hangar_mesh::{HEADER_REPLAY, HEADER_REPLAY_SRC};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

use crate::instance::{ActiveRequest, InstanceRecord};

/// Headers that describe a single connection and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// A buffered inbound request, replayable against any number of instances.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// Request method.
    pub method: Method,
    /// Path and query, e.g. `/cart?id=1`.
    pub path_and_query: String,
    /// Headers to forward, already stripped of hop-by-hop headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
    /// Protocol named by `Upgrade` when the caller asked to switch.
    pub upgrade: Option<HeaderValue>,
}

impl ForwardRequest {
    /// Prepare inbound parts for forwarding.
    ///
    /// Drops hop-by-hop headers, `host`, and any caller-supplied
    /// `fly-replay-src`. An upgrade request keeps `Connection: upgrade`
    /// and its `Upgrade` header.
    pub fn new(
        method: Method,
        path_and_query: impl Into<String>,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let upgrade = upgrade_protocol(&headers);
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(HEADER_REPLAY_SRC);
        if let Some(protocol) = &upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol.clone());
        }
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers,
            body,
            upgrade,
        }
    }

    /// Whether the caller asked to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }
}

/// The `Upgrade` value of a request that lists `upgrade` in `Connection`.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    headers.get(header::UPGRADE).cloned()
}

/// Result of one proxy attempt.
#[derive(Debug)]
pub enum ProxyOutcome {
    /// The instance answered; the response is ready to return to the caller.
    Delivered(Response),
    /// The instance agreed to switch protocols.
    Switching(Switching),
    /// The instance asked for the request to be replayed elsewhere.
    Replay {
        /// Raw `fly-replay` header value.
        payload: String,
    },
    /// Nothing listens on the instance's port yet.
    Refused,
    /// Any other transport failure.
    Failed(reqwest::Error),
}

/// HTTP client that forwards requests to instances.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    client: reqwest::Client,
    upstream_host: String,
}

impl ReverseProxy {
    /// Create a proxy that reaches instances on `upstream_host`.
    pub fn new(upstream_host: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            upstream_host: upstream_host.into(),
        })
    }

    /// Base URL of an instance.
    pub fn instance_url(&self, instance: &InstanceRecord) -> String {
        format!("http://{}:{}", self.upstream_host, instance.port())
    }

    /// Forward `request` to `instance`.
    ///
    /// The instance's active-request count stays raised until the returned
    /// response body has been fully streamed or dropped.
    pub async fn forward(
        &self,
        instance: &Arc<InstanceRecord>,
        request: &ForwardRequest,
        replay_src: Option<&HeaderValue>,
    ) -> ProxyOutcome {
        let active = instance.begin_request();

        let url = format!("{}{}", self.instance_url(instance), request.path_and_query);
        let mut headers = request.headers.clone();
        if let Some(src) = replay_src {
            headers.insert(HEADER_REPLAY_SRC, src.clone());
        }

        let result = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await;

        let upstream = match result {
            Ok(response) => response,
            Err(e) if is_connection_refused(&e) => {
                debug!(machine = %instance.machine_id(), %url, "Connection refused");
                return ProxyOutcome::Refused;
            }
            Err(e) => {
                warn!(machine = %instance.machine_id(), %url, error = %e, "Proxy request failed");
                return ProxyOutcome::Failed(e);
            }
        };

        if let Some(value) = upstream.headers().get(HEADER_REPLAY) {
            let payload = String::from_utf8_lossy(value.as_bytes()).into_owned();
            debug!(machine = %instance.machine_id(), payload = %payload, "Instance requested replay");
            return ProxyOutcome::Replay { payload };
        }

        if request.is_upgrade() && upstream.status() == StatusCode::SWITCHING_PROTOCOLS {
            debug!(machine = %instance.machine_id(), "Instance switched protocols");
            return ProxyOutcome::Switching(Switching { upstream, active });
        }

        ProxyOutcome::Delivered(into_response(upstream, active))
    }
}

/// A 101 answer from an instance, waiting for the caller's side of the
/// connection.
#[derive(Debug)]
pub struct Switching {
    upstream: reqwest::Response,
    active: ActiveRequest,
}

impl Switching {
    /// Answer the caller with the instance's 101 and relay bytes between
    /// the two upgraded connections in the background.
    ///
    /// The instance counts the request as active until the relay ends.
    pub fn splice(self, inbound: OnUpgrade) -> Response {
        let Switching { upstream, active } = self;
        let status = upstream.status();
        let headers = upstream.headers().clone();

        tokio::spawn(async move {
            let _active = active;
            let (client, instance) = tokio::join!(inbound, upstream.upgrade());
            let (client, mut instance) = match (client, instance) {
                (Ok(client), Ok(instance)) => (client, instance),
                (Err(e), _) => {
                    warn!(error = %e, "Caller connection did not upgrade");
                    return;
                }
                (_, Err(e)) => {
                    warn!(error = %e, "Instance connection did not upgrade");
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            match tokio::io::copy_bidirectional(&mut client, &mut instance).await {
                Ok((to_instance, to_client)) => {
                    info!(to_instance, to_client, "Upgraded connection closed");
                }
                Err(e) => debug!(error = %e, "Upgraded connection ended with error"),
            }
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

fn into_response(upstream: reqwest::Response, active: ActiveRequest) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let stream = upstream.bytes_stream().map(move |chunk| {
        let _counted = &active;
        chunk
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Whether the request failed because the port had no listener.
fn is_connection_refused(err: &reqwest::Error) -> bool {
    if !err.is_connect() {
        return false;
    }
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::ConnectionRefused
        {
            return true;
        }
        source = e.source();
    }
    false
}
