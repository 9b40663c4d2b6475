// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing, cold start and replay through the daemon app.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hangar_daemon::router::RouterSettings;
use hangar_daemon::runner::{LaunchOptions, MockRunner};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::{TestMesh, fast_settings};

// ============================================================================
// Mock instance apps
// ============================================================================

/// Answers with `<machine>@<region>`.
fn echo_app(options: &LaunchOptions) -> Router {
    let body = format!("{}@{}", options.machine_id, options.region);
    Router::new().fallback(move || {
        let body = body.clone();
        async move { body }
    })
}

/// Instances in `from` ask for a replay with `payload`; the rest answer with
/// `<machine>@<region> src=<fly-replay-src or none>`.
fn replaying_app(
    from: &'static str,
    payload: &'static str,
    hits: Arc<AtomicUsize>,
) -> impl Fn(&LaunchOptions) -> Router + Send + Sync + 'static {
    move |options: &LaunchOptions| {
        let hits = hits.clone();
        let replays = options.region == from;
        let me = format!("{}@{}", options.machine_id, options.region);
        Router::new().fallback(move |headers: HeaderMap| {
            let hits = hits.clone();
            let me = me.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                if replays {
                    return ([("fly-replay", payload)], "replay body is discarded").into_response();
                }
                let src = headers
                    .get("fly-replay-src")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string();
                format!("{} src={}", me, src).into_response()
            }
        })
    }
}

fn three_regions() -> [(&'static str, &'static str); 3] {
    [("0000000a", "syd"), ("0000000b", "ord"), ("0000000c", "ams")]
}

/// Switches to any protocol it is asked for and echoes bytes back. The 101
/// reports the `Upgrade` value the instance received in `x-seen-upgrade`.
fn upgrade_echo_app(_: &LaunchOptions) -> Router {
    Router::new().fallback(|mut request: axum::extract::Request| async move {
        let Some(protocol) = request.headers().get("upgrade").cloned() else {
            return (StatusCode::OK, "upgrade=None").into_response();
        };
        let on_upgrade = hyper::upgrade::on(&mut request);
        tokio::spawn(async move {
            let upgraded = TokioIo::new(on_upgrade.await.unwrap());
            let (mut reader, mut writer) = tokio::io::split(upgraded);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header("connection", "upgrade")
            .header("upgrade", protocol.clone())
            .header("x-seen-upgrade", protocol)
            .body(Body::empty())
            .unwrap()
    })
}

/// Raw TCP backend on `port`. Each connection is read once and then held
/// open for up to `hold` before being closed unanswered.
///
/// Returns the number of accepted connections and the number the peer
/// closed while they were held.
async fn silent_backend(port: u16, hold: Duration) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let abandoned = Arc::new(AtomicUsize::new(0));
    let (accepts, hangups) = (accepted.clone(), abandoned.clone());
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            accepts.fetch_add(1, Ordering::SeqCst);
            let hangups = hangups.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                if let Ok(Ok(0)) = tokio::time::timeout(hold, stream.read(&mut buf)).await {
                    hangups.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });
    (accepted, abandoned)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Region selection and cold start
// ============================================================================

#[tokio::test]
async fn test_cold_start_in_preferred_region() {
    let runner = MockRunner::new(echo_app).with_startup_delay(Duration::from_millis(60));
    let mesh = TestMesh::new(runner, &three_regions());

    let (status, _, body) = mesh.get("/", Some("ord")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "0000000b@ord");
    assert_eq!(mesh.runner.launch_count(), 1);
    assert!(mesh.instance("0000000b").is_alive().await);
    assert!(!mesh.instance("0000000a").is_alive().await);
}

#[tokio::test]
async fn test_warm_instance_is_reused() {
    let mesh = TestMesh::new(MockRunner::new(echo_app), &three_regions());

    for _ in 0..3 {
        let (status, _, body) = mesh.get("/", Some("ams")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "0000000c@ams");
    }
    assert_eq!(mesh.runner.launch_count(), 1);
}

#[tokio::test]
async fn test_missing_or_unknown_region_uses_default() {
    let mesh = TestMesh::new(MockRunner::new(echo_app), &three_regions());

    let (_, _, body) = mesh.get("/", None).await;
    assert_eq!(body, "0000000a@syd");

    let (_, _, body) = mesh.get("/", Some("lhr")).await;
    assert_eq!(body, "0000000a@syd");

    let (_, _, body) = mesh.get("/", Some("ORD")).await;
    assert_eq!(body, "0000000b@ord");
}

#[tokio::test]
async fn test_no_instance_listening_is_500() {
    let settings = RouterSettings {
        healthy_retries: 3,
        healthy_interval: Duration::from_millis(5),
        ..fast_settings()
    };
    let instances = [("0000000a", "syd"), ("0000000b", "syd"), ("0000000c", "ord")];
    let mesh = TestMesh::with_settings(MockRunner::never_listening(), &instances, settings, false);

    let (status, headers, body) = mesh.get("/", Some("syd")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.is_empty());
    assert!(headers.get("fly-replay").is_none());
    // Both syd instances were started and probed; ord was left alone.
    assert_eq!(mesh.runner.launch_count(), 2);
    assert!(!mesh.instance("0000000c").is_alive().await);
}

#[tokio::test]
async fn test_failed_launch_falls_through_to_500() {
    let settings = RouterSettings {
        healthy_retries: 2,
        healthy_interval: Duration::from_millis(5),
        ..fast_settings()
    };
    let mesh = TestMesh::with_settings(MockRunner::failing(), &three_regions(), settings, false);

    let (status, _, body) = mesh.get("/", Some("syd")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.is_empty());
    assert!(!mesh.instance("0000000a").is_alive().await);
}

// ============================================================================
// Pass-through
// ============================================================================

#[tokio::test]
async fn test_response_passes_through_untouched() {
    let runner = MockRunner::new(|_: &LaunchOptions| {
        Router::new().fallback(|| async {
            (StatusCode::IM_A_TEAPOT, [("x-custom", "kept")], "short and stout")
        })
    });
    let mesh = TestMesh::new(runner, &three_regions());

    let (status, headers, body) = mesh.get("/pot?size=small", None).await;
    assert_eq!(status, StatusCode::IM_A_TEAPOT);
    assert_eq!(headers["x-custom"], "kept");
    assert_eq!(body, "short and stout");
}

#[tokio::test]
async fn test_request_is_forwarded_with_path_and_body() {
    let runner = MockRunner::new(|_: &LaunchOptions| {
        Router::new().fallback(|request: axum::extract::Request| async move {
            let (parts, body) = request.into_parts();
            let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
            format!(
                "{} {} {}",
                parts.method,
                parts.uri,
                String::from_utf8_lossy(&body)
            )
        })
    });
    let mesh = TestMesh::new(runner, &three_regions());

    let request = Request::post("/cart?id=7")
        .header("content-type", "text/plain")
        .body(Body::from("two apples"))
        .unwrap();
    let (status, _, body) = mesh.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "POST /cart?id=7 two apples");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let mesh = TestMesh::new(MockRunner::new(echo_app), &three_regions());

    let request = Request::post("/")
        .body(Body::from(vec![b'x'; 4096]))
        .unwrap();
    let (status, _, _) = mesh.send(request).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(mesh.runner.launch_count(), 0);
}

#[tokio::test]
async fn test_active_requests_return_to_zero() {
    let mesh = TestMesh::new(MockRunner::new(echo_app), &three_regions());

    for _ in 0..3 {
        mesh.get("/", Some("syd")).await;
    }
    for instance in mesh.registry().all() {
        assert_eq!(instance.active_requests(), 0);
    }
}

#[tokio::test]
async fn test_caller_supplied_replay_source_is_dropped() {
    let hits = Arc::new(AtomicUsize::new(0));
    let runner = MockRunner::new(replaying_app("none", "", hits));
    let mesh = TestMesh::new(runner, &three_regions());

    let request = Request::get("/")
        .header("fly-replay-src", "instance=forged;region=lhr")
        .body(Body::empty())
        .unwrap();
    let (_, _, body) = mesh.send(request).await;

    assert_eq!(body, "0000000a@syd src=none");
}

#[tokio::test]
async fn test_dropped_connection_is_502() {
    let mesh = TestMesh::new(MockRunner::never_listening(), &[("0000000a", "syd")]);
    let instance = mesh.instance("0000000a").clone();
    let (accepted, _) = silent_backend(instance.port(), Duration::ZERO).await;

    let (status, headers, body) = mesh.get("/", None).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.is_empty());
    assert!(headers.get("fly-replay").is_none());
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(mesh.runner.launch_count(), 1);
    assert_eq!(instance.active_requests(), 0);
}

// ============================================================================
// Caller going away
// ============================================================================

#[tokio::test]
async fn test_abandoned_request_stops_probing() {
    let settings = RouterSettings {
        healthy_retries: 1000,
        healthy_interval: Duration::from_millis(10),
        ..fast_settings()
    };
    let mesh = TestMesh::with_settings(
        MockRunner::never_listening(),
        &[("0000000a", "syd")],
        settings,
        false,
    );
    let instance = mesh.instance("0000000a").clone();

    let abandoned = tokio::time::timeout(Duration::from_millis(100), mesh.get("/", None)).await;
    assert!(abandoned.is_err());
    assert_eq!(instance.active_requests(), 0);

    // Had probing continued, it would reach this listener within one interval.
    let (accepted, _) = silent_backend(instance.port(), Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
    assert_eq!(mesh.runner.launch_count(), 1);
}

#[tokio::test]
async fn test_abandoned_request_closes_instance_connection() {
    let mesh = TestMesh::new(MockRunner::never_listening(), &[("0000000a", "syd")]);
    let instance = mesh.instance("0000000a").clone();
    instance.ensure_running().await;
    let (accepted, hung_up) = silent_backend(instance.port(), Duration::from_secs(5)).await;

    let abandoned = tokio::time::timeout(Duration::from_millis(200), mesh.get("/", None)).await;
    assert!(abandoned.is_err());
    assert_eq!(instance.active_requests(), 0);

    assert!(wait_until(|| hung_up.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Protocol upgrades
// ============================================================================

#[tokio::test]
async fn test_upgrade_is_spliced_to_instance() {
    let mesh = TestMesh::new(MockRunner::new(upgrade_echo_app), &three_regions());
    let addr = mesh.serve().await;
    let instance = mesh.instance("0000000b").clone();

    let response = reqwest::Client::new()
        .get(format!("http://{}/socket", addr))
        .header("fly-prefer-region", "ord")
        .header("connection", "Upgrade")
        .header("upgrade", "echo")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(response.headers()["x-seen-upgrade"], "echo");
    assert_eq!(response.headers()["upgrade"], "echo");

    let mut upgraded = response.upgrade().await.unwrap();
    upgraded.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    upgraded.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    assert_eq!(instance.active_requests(), 1);

    drop(upgraded);
    assert!(wait_until(|| instance.active_requests() == 0).await);
}

#[tokio::test]
async fn test_plain_request_to_upgrading_app_is_not_upgraded() {
    let mesh = TestMesh::new(MockRunner::new(upgrade_echo_app), &three_regions());

    let request = Request::get("/")
        .header("upgrade", "echo")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = mesh.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "upgrade=None");
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn test_replay_to_other_region() {
    let hits = Arc::new(AtomicUsize::new(0));
    let runner = MockRunner::new(replaying_app("ord", "region=syd;state=cart-42", hits.clone()));
    let mesh = TestMesh::new(runner, &three_regions());

    let (status, headers, body) = mesh.get("/checkout", Some("ord")).await;
    let body = String::from_utf8(body.to_vec()).unwrap();

    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("fly-replay").is_none());
    assert!(body.starts_with("0000000a@syd src="), "{}", body);
    assert!(body.contains("instance=0000000b"), "{}", body);
    assert!(body.contains("region=ord"), "{}", body);
    assert!(body.contains("state=cart-42"), "{}", body);
    assert!(body.contains(";t="), "{}", body);
    assert!(!body.contains("replay body"));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_replay_source_timestamp_is_microseconds() {
    let hits = Arc::new(AtomicUsize::new(0));
    let runner = MockRunner::new(replaying_app("ord", "region=ams", hits));
    let mesh = TestMesh::new(runner, &three_regions());

    let before = chrono::Utc::now().timestamp_micros();
    let (_, _, body) = mesh.get("/", Some("ord")).await;
    let after = chrono::Utc::now().timestamp_micros();

    let body = String::from_utf8(body.to_vec()).unwrap();
    let src = body.split_once("src=").unwrap().1;
    let record = hangar_mesh::ReplayRecord::parse(src).unwrap();
    let t = record.timestamp.unwrap();
    assert!(before <= t && t <= after, "{} not in {}..{}", t, before, after);
    assert_eq!(record.instance.as_deref(), Some("0000000b"));
    assert_eq!(record.region.as_deref(), Some("ord"));
    assert_eq!(record.state, None);
}

#[tokio::test]
async fn test_elsewhere_is_rejected() {
    let hits = Arc::new(AtomicUsize::new(0));
    let runner = MockRunner::new(replaying_app("syd", "elsewhere=true", hits.clone()));
    let mesh = TestMesh::new(runner, &three_regions());

    let (status, _, body) = mesh.get("/", Some("syd")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_instance_and_app_targets_are_rejected() {
    for payload in ["instance=0000000b", "app=other"] {
        let hits = Arc::new(AtomicUsize::new(0));
        let runner = MockRunner::new(replaying_app("syd", payload, hits.clone()));
        let mesh = TestMesh::new(runner, &three_regions());

        let (status, _, _) = mesh.get("/", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{}", payload);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_malformed_replay_is_500() {
    let hits = Arc::new(AtomicUsize::new(0));
    let runner = MockRunner::new(replaying_app("syd", "region", hits.clone()));
    let mesh = TestMesh::new(runner, &three_regions());

    let (status, _, body) = mesh.get("/", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_replay_loop_is_bounded() {
    let hits = Arc::new(AtomicUsize::new(0));
    let runner = MockRunner::new(replaying_app("syd", "region=syd", hits.clone()));
    let mesh = TestMesh::new(runner, &three_regions());

    let (status, headers, body) = mesh.get("/", None).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.is_empty());
    assert!(headers.get("fly-replay").is_none());
    // The first attempt plus max_replays honoured replays.
    assert_eq!(hits.load(Ordering::SeqCst), fast_settings().max_replays as usize + 1);
}
