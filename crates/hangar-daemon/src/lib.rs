// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Daemon - Local Multi-Region Mesh
//!
//! Runs several copies of one workload on a single machine and pretends they
//! live in different regions. A single front-facing HTTP server routes each
//! request to an instance in the requested region, starts instances on
//! demand, and follows `fly-replay` answers so an instance can hand a
//! request to a peer in another region.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!       HTTP ─────────►│  hangar-daemon (:8080)       │
//!                      │  ┌────────┐   ┌───────────┐  │
//!                      │  │ Router │──►│  Reverse  │  │
//!                      │  │        │◄──│   Proxy   │  │
//!                      │  └───┬────┘   └─────┬─────┘  │
//!                      │      │ start        │        │
//!                      │  ┌───▼──────────┐   │        │
//!                      │  │  Instance    │   │        │
//!                      │  │  Registry    │   │        │
//!                      │  └───┬──────────┘   │        │
//!                      └──────┼──────────────┼────────┘
//!                             │ spawn        │ forward
//!              ┌──────────────▼──────────────▼────────────┐
//!              │ instance syd  │ instance ord │ ...       │
//!              │ :8081         │ :8209        │           │
//!              └──────────────────────────────────────────┘
//!                  │ GET /__/control?machine=<id>
//!                  └───────────────► hangar-daemon
//! ```
//!
//! # Request Flow
//!
//! 1. The target region comes from `fly-prefer-region`, falling back to the
//!    default (first configured) region.
//! 2. A live, lightly loaded instance in that region gets the request.
//! 3. Otherwise an instance is started and probed until it accepts.
//! 4. As a last resort a random instance in the region is tried.
//! 5. A response carrying `fly-replay` is swallowed; the request is sent
//!    again to the region it names, with `fly-replay-src` describing the
//!    instance that asked.
//!
//! # Control Endpoints
//!
//! | Path | Description |
//! |------|-------------|
//! | `/__/control?machine=<id>` | JSON peer list, excluding the caller |
//! | `/__/start` | Start every instance, answers `"ok, started N/M"` |
//! | `/__/...` | Anything else is 404 |
//!
//! Control endpoints answer any method.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HANGAR_PACKAGE` | Yes | - | Command line run for each instance |
//! | `HANGAR_PORT` | No | `8080` | Front-facing port |
//! | `HANGAR_ALLOW_NETWORK` | No | `false` | Listen on all interfaces |
//! | `HANGAR_COUNT` | No | `4` | Number of instances |
//! | `HANGAR_REGIONS` | No | `syd,ord,ams` | Regions, first is the default |
//! | `HANGAR_SEED` | No | `1` | Machine ID seed |
//! | `HANGAR_START` | No | `false` | Start all instances at boot |
//! | `HANGAR_LOAD` | No | `2` | Fast-path load threshold |
//! | `HANGAR_REPLAY` | No | `4` | Maximum replays per request |
//! | `HANGAR_ALIVE_ONLY` | No | `false` | Control lists live instances only |
//! | `HANGAR_MAX_BODY_BYTES` | No | `16777216` | Largest accepted request body |
//! | `HANGAR_HEALTHY_TIMEOUT_MS` | No | `4000` | Cold start probe window |
//! | `HANGAR_HEALTHY_RETRIES` | No | `12` | Probes within the window |
//! | `HANGAR_UPSTREAM_HOST` | No | `localhost` | Host used to reach instances |

#![deny(missing_docs)]

/// Daemon configuration loaded from environment variables.
pub mod config;

/// Error types for daemon operations.
pub mod error;

/// HTTP handlers for control endpoints and routed traffic.
pub mod handlers;

/// Instance slots and process supervision.
pub mod instance;

/// Reverse proxy to a single instance.
pub mod proxy;

/// Instance registry grouped by region.
pub mod registry;

/// Region routing and replay handling.
pub mod router;

/// Instance execution backends (process, mock).
pub mod runner;

/// Embeddable runtime.
pub mod runtime;

/// Instance ranking.
pub mod selector;

/// Front-facing HTTP server.
pub mod server;

pub use config::Config;
pub use error::Error;
pub use runtime::DaemonRuntime;
