// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Mesh - workload-side helpers for running on a multi-region mesh.
//!
//! Link this crate into a workload that runs either under the local hangar
//! daemon or deployed on the real platform. It answers the same questions in
//! both places:
//!
//! - **Who am I?** [`SelfIdentity`] resolves machine ID, region, address and
//!   port from the environment once at startup.
//! - **Who are my peers?** [`DiscoveryResolver`] asks the daemon's control
//!   endpoint locally, or joins two DNS lookups when deployed.
//! - **Can someone else answer this?** [`ReplayRecord`] builds the
//!   `fly-replay` response header and reads `fly-replay-src` on arrival.
//!
//! # Quick Start
//!
//! ```ignore
//! use hangar_mesh::{DiscoveryResolver, MeshEnv, SelfIdentity};
//!
//! #[tokio::main]
//! async fn main() -> hangar_mesh::Result<()> {
//!     let env = MeshEnv::from_env();
//!     let me = SelfIdentity::resolve(&env)?;
//!     let listener = tokio::net::TcpListener::bind(me.listen_addr()?).await?;
//!
//!     let discovery = DiscoveryResolver::new(&env, me.clone())?;
//!     let peers = discovery.discover().await?;
//!     if !peers.unknown {
//!         for peer in &peers.instances {
//!             println!("{} in {}", peer.machine, peer.region);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Environment
//!
//! | Variable | Set by | Description |
//! |----------|--------|-------------|
//! | `PORT` | daemon / platform | Primary port |
//! | `MAXPORT` | daemon | Exclusive upper bound for [`SelfIdentity::port_offset`] |
//! | `LOCAL_MACHINE_ID` | daemon | Machine ID |
//! | `LOCAL_REGION` | daemon | Region code |
//! | `LOCAL_CONTROL_URL` | daemon | Discovery endpoint |
//! | `FLY_MACHINE_ID` | platform | Machine ID |
//! | `FLY_REGION` | platform | Region code |
//! | `FLY_PRIVATE_IP` | platform | Private address |
//! | `FLY_PROCESS_GROUP` | platform | Process group for DNS discovery |
//! | `FLY_APP_NAME` | platform | Application name for DNS discovery |

#![deny(missing_docs)]

/// Environment snapshot.
pub mod config;

/// Peer discovery (control endpoint or DNS).
pub mod discovery;

/// Error types.
pub mod error;

/// Identity of this process.
pub mod identity;

/// Virtual inter-region latency.
pub mod latency;

/// `key=value` record parsing.
pub mod record;

/// Replay headers.
pub mod replay;

/// Wire types.
pub mod types;

pub use config::{DEPLOY_DEFAULT_PORT, MeshEnv};
pub use discovery::{DiscoveryResolver, DnsLookup, HickoryLookup, LookupError};
pub use error::{MeshError, RecordError, Result};
pub use identity::{IdentityMode, SelfIdentity, init_self_identity, self_identity};
pub use latency::virtual_latency;
pub use replay::{HEADER_PREFER_REGION, HEADER_REPLAY, HEADER_REPLAY_SRC, ReplayRecord};
pub use types::{ControlInfo, InstanceInfo, PORT_RANGE};
