// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types shared between the daemon's control endpoint and discovery.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{MeshError, Result};

/// Number of ports reserved per instance in local mode.
///
/// Each instance may listen on `port..port + PORT_RANGE`; offsets outside
/// this range are rejected.
pub const PORT_RANGE: u16 = 128;

/// A peer's identity and reachability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Machine ID reported by the platform.
    pub machine: String,
    /// 3-character region code.
    pub region: String,
    /// Private address of this instance.
    pub address: String,
    /// Default port of this instance.
    pub port: u16,
}

impl InstanceInfo {
    /// Socket address of the instance's default port.
    pub fn addr(&self) -> Result<SocketAddr> {
        self.addr_offset(0)
    }

    /// Socket address of the instance's default port plus `offset`.
    pub fn addr_offset(&self, offset: u16) -> Result<SocketAddr> {
        if offset >= PORT_RANGE {
            return Err(MeshError::OffsetOutOfRange(offset));
        }

        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| MeshError::InvalidAddress(self.address.clone()))?;
        let port = self
            .port
            .checked_add(offset)
            .ok_or(MeshError::OffsetOutOfRange(offset))?;

        Ok(SocketAddr::new(ip, port))
    }

    /// Interpret the hex machine ID as an integer.
    pub fn machine_as_u64(&self) -> Option<u64> {
        u64::from_str_radix(&self.machine, 16).ok()
    }

    fn owns_port(&self, port: u16) -> bool {
        let min = u32::from(self.port);
        let port = u32::from(port);
        port >= min && port < min + u32::from(PORT_RANGE)
    }
}

/// Result of a discovery call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlInfo {
    /// Milliseconds since the Unix epoch when the answer was produced.
    pub now: i64,
    /// Peers, never including the caller.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub instances: Vec<InstanceInfo>,
    /// Discovery ran but could not determine the peer set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unknown: bool,
}

impl ControlInfo {
    /// An empty answer stamped with the current time.
    pub fn empty_now() -> Self {
        Self {
            now: chrono::Utc::now().timestamp_millis(),
            instances: Vec::new(),
            unknown: false,
        }
    }

    /// An answer marked as undetermined.
    pub fn unknown_now() -> Self {
        Self {
            unknown: true,
            ..Self::empty_now()
        }
    }

    /// Map of machine ID to peer address at `offset`.
    pub fn peer_addr_offset(&self, offset: u16) -> Result<HashMap<String, SocketAddr>> {
        self.instances
            .iter()
            .map(|i| Ok((i.machine.clone(), i.addr_offset(offset)?)))
            .collect()
    }

    /// Find the peer that owns `addr`.
    ///
    /// Deployed peers are matched by IP alone. Locally every peer shares
    /// loopback, so the match is on the port range owned by each peer.
    pub fn by_addr(&self, addr: SocketAddr, deployed: bool) -> Option<&InstanceInfo> {
        if deployed {
            let ip = addr.ip();
            self.instances
                .iter()
                .find(|i| i.address.parse::<IpAddr>().is_ok_and(|a| a == ip))
        } else {
            self.instances.iter().find(|i| i.owns_port(addr.port()))
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<InstanceInfo>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<InstanceInfo>>::deserialize(deserializer).map(Option::unwrap_or_default)
}
