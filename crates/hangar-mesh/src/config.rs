// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment snapshot consumed by identity resolution and discovery.

use std::env;

/// Port the platform always routes to in a real deployment.
pub const DEPLOY_DEFAULT_PORT: u16 = 8080;

/// Variables describing where this process runs.
///
/// Taken once at startup with [`MeshEnv::from_env`] and then passed by
/// reference; nothing else in this crate reads the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshEnv {
    /// `PORT` - primary port (0 when unset or unparseable)
    pub port: u16,
    /// `MAXPORT` - exclusive upper bound for port offsets (0 when unset)
    pub max_port: u32,
    /// `LOCAL_MACHINE_ID` - set by the hangar daemon
    pub local_machine: Option<String>,
    /// `LOCAL_CONTROL_URL` - set by the hangar daemon
    pub local_control_url: Option<String>,
    /// `LOCAL_REGION` - set by the hangar daemon
    pub local_region: Option<String>,
    /// `FLY_MACHINE_ID` - set by the deployment orchestrator
    pub fly_machine: Option<String>,
    /// `FLY_PROCESS_GROUP`
    pub fly_process_group: Option<String>,
    /// `FLY_APP_NAME`
    pub fly_app_name: Option<String>,
    /// `FLY_REGION`
    pub fly_region: Option<String>,
    /// `FLY_PRIVATE_IP`
    pub fly_private_ip: Option<String>,
}

impl MeshEnv {
    /// Load the snapshot from process environment variables.
    ///
    /// Empty values are treated as absent.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a snapshot from an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Self {
            port: var("PORT").and_then(|v| v.parse().ok()).unwrap_or(0),
            max_port: var("MAXPORT").and_then(|v| v.parse().ok()).unwrap_or(0),
            local_machine: var("LOCAL_MACHINE_ID"),
            local_control_url: var("LOCAL_CONTROL_URL"),
            local_region: var("LOCAL_REGION"),
            fly_machine: var("FLY_MACHINE_ID"),
            fly_process_group: var("FLY_PROCESS_GROUP"),
            fly_app_name: var("FLY_APP_NAME"),
            fly_region: var("FLY_REGION"),
            fly_private_ip: var("FLY_PRIVATE_IP"),
        }
    }

    /// Whether this process runs under the deployment orchestrator.
    pub fn is_deploy(&self) -> bool {
        self.fly_machine.is_some()
    }
}
