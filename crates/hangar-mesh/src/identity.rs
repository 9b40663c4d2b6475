// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity of the currently running process.

use once_cell::sync::OnceCell;

use crate::config::{DEPLOY_DEFAULT_PORT, MeshEnv};
use crate::error::{MeshError, Result};
use crate::types::InstanceInfo;

/// Machine ID used when neither the orchestrator nor the daemon is present.
pub const FALLBACK_MACHINE: &str = "zzxxzzxx";

/// Region used when neither the orchestrator nor the daemon is present.
pub const FALLBACK_REGION: &str = "qqq";

static SELF_IDENTITY: OnceCell<SelfIdentity> = OnceCell::new();

/// Where the identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// Provided by the deployment orchestrator.
    Deployed,
    /// Provided by the local hangar daemon.
    Local,
    /// Synthesized for standalone runs.
    Fallback,
}

/// This process as a mesh instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    info: InstanceInfo,
    mode: IdentityMode,
    max_port: u32,
}

impl SelfIdentity {
    /// Resolve the identity from an environment snapshot.
    ///
    /// Under the orchestrator the primary port must be
    /// [`DEPLOY_DEFAULT_PORT`]; anything else is a configuration error.
    pub fn resolve(env: &MeshEnv) -> Result<Self> {
        let port = if env.port == 0 {
            DEPLOY_DEFAULT_PORT
        } else {
            env.port
        };

        if let Some(machine) = &env.fly_machine {
            if port != DEPLOY_DEFAULT_PORT {
                return Err(MeshError::Config(format!(
                    "cannot mesh without PORT={}",
                    DEPLOY_DEFAULT_PORT
                )));
            }

            return Ok(Self {
                info: InstanceInfo {
                    machine: machine.clone(),
                    region: env.fly_region.clone().unwrap_or_default(),
                    address: env.fly_private_ip.clone().unwrap_or_default(),
                    port,
                },
                mode: IdentityMode::Deployed,
                max_port: env.max_port,
            });
        }

        if let Some(machine) = &env.local_machine {
            return Ok(Self {
                info: InstanceInfo {
                    machine: machine.clone(),
                    region: env.local_region.clone().unwrap_or_default(),
                    address: "::1".to_string(),
                    port,
                },
                mode: IdentityMode::Local,
                max_port: env.max_port,
            });
        }

        Ok(Self {
            info: InstanceInfo {
                machine: FALLBACK_MACHINE.to_string(),
                region: FALLBACK_REGION.to_string(),
                address: "::1".to_string(),
                port,
            },
            mode: IdentityMode::Fallback,
            max_port: env.max_port,
        })
    }

    /// Identity as an [`InstanceInfo`].
    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    /// Machine ID.
    pub fn machine(&self) -> &str {
        &self.info.machine
    }

    /// Region code.
    pub fn region(&self) -> &str {
        &self.info.region
    }

    /// Private address.
    pub fn address(&self) -> &str {
        &self.info.address
    }

    /// Primary port.
    pub fn port(&self) -> u16 {
        self.info.port
    }

    /// Where this identity came from.
    pub fn mode(&self) -> IdentityMode {
        self.mode
    }

    /// Whether this runs under the deployment orchestrator.
    pub fn is_deploy(&self) -> bool {
        self.mode == IdentityMode::Deployed
    }

    /// Whether this identity was synthesized.
    pub fn is_fallback(&self) -> bool {
        self.mode == IdentityMode::Fallback
    }

    /// Whether `other` is this process.
    pub fn is_self(&self, other: &InstanceInfo) -> bool {
        other.machine == self.info.machine
    }

    /// Primary port plus `offset`, checked against `MAXPORT`.
    pub fn port_offset(&self, offset: u16) -> Result<u16> {
        let out = u32::from(self.info.port) + u32::from(offset);
        let max = if self.max_port > 0 {
            self.max_port
        } else {
            u32::from(u16::MAX) + 1
        };

        if out >= max {
            return Err(MeshError::PortBudget { port: out, max });
        }
        // max <= 65536 and out < max, so this fits
        Ok(out as u16)
    }

    /// Host for ports that should not be exposed publicly.
    pub fn private_host(&self) -> &'static str {
        if self.is_deploy() {
            "fly-local-6pn"
        } else {
            "localhost"
        }
    }

    /// Listen address for the primary port.
    pub fn listen_addr(&self) -> Result<String> {
        self.listen_addr_offset(0)
    }

    /// Listen address for the primary port plus `offset`.
    pub fn listen_addr_offset(&self, offset: u16) -> Result<String> {
        let host = if self.is_deploy() { "[::]" } else { "localhost" };
        Ok(format!("{}:{}", host, self.port_offset(offset)?))
    }
}

/// Resolve the identity from the process environment and store it globally.
///
/// Returns the stored identity. Later calls return the first identity
/// without re-reading the environment.
pub fn init_self_identity() -> Result<&'static SelfIdentity> {
    SELF_IDENTITY.get_or_try_init(|| SelfIdentity::resolve(&MeshEnv::from_env()))
}

/// The global identity, if [`init_self_identity`] has run.
pub fn self_identity() -> Option<&'static SelfIdentity> {
    SELF_IDENTITY.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_env() -> MeshEnv {
        MeshEnv {
            port: 8081,
            max_port: 8209,
            local_machine: Some("0000beef".to_string()),
            local_region: Some("ord".to_string()),
            local_control_url: Some("http://localhost:8080/__/control?machine=0000beef".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fallback_identity() {
        let id = SelfIdentity::resolve(&MeshEnv::default()).unwrap();
        assert!(id.is_fallback());
        assert_eq!(id.machine(), FALLBACK_MACHINE);
        assert_eq!(id.region(), FALLBACK_REGION);
        assert_eq!(id.port(), DEPLOY_DEFAULT_PORT);
    }

    #[test]
    fn test_local_identity() {
        let id = SelfIdentity::resolve(&local_env()).unwrap();
        assert_eq!(id.mode(), IdentityMode::Local);
        assert_eq!(id.machine(), "0000beef");
        assert_eq!(id.region(), "ord");
        assert_eq!(id.address(), "::1");
        assert_eq!(id.port(), 8081);
        assert_eq!(id.private_host(), "localhost");
    }

    #[test]
    fn test_deployed_identity_requires_default_port() {
        let env = MeshEnv {
            port: 9000,
            fly_machine: Some("148e".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            SelfIdentity::resolve(&env),
            Err(MeshError::Config(_))
        ));
    }

    #[test]
    fn test_deployed_identity() {
        let env = MeshEnv {
            fly_machine: Some("148e".to_string()),
            fly_region: Some("syd".to_string()),
            fly_private_ip: Some("fdaa::5".to_string()),
            ..Default::default()
        };
        let id = SelfIdentity::resolve(&env).unwrap();
        assert!(id.is_deploy());
        assert_eq!(id.address(), "fdaa::5");
        assert_eq!(id.listen_addr().unwrap(), "[::]:8080");
        assert_eq!(id.private_host(), "fly-local-6pn");
    }

    #[test]
    fn test_port_offset_budget() {
        let id = SelfIdentity::resolve(&local_env()).unwrap();
        assert_eq!(id.port_offset(0).unwrap(), 8081);
        assert_eq!(id.port_offset(127).unwrap(), 8208);
        assert!(matches!(
            id.port_offset(128),
            Err(MeshError::PortBudget {
                port: 8209,
                max: 8209
            })
        ));
        assert_eq!(id.listen_addr_offset(1).unwrap(), "localhost:8082");
    }

    #[test]
    fn test_port_offset_without_max() {
        let env = MeshEnv {
            port: 65535,
            ..Default::default()
        };
        let id = SelfIdentity::resolve(&env).unwrap();
        assert_eq!(id.port_offset(0).unwrap(), 65535);
        assert!(id.port_offset(1).is_err());
    }

    #[test]
    fn test_is_self() {
        let id = SelfIdentity::resolve(&local_env()).unwrap();
        let mut other = id.info().clone();
        assert!(id.is_self(&other));
        other.machine = "other".to_string();
        assert!(!id.is_self(&other));
    }
}
