// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer discovery.
//!
//! Under the local daemon, peers come from a JSON control endpoint. When
//! deployed, they come from two DNS lookups: the address records of the
//! process-group host (which instances belong to this group) and the
//! application-wide `_instances` TXT record (what those instances are).
//! Both strategies produce the same [`ControlInfo`], which never includes
//! the caller.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{DEPLOY_DEFAULT_PORT, MeshEnv};
use crate::error::{MeshError, Result};
use crate::identity::SelfIdentity;
use crate::record::parse_instance_list;
use crate::types::{ControlInfo, InstanceInfo};

/// Name of the application-wide instance list record.
pub const INSTANCES_TXT: &str = "_instances.internal";

/// Errors from a [`DnsLookup`].
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    /// The name has no records (yet).
    #[error("no records found: {0}")]
    NotFound(String),

    /// Any other resolver failure.
    #[error("lookup failed: {0}")]
    Failed(String),
}

/// DNS operations needed by deployed-mode discovery.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Resolve A and AAAA records for `host`.
    async fn lookup_ips(&self, host: &str) -> std::result::Result<Vec<IpAddr>, LookupError>;

    /// Resolve TXT records for `name`, one string per record.
    async fn lookup_txt(&self, name: &str) -> std::result::Result<Vec<String>, LookupError>;
}

/// [`DnsLookup`] backed by the system resolver configuration.
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    /// Build a resolver from `/etc/resolv.conf` (or the platform equivalent).
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| MeshError::Dns(e.to_string()))?;
        Ok(Self { resolver })
    }
}

fn lookup_error(err: ResolveError) -> LookupError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => LookupError::NotFound(err.to_string()),
        _ => LookupError::Failed(err.to_string()),
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn lookup_ips(&self, host: &str) -> std::result::Result<Vec<IpAddr>, LookupError> {
        let found = self.resolver.lookup_ip(host).await.map_err(lookup_error)?;
        Ok(found.iter().collect())
    }

    async fn lookup_txt(&self, name: &str) -> std::result::Result<Vec<String>, LookupError> {
        let found = self.resolver.txt_lookup(name).await.map_err(lookup_error)?;

        // Long TXT records arrive as several character-strings; rejoin them.
        Ok(found
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect::<String>()
            })
            .collect())
    }
}

enum Strategy {
    Local {
        control_url: String,
        http: reqwest::Client,
    },
    Deployed {
        group_host: String,
        lookup: Arc<dyn DnsLookup>,
    },
    Standalone,
}

/// Answers "who are my peers".
pub struct DiscoveryResolver {
    identity: SelfIdentity,
    strategy: Strategy,
}

impl DiscoveryResolver {
    /// Pick the strategy for this process.
    ///
    /// A daemon-provided control URL wins; otherwise an orchestrator machine
    /// ID selects DNS discovery; otherwise discovery always answers "unknown".
    pub fn new(env: &MeshEnv, identity: SelfIdentity) -> Result<Self> {
        if let Some(url) = &env.local_control_url {
            return Self::local(identity, url.clone());
        }

        if env.is_deploy() {
            let group = env
                .fly_process_group
                .as_deref()
                .ok_or_else(|| MeshError::Config("FLY_PROCESS_GROUP is required".to_string()))?;
            let app = env
                .fly_app_name
                .as_deref()
                .ok_or_else(|| MeshError::Config("FLY_APP_NAME is required".to_string()))?;
            let lookup = Arc::new(HickoryLookup::from_system_conf()?);
            return Ok(Self::deployed(identity, group, app, lookup));
        }

        Ok(Self {
            identity,
            strategy: Strategy::Standalone,
        })
    }

    /// Discover through the daemon's control endpoint.
    pub fn local(identity: SelfIdentity, control_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            identity,
            strategy: Strategy::Local {
                control_url: control_url.into(),
                http,
            },
        })
    }

    /// Discover through DNS.
    pub fn deployed(
        identity: SelfIdentity,
        process_group: &str,
        app_name: &str,
        lookup: Arc<dyn DnsLookup>,
    ) -> Self {
        Self {
            identity,
            strategy: Strategy::Deployed {
                group_host: format!("{}.process.{}.internal", process_group, app_name),
                lookup,
            },
        }
    }

    /// Identity excluded from every answer.
    pub fn identity(&self) -> &SelfIdentity {
        &self.identity
    }

    /// Find peers of this process.
    pub async fn discover(&self) -> Result<ControlInfo> {
        match &self.strategy {
            Strategy::Local { control_url, http } => self.discover_local(http, control_url).await,
            Strategy::Deployed { group_host, lookup } => {
                self.discover_deployed(group_host, lookup.as_ref()).await
            }
            Strategy::Standalone => Ok(ControlInfo::unknown_now()),
        }
    }

    async fn discover_local(&self, http: &reqwest::Client, url: &str) -> Result<ControlInfo> {
        let mut info: ControlInfo = http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info.instances.retain(|i| !self.identity.is_self(i));

        debug!(peers = info.instances.len(), unknown = info.unknown, "Discovered local peers");
        Ok(info)
    }

    async fn discover_deployed(
        &self,
        group_host: &str,
        lookup: &dyn DnsLookup,
    ) -> Result<ControlInfo> {
        let joined = tokio::try_join!(lookup.lookup_ips(group_host), lookup.lookup_txt(INSTANCES_TXT));

        let (group_ips, records) = match joined {
            Ok(found) => found,
            Err(LookupError::NotFound(reason)) => {
                // Expected while DNS converges after a cold start.
                warn!(host = %group_host, %reason, "Discovery records not found yet");
                return Ok(ControlInfo::unknown_now());
            }
            Err(LookupError::Failed(reason)) => return Err(MeshError::Dns(reason)),
        };

        let group_ips: HashSet<IpAddr> = group_ips.into_iter().collect();
        let entries = match records.first() {
            Some(raw) => parse_instance_list(raw)?,
            None => Vec::new(),
        };

        let mut info = ControlInfo::empty_now();
        let mut seen = HashSet::new();

        for entry in entries {
            let in_group = entry
                .ip
                .parse::<IpAddr>()
                .is_ok_and(|ip| group_ips.contains(&ip));
            if !in_group {
                continue;
            }

            let peer = InstanceInfo {
                machine: entry.instance,
                region: entry.region,
                address: entry.ip,
                port: DEPLOY_DEFAULT_PORT,
            };
            if self.identity.is_self(&peer) || !seen.insert(peer.machine.clone()) {
                continue;
            }
            info.instances.push(peer);
        }

        debug!(peers = info.instances.len(), "Discovered deployed peers");
        Ok(info)
    }
}
