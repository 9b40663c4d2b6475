// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the hangar daemon.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hangar_mesh::PORT_RANGE;

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Command line launched for every instance (split on whitespace)
    pub package: String,
    /// Front-facing port; also serves the control endpoints
    pub port: u16,
    /// Listen on all interfaces instead of loopback
    pub allow_network: bool,
    /// Number of instance slots
    pub count: usize,
    /// Virtual regions, assigned round-robin; the first is the default
    pub regions: Vec<String>,
    /// Seed for machine ID generation
    pub seed: u64,
    /// Start every instance at boot instead of on demand
    pub start_all: bool,
    /// Fast path skips instances handling this many requests or more
    pub load_threshold: usize,
    /// Maximum replays honoured for one request
    pub max_replays: u32,
    /// Control endpoint lists only live instances
    pub alive_only: bool,
    /// Inbound bodies larger than this are rejected with 413
    pub max_body_bytes: usize,
    /// Total time spent probing a cold-started instance
    pub healthy_timeout: Duration,
    /// Number of probes within `healthy_timeout`
    pub healthy_retries: u32,
    /// Host used to reach instances
    pub upstream_host: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            package: String::new(),
            port: 8080,
            allow_network: false,
            count: 4,
            regions: vec!["syd".to_string(), "ord".to_string(), "ams".to_string()],
            seed: 1,
            start_all: false,
            load_threshold: 2,
            max_replays: 4,
            alive_only: false,
            max_body_bytes: 16 * 1024 * 1024,
            healthy_timeout: Duration::from_secs(4),
            healthy_retries: 12,
            upstream_host: "localhost".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// The result is validated; see [`Config::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let package = std::env::var("HANGAR_PACKAGE")
            .map_err(|_| ConfigError::MissingEnvVar("HANGAR_PACKAGE"))?;

        let port: u16 = parse_var("HANGAR_PORT", defaults.port)?;
        let count: usize = parse_var("HANGAR_COUNT", defaults.count)?;
        let seed: u64 = parse_var("HANGAR_SEED", defaults.seed)?;
        let load_threshold: usize = parse_var("HANGAR_LOAD", defaults.load_threshold)?;
        let max_replays: u32 = parse_var("HANGAR_REPLAY", defaults.max_replays)?;
        let max_body_bytes: usize = parse_var("HANGAR_MAX_BODY_BYTES", defaults.max_body_bytes)?;
        let healthy_timeout_ms: u64 = parse_var(
            "HANGAR_HEALTHY_TIMEOUT_MS",
            defaults.healthy_timeout.as_millis() as u64,
        )?;
        let healthy_retries: u32 = parse_var("HANGAR_HEALTHY_RETRIES", defaults.healthy_retries)?;

        let regions = std::env::var("HANGAR_REGIONS")
            .map(|raw| parse_regions(&raw))
            .unwrap_or(defaults.regions);

        let config = Self {
            package,
            port,
            allow_network: flag_var("HANGAR_ALLOW_NETWORK"),
            count,
            regions,
            seed,
            start_all: flag_var("HANGAR_START"),
            load_threshold,
            max_replays,
            alive_only: flag_var("HANGAR_ALIVE_ONLY"),
            max_body_bytes,
            healthy_timeout: Duration::from_millis(healthy_timeout_ms),
            healthy_retries,
            upstream_host: std::env::var("HANGAR_UPSTREAM_HOST")
                .unwrap_or(defaults.upstream_host),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check startup invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.package.split_whitespace().next().is_none() {
            return Err(ConfigError::MissingPackage);
        }
        if self.regions.is_empty() {
            return Err(ConfigError::NoRegions);
        }
        if let Some(bad) = self.regions.iter().find(|r| r.chars().count() != 3) {
            return Err(ConfigError::InvalidRegion(bad.clone()));
        }
        if self.count == 0 {
            return Err(ConfigError::NoInstances);
        }
        if self.healthy_retries == 0 {
            return Err(ConfigError::InvalidValue("HANGAR_HEALTHY_RETRIES"));
        }

        let max_port = self.first_instance_port() + self.count as u64 * u64::from(PORT_RANGE);
        if max_port >= 65536 {
            return Err(ConfigError::PortBudget {
                count: self.count,
                max_port,
            });
        }

        Ok(())
    }

    /// Region used when a request names none or an unknown one.
    pub fn default_region(&self) -> &str {
        self.regions.first().map(String::as_str).unwrap_or_default()
    }

    /// Address the front-facing server binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = if self.allow_network {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        SocketAddr::new(ip, self.port)
    }

    /// Delay between two cold-start probes.
    pub fn healthy_interval(&self) -> Duration {
        self.healthy_timeout / self.healthy_retries.max(1)
    }

    fn first_instance_port(&self) -> u64 {
        u64::from(self.port) + 1
    }
}

/// Normalize a comma-separated region list.
pub fn parse_regions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|r| r.trim().to_lowercase())
        .filter(|r| !r.is_empty())
        .collect()
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

fn flag_var(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
    /// The package command is empty.
    #[error("need a package command to run")]
    MissingPackage,
    /// No regions were configured.
    #[error("need comma-separated regions")]
    NoRegions,
    /// A region is not a 3-character code.
    #[error("regions must be 3-character codes, had {0:?}")]
    InvalidRegion(String),
    /// Instance count is zero.
    #[error("need at least one instance")]
    NoInstances,
    /// Instance port ranges would overflow the port space.
    #[error("can't run {count} instances ({range} ports each), max={max_port}", range = PORT_RANGE)]
    PortBudget {
        /// Requested instance count.
        count: usize,
        /// First port past the last range.
        max_port: u64,
    },
}
