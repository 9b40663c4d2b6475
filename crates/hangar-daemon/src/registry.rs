// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance registry.
//!
//! Built once at startup and never mutated afterwards. Only the per-instance
//! run state and request counters change at runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hangar_mesh::PORT_RANGE;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::instance::InstanceRecord;
use crate::runner::Runner;

/// All configured instances grouped by region.
#[derive(Debug)]
pub struct InstanceRegistry {
    default_region: String,
    regions: Vec<String>,
    by_region: HashMap<String, Vec<Arc<InstanceRecord>>>,
    instances: Vec<Arc<InstanceRecord>>,
}

impl InstanceRegistry {
    /// Generate the instance slots described by `config`.
    ///
    /// Slot `i` gets data port `port + 1 + i * 128` and region
    /// `regions[i % regions.len()]`. Machine IDs come from an RNG seeded
    /// with `config.seed`, so the same config always yields the same IDs.
    pub fn from_config(config: &Config, runner: Arc<dyn Runner>) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(config.count);

        for i in 0..config.count {
            let machine_id = loop {
                let candidate = format!("{:08x}", rng.random::<u32>());
                if seen.insert(candidate.clone()) {
                    break candidate;
                }
            };
            let region = config.regions[i % config.regions.len()].clone();
            let port = config.port + 1 + (i as u16) * PORT_RANGE;

            debug!(machine = %machine_id, region = %region, port, "Configured instance");
            records.push(InstanceRecord::new(
                machine_id,
                region,
                port,
                config.port,
                config.package.clone(),
                runner.clone(),
            ));
        }

        Self::from_records(config.default_region(), records)
    }

    /// Build a registry from already constructed records.
    ///
    /// Regions keep the order in which they first appear.
    pub fn from_records(default_region: impl Into<String>, records: Vec<InstanceRecord>) -> Self {
        let mut regions: Vec<String> = Vec::new();
        let mut by_region: HashMap<String, Vec<Arc<InstanceRecord>>> = HashMap::new();
        let mut instances = Vec::with_capacity(records.len());

        for record in records {
            let record = Arc::new(record);
            let region = record.region().to_string();
            if !by_region.contains_key(&region) {
                regions.push(region.clone());
            }
            by_region.entry(region).or_default().push(record.clone());
            instances.push(record);
        }

        Self {
            default_region: default_region.into(),
            regions,
            by_region,
            instances,
        }
    }

    /// Region used when a request names none or an unknown one.
    pub fn default_region(&self) -> &str {
        &self.default_region
    }

    /// Regions that have instances, in configuration order.
    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    /// Every instance, in configuration order.
    pub fn all(&self) -> &[Arc<InstanceRecord>] {
        &self.instances
    }

    /// Instances configured for `region`.
    pub fn in_region(&self, region: &str) -> &[Arc<InstanceRecord>] {
        self.by_region.get(region).map(Vec::as_slice).unwrap_or_default()
    }

    /// Look up an instance by machine ID.
    pub fn get(&self, machine_id: &str) -> Option<&Arc<InstanceRecord>> {
        self.instances.iter().find(|i| i.machine_id() == machine_id)
    }

    /// Pick the region a request should be served from.
    ///
    /// An unknown or empty requested region falls back to the default
    /// region, then to the first region with instances. `None` only when
    /// the registry is empty.
    pub fn resolve_region(&self, requested: Option<&str>) -> Option<&str> {
        let requested = requested.map(|r| r.trim().to_lowercase());
        if let Some(region) = requested.as_deref().filter(|r| !r.is_empty()) {
            if let Some((key, _)) = self.by_region.get_key_value(region) {
                return Some(key.as_str());
            }
            debug!(region, default = %self.default_region, "Unknown region requested");
        }

        if self.by_region.contains_key(&self.default_region) {
            return Some(self.default_region.as_str());
        }

        let fallback = self.regions.first().map(String::as_str);
        if let Some(region) = fallback {
            warn!(region, "Default region has no instances, falling back");
        }
        fallback
    }

    /// Start every instance. Returns how many were started by this call.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for instance in &self.instances {
            if instance.ensure_running().await {
                started += 1;
            }
        }
        info!(started, total = self.instances.len(), "Started instances");
        started
    }

    /// Ask every running instance to terminate.
    pub async fn stop_all(&self) {
        for instance in &self.instances {
            if let Err(e) = instance.stop().await {
                warn!(machine = %instance.machine_id(), error = %e, "Failed to stop instance");
            }
        }
    }
}
