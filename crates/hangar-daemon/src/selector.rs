// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance selection within a region.

use std::sync::Arc;

use crate::instance::InstanceRecord;

/// An instance with a point-in-time view of its state.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The instance.
    pub instance: Arc<InstanceRecord>,
    /// Whether it was running when ranked.
    pub alive: bool,
    /// Requests in flight when ranked.
    pub active: usize,
}

/// Rank instances: alive ones first, then by fewer active requests.
///
/// Each instance is sampled once and the ordering works on those samples,
/// so concurrent state changes cannot make the comparison inconsistent.
/// Ties keep configuration order.
pub async fn rank(instances: &[Arc<InstanceRecord>]) -> Vec<Candidate> {
    let mut candidates = Vec::with_capacity(instances.len());
    for instance in instances {
        candidates.push(Candidate {
            alive: instance.is_alive().await,
            active: instance.active_requests(),
            instance: instance.clone(),
        });
    }
    candidates.sort_by_key(|c| (!c.alive, c.active));
    candidates
}
