// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fake but consistent inter-region latency for local runs.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::identity::SelfIdentity;

/// Upper bound (exclusive) of any virtual latency.
pub const MAX_VIRTUAL_LATENCY: Duration = Duration::from_secs(1);

/// Pseudo-latency between two regions.
///
/// The same pair always yields the same value, in either direction, and a
/// region has zero latency to itself.
pub fn virtual_latency(from: &str, to: &str) -> Duration {
    if from == to {
        return Duration::ZERO;
    }
    let (a, b) = if from < to { (to, from) } else { (from, to) };

    let digest = Sha256::digest(format!("{}:{}", a, b).as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);

    let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));
    let max = MAX_VIRTUAL_LATENCY.as_nanos() as u64;
    Duration::from_nanos(rng.random_range(0..max))
}

impl SelfIdentity {
    /// [`virtual_latency`], or zero when deployed (real latency applies).
    pub fn virtual_latency(&self, from: &str, to: &str) -> Duration {
        if self.is_deploy() {
            Duration::ZERO
        } else {
            virtual_latency(from, to)
        }
    }
}
