// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parsing for the `key=value` record syntax shared by replay headers and
//! the deployed instance-list TXT record.
//!
//! Parsing is strict: every non-empty segment must contain `=` and a
//! non-empty key. Empty segments (for example a trailing separator) are
//! skipped and unknown keys are left for the caller to ignore.

use crate::error::RecordError;

/// Split `raw` on `separator` into `(key, value)` pairs.
///
/// Values are split on the first `=` only, so they may themselves contain `=`.
pub fn parse_pairs(raw: &str, separator: char) -> Result<Vec<(&str, &str)>, RecordError> {
    let mut out = Vec::new();

    for segment in raw.split(separator) {
        if segment.trim().is_empty() {
            continue;
        }

        let (key, value) = segment
            .split_once('=')
            .ok_or_else(|| RecordError::MissingSeparator(segment.to_string()))?;

        let key = key.trim();
        if key.is_empty() {
            return Err(RecordError::EmptyKey(segment.to_string()));
        }

        out.push((key, value));
    }

    Ok(out)
}

/// One entry of the deployed `_instances` TXT record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceEntry {
    /// Machine ID of the instance.
    pub instance: String,
    /// Application the instance belongs to.
    pub app: String,
    /// Private IP address.
    pub ip: String,
    /// Process group the instance runs in.
    pub process_group: String,
    /// 3-character region code.
    pub region: String,
}

/// Parse an instance list like `instance=a,ip=fdaa::1;instance=b,ip=fdaa::2`.
///
/// Entries are separated by `;` and fields by `,`. Each entry must carry
/// `instance` and `ip`.
pub fn parse_instance_list(raw: &str) -> Result<Vec<InstanceEntry>, RecordError> {
    let mut out = Vec::new();

    for entry in raw.split(';') {
        if entry.trim().is_empty() {
            continue;
        }

        let mut parsed = InstanceEntry::default();
        for (key, value) in parse_pairs(entry, ',')? {
            match key {
                "instance" => parsed.instance = value.to_string(),
                "app" => parsed.app = value.to_string(),
                "ip" => parsed.ip = value.to_string(),
                "processGroup" => parsed.process_group = value.to_string(),
                "region" => parsed.region = value.to_string(),
                _ => {}
            }
        }

        if parsed.instance.is_empty() {
            return Err(RecordError::MissingField("instance"));
        }
        if parsed.ip.is_empty() {
            return Err(RecordError::MissingField("ip"));
        }

        out.push(parsed);
    }

    Ok(out)
}
