// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay records.
//!
//! A workload asks the router to send the current request somewhere else by
//! answering with a `fly-replay` response header. When the router re-dispatches,
//! the next instance sees a `fly-replay-src` request header recording where the
//! request came from.
//!
//! Both headers use the same syntax: `;`-separated `key=value` pairs with keys
//! among `instance`, `region`, `app`, `state`, `elsewhere` and `t`. `t` is
//! microseconds since the Unix epoch.

use http::HeaderMap;
use http::header::HeaderValue;

use crate::error::RecordError;
use crate::record::parse_pairs;

/// Response header a workload sets to request a replay.
pub const HEADER_REPLAY: &str = "fly-replay";

/// Request header carried by a replayed request.
pub const HEADER_REPLAY_SRC: &str = "fly-replay-src";

/// Request header naming the caller's preferred region.
pub const HEADER_PREFER_REGION: &str = "fly-prefer-region";

/// A parsed replay record.
///
/// Empty strings are never stored: a key present with an empty value parses
/// to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayRecord {
    /// Target (or origin) machine ID.
    pub instance: Option<String>,
    /// Target (or origin) region.
    pub region: Option<String>,
    /// Target application.
    pub app: Option<String>,
    /// Opaque state carried through the replay.
    pub state: Option<String>,
    /// Replay to any instance other than the current one.
    pub elsewhere: bool,
    /// Timestamp in microseconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

impl ReplayRecord {
    /// A record asking for a replay into `region`.
    pub fn to_region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            ..Default::default()
        }
    }

    /// Attach opaque state.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Parse a header value.
    pub fn parse(raw: &str) -> Result<Self, RecordError> {
        let mut out = Self::default();

        for (key, value) in parse_pairs(raw, ';')? {
            let text = (!value.is_empty()).then(|| value.to_string());
            match key {
                "instance" => out.instance = text,
                "region" => out.region = text,
                "app" => out.app = text,
                "state" => out.state = text,
                "elsewhere" => {
                    out.elsewhere = match value {
                        "true" => true,
                        "" => false,
                        _ => {
                            return Err(RecordError::InvalidValue {
                                key: "elsewhere",
                                value: value.to_string(),
                            });
                        }
                    }
                }
                "t" => {
                    out.timestamp = if value.is_empty() {
                        None
                    } else {
                        Some(value.parse().map_err(|_| RecordError::InvalidValue {
                            key: "t",
                            value: value.to_string(),
                        })?)
                    }
                }
                _ => {}
            }
        }

        Ok(out)
    }

    /// Encode as a header value. Returns an empty string for an empty record.
    pub fn to_header_value(&self) -> Result<String, RecordError> {
        let fields = [
            ("instance", self.instance.as_deref()),
            ("region", self.region.as_deref()),
            ("app", self.app.as_deref()),
            ("state", self.state.as_deref()),
        ];

        let mut parts = Vec::new();
        for (key, value) in fields {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            if let Some(ch) = value.chars().find(|c| *c == ';' || c.is_control()) {
                return Err(RecordError::ReservedCharacter { key, ch });
            }
            parts.push(format!("{}={}", key, value));
        }
        if self.elsewhere {
            parts.push("elsewhere=true".to_string());
        }
        if let Some(t) = self.timestamp {
            parts.push(format!("t={}", t));
        }

        Ok(parts.join(";"))
    }

    /// Set the `fly-replay` response header from workload code.
    ///
    /// Returns whether a header was set (an empty record sets nothing).
    pub fn apply_to(&self, headers: &mut HeaderMap) -> Result<bool, RecordError> {
        let value = self.to_header_value()?;
        if value.is_empty() {
            return Ok(false);
        }

        let value = HeaderValue::from_str(&value).map_err(|_| RecordError::InvalidValue {
            key: "header",
            value: value.clone(),
        })?;
        headers.insert(HEADER_REPLAY, value);
        Ok(true)
    }

    /// Fields this record asks for that a region-only replay cannot honour.
    pub fn unsupported_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.instance.is_some() {
            out.push("instance");
        }
        if self.app.is_some() {
            out.push("app");
        }
        if self.elsewhere {
            out.push("elsewhere");
        }
        out
    }

    /// Read the `fly-replay-src` header from an incoming request, if any.
    pub fn source_from(headers: &HeaderMap) -> Option<Result<Self, RecordError>> {
        let raw = headers.get(HEADER_REPLAY_SRC)?;
        Some(match raw.to_str() {
            Ok(raw) => Self::parse(raw),
            Err(_) => Err(RecordError::InvalidValue {
                key: "header",
                value: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
            }),
        })
    }
}
