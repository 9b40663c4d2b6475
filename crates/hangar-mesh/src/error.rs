// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mesh-specific error types.

use thiserror::Error;

/// Errors produced while parsing `key=value` records (replay headers, TXT entries).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// A non-empty segment had no `=` separator.
    #[error("segment {0:?} is missing '='")]
    MissingSeparator(String),

    /// A segment had an empty key.
    #[error("segment {0:?} has an empty key")]
    EmptyKey(String),

    /// A known key carried a value that does not fit its type.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Offending key.
        key: &'static str,
        /// Raw value as received.
        value: String,
    },

    /// A required key was absent.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A value contains a character reserved by the record syntax.
    #[error("value for {key} contains reserved character {ch:?}")]
    ReservedCharacter {
        /// Key whose value is invalid.
        key: &'static str,
        /// The reserved character found.
        ch: char,
    },
}

/// Errors that can occur in the mesh library.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Configuration error (invalid or contradictory environment)
    #[error("configuration error: {0}")]
    Config(String),

    /// Local control endpoint could not be reached or decoded
    #[error("control request failed: {0}")]
    Control(#[from] reqwest::Error),

    /// DNS lookup failed for a reason other than "not found"
    #[error("dns lookup failed: {0}")]
    Dns(String),

    /// A record could not be parsed
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// Requested port lies outside this instance's budget
    #[error("can't assign port {port}, >= max {max}")]
    PortBudget {
        /// Port that was requested.
        port: u32,
        /// Exclusive upper bound.
        max: u32,
    },

    /// Port offset lies outside the per-instance range
    #[error("port offset {0} out of range")]
    OffsetOutOfRange(u16),

    /// Address could not be parsed
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for mesh results.
pub type Result<T> = std::result::Result<T, MeshError>;
