// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hangar-daemon.

use thiserror::Error;

/// Daemon errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Runner (process execution) failed.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),

    /// Outbound HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Signalling a subprocess failed.
    #[error("Signal error: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using daemon Error.
pub type Result<T> = std::result::Result<T, Error>;
