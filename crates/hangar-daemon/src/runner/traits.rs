// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! Defines the abstract interface for launching instance processes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The package command line is empty.
    #[error("Empty command")]
    EmptyCommand,

    /// Process failed to start.
    #[error("Process start failed: {0}")]
    StartFailed(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Options for launching an instance.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Machine ID assigned to the instance
    pub machine_id: String,
    /// Virtual region of the instance
    pub region: String,
    /// Primary port the instance listens on
    pub port: u16,
    /// Exclusive upper bound of the instance's port range
    pub max_port: u32,
    /// Discovery endpoint the instance should call
    pub control_url: String,
    /// Command line to run (split on whitespace)
    pub package: String,
    /// Custom environment variables (applied after system vars, can override)
    pub env: HashMap<String, String>,
}

impl LaunchOptions {
    /// Environment handed to the instance process.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("PORT".to_string(), self.port.to_string()),
            ("MAXPORT".to_string(), self.max_port.to_string()),
            ("LOCAL_CONTROL_URL".to_string(), self.control_url.clone()),
            ("LOCAL_MACHINE_ID".to_string(), self.machine_id.clone()),
            ("LOCAL_REGION".to_string(), self.region.clone()),
        ];
        vars.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}

/// Resolves with the exit code once the launched process has ended.
///
/// `None` means the process ended without a code (signal, or its status
/// could not be collected).
pub type ExitFuture = Pin<Box<dyn Future<Output = Option<i32>> + Send>>;

/// A launched instance.
pub struct Launched {
    /// PID of the spawned process, when there is one.
    pub pid: Option<u32>,
    /// When the instance was started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Completes when the process exits.
    pub exit: ExitFuture,
}

/// Trait for instance runners.
///
/// Runners only start processes and report their exit. Bookkeeping of which
/// instance is running belongs to the caller.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runner type identifier (e.g., "process", "mock")
    fn runner_type(&self) -> &'static str;

    /// Launch an instance without waiting for it to finish.
    async fn launch(&self, options: &LaunchOptions) -> Result<Launched>;
}
