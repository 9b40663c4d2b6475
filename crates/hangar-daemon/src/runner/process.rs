// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process runner.
//!
//! Runs the package command as a child process. Output lines are re-emitted
//! as tracing events tagged with the machine ID.

use async_trait::async_trait;
use chrono::Utc;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use super::traits::*;

/// Runner that spawns the package command directly on the host.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a new process runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Launched> {
        let mut parts = options.package.split_whitespace();
        let program = parts.next().ok_or(RunnerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .envs(options.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::StartFailed(format!("{}: command not found", program))
            } else {
                RunnerError::Io(e)
            }
        })?;

        let pid = child.id();
        info!(
            machine = %options.machine_id,
            region = %options.region,
            port = options.port,
            pid = ?pid,
            "Started instance process"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, options.machine_id.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, options.machine_id.clone(), "stderr"));
        }

        let machine_id = options.machine_id.clone();
        let exit = Box::pin(async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(machine = %machine_id, error = %e, "Error waiting for instance process");
                    None
                }
            }
        });

        Ok(Launched {
            pid,
            started_at: Utc::now(),
            exit,
        })
    }
}

async fn pump_lines<R>(reader: R, machine_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(machine = %machine_id, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(machine = %machine_id, stream, error = %e, "Failed reading instance output");
                break;
            }
        }
    }
}
