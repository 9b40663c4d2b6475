// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance supervision.
//!
//! An [`InstanceRecord`] is one configured slot: a machine ID, a region and a
//! port range. The process behind it is started lazily by
//! [`InstanceRecord::ensure_running`] and its exit is observed by a watcher
//! task that clears the running state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use hangar_mesh::{InstanceInfo, PORT_RANGE};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::runner::{LaunchOptions, Runner};

/// Address peers are advertised with by the local control endpoint.
pub const LOCAL_PEER_ADDRESS: &str = "::1";

/// State of a running instance.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// PID of the process, if the runner has one.
    pub pid: Option<u32>,
    /// When the instance was started.
    pub started_at: DateTime<Utc>,
    generation: u64,
}

/// One configured instance slot.
pub struct InstanceRecord {
    machine_id: String,
    region: String,
    port: u16,
    control_port: u16,
    package: String,
    runner: Arc<dyn Runner>,
    run: RwLock<Option<RunHandle>>,
    generation: AtomicU64,
    active: AtomicUsize,
}

impl std::fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("machine_id", &self.machine_id)
            .field("region", &self.region)
            .field("port", &self.port)
            .field("active", &self.active_requests())
            .finish_non_exhaustive()
    }
}

impl InstanceRecord {
    /// Create a stopped instance slot.
    pub fn new(
        machine_id: impl Into<String>,
        region: impl Into<String>,
        port: u16,
        control_port: u16,
        package: impl Into<String>,
        runner: Arc<dyn Runner>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            region: region.into(),
            port,
            control_port,
            package: package.into(),
            runner,
            run: RwLock::new(None),
            generation: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Machine ID of this slot.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Region of this slot.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Primary (data) port of this slot.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Exclusive upper bound of this slot's port range.
    pub fn max_port(&self) -> u32 {
        u32::from(self.port) + u32::from(PORT_RANGE)
    }

    /// Discovery URL handed to the instance.
    pub fn control_url(&self) -> String {
        format!(
            "http://localhost:{}/__/control?machine={}",
            self.control_port, self.machine_id
        )
    }

    /// Options the runner is called with.
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            machine_id: self.machine_id.clone(),
            region: self.region.clone(),
            port: self.port,
            max_port: self.max_port(),
            control_url: self.control_url(),
            package: self.package.clone(),
            env: Default::default(),
        }
    }

    /// How this slot is advertised to peers.
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            machine: self.machine_id.clone(),
            region: self.region.clone(),
            address: LOCAL_PEER_ADDRESS.to_string(),
            port: self.port,
        }
    }

    /// Whether a process is currently running for this slot.
    pub async fn is_alive(&self) -> bool {
        self.run.read().await.is_some()
    }

    /// Current run state, if running.
    pub async fn run_handle(&self) -> Option<RunHandle> {
        self.run.read().await.clone()
    }

    /// Number of proxied requests currently in flight.
    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Count a proxied request until the returned guard is dropped.
    pub fn begin_request(self: &Arc<Self>) -> ActiveRequest {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveRequest {
            instance: Arc::clone(self),
        }
    }

    /// Start the process unless it is already running.
    ///
    /// Returns true only if this call started it. Concurrent callers
    /// serialize on the run lock, so at most one of them launches.
    pub async fn ensure_running(self: &Arc<Self>) -> bool {
        let mut run = self.run.write().await;
        if run.is_some() {
            return false;
        }

        let options = self.launch_options();
        let launched = match self.runner.launch(&options).await {
            Ok(launched) => launched,
            Err(e) => {
                error!(
                    machine = %self.machine_id,
                    region = %self.region,
                    runner = self.runner.runner_type(),
                    error = %e,
                    "Failed to start instance"
                );
                return false;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *run = Some(RunHandle {
            pid: launched.pid,
            started_at: launched.started_at,
            generation,
        });
        drop(run);

        info!(
            machine = %self.machine_id,
            region = %self.region,
            port = self.port,
            pid = ?launched.pid,
            "Instance running"
        );

        let instance = Arc::clone(self);
        let exit = launched.exit;
        tokio::spawn(async move {
            let code = exit.await;
            instance.mark_exited(generation, code).await;
        });

        true
    }

    async fn mark_exited(&self, generation: u64, code: Option<i32>) {
        let mut run = self.run.write().await;
        if run.as_ref().is_some_and(|h| h.generation == generation) {
            *run = None;
        }
        match code {
            Some(0) => info!(machine = %self.machine_id, "Instance stopped"),
            Some(code) => warn!(machine = %self.machine_id, exit_code = code, "Instance stopped"),
            None => warn!(machine = %self.machine_id, "Instance stopped without exit code"),
        }
    }

    /// Ask the running process to terminate with SIGTERM.
    ///
    /// Returns false if there was nothing to signal. The run state is
    /// cleared by the exit watcher, not here.
    pub async fn stop(&self) -> crate::error::Result<bool> {
        let Some(pid) = self.run.read().await.as_ref().and_then(|h| h.pid) else {
            return Ok(false);
        };
        let raw = i32::try_from(pid).map_err(|_| crate::Error::Other(format!("pid {pid} out of range")))?;

        match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => {
                debug!(machine = %self.machine_id, pid, "Sent SIGTERM to instance");
                Ok(true)
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!(machine = %self.machine_id, pid, "Instance already gone (ESRCH)");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps an instance's active-request count raised while alive.
#[derive(Debug)]
pub struct ActiveRequest {
    instance: Arc<InstanceRecord>,
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.instance.active.fetch_sub(1, Ordering::SeqCst);
    }
}
