// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Liveness Monitor: periodically reconciles the process table with what the
// OS says is actually running.
//
// Three independent passes, each idempotent through `free_slot`:
//   1. children this instance owns: non-blocking reap of that pid
//   2. children owned elsewhere: existence check
//   3. catch-all: reap any exited child of ours, matched back by pid

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{Bus, NotificationKind};
use crate::config::Config;
use crate::error::BusError;
use crate::process::{self, ProcessHandle, ReapStatus};
use crate::registry::{InstanceId, Registry};
use crate::shutdown::StopSignal;

/// Handles retired by one reconciliation, grouped by the pass that caught
/// them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorPass {
    pub owned_reaped: Vec<ProcessHandle>,
    pub vanished: Vec<ProcessHandle>,
    pub orphans: Vec<ProcessHandle>,
}

impl MonitorPass {
    pub fn is_empty(&self) -> bool {
        self.owned_reaped.is_empty() && self.vanished.is_empty() && self.orphans.is_empty()
    }

    pub fn retired(&self) -> impl Iterator<Item = ProcessHandle> + '_ {
        self.owned_reaped
            .iter()
            .chain(&self.vanished)
            .chain(&self.orphans)
            .copied()
    }
}

pub struct LivenessMonitor {
    registry: Arc<Registry>,
    bus: Arc<Bus>,
    id: InstanceId,
    interval: Duration,
    reap_orphans: bool,
    stop: StopSignal,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<Bus>,
        id: InstanceId,
        config: &Config,
        stop: StopSignal,
    ) -> Self {
        Self {
            registry,
            bus,
            id,
            interval: config.poll_interval(),
            reap_orphans: config.reap_orphans,
            stop,
        }
    }

    /// Run the loop on its own thread until the stop signal fires.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("monitor-{}", self.id))
            .spawn(move || self.run())
    }

    fn run(&self) {
        debug!(instance = %self.id, interval = ?self.interval, "liveness monitor started");
        loop {
            let pass = self.reconcile_once();
            if !pass.is_empty() {
                debug!(instance = %self.id, ?pass, "reconciled");
            }
            if self.stop.wait_timeout(self.interval) {
                break;
            }
        }
        debug!(instance = %self.id, "liveness monitor stopped");
    }

    /// One full reconciliation. Never fails; problems are logged.
    pub fn reconcile_once(&self) -> MonitorPass {
        let mut pass = MonitorPass::default();

        let records = match self.registry.active_records() {
            Ok(records) => records,
            Err(e) => {
                warn!(instance = %self.id, error = %e, code = e.code(), "cannot read registry");
                return pass;
            }
        };

        for rec in records {
            if rec.owner == self.id {
                match process::try_reap(rec.handle) {
                    ReapStatus::Exited(exit) => {
                        info!(pid = %rec.handle, %exit, "owned process exited");
                        if self.retire(rec.handle) {
                            pass.owned_reaped.push(rec.handle);
                        }
                    }
                    ReapStatus::Running => {}
                    // Collected by another thread of ours (an attached
                    // launch, or pass 3 of an earlier run).
                    ReapStatus::NotChild => {
                        if !process::is_alive(rec.handle) && self.retire(rec.handle) {
                            pass.vanished.push(rec.handle);
                        }
                    }
                }
            } else if !process::is_alive(rec.handle) {
                info!(pid = %rec.handle, owner = %rec.owner, "process no longer exists");
                if self.retire(rec.handle) {
                    pass.vanished.push(rec.handle);
                }
            }
        }

        if self.reap_orphans {
            while let Some((handle, exit)) = process::reap_any() {
                if self.retire(handle) {
                    info!(pid = %handle, %exit, "reaped untracked exit");
                    pass.orphans.push(handle);
                } else {
                    debug!(pid = %handle, %exit, "reaped child with no active record");
                }
            }
        }

        pass
    }

    /// Free the slot and, if this call is the one that retired it, tell
    /// everyone.
    fn retire(&self, handle: ProcessHandle) -> bool {
        match self.registry.free_slot(handle) {
            Ok(true) => {
                self.announce(handle);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(pid = %handle, error = %e, "failed to free slot");
                false
            }
        }
    }

    fn announce(&self, handle: ProcessHandle) {
        match self
            .bus
            .broadcast(&self.registry, NotificationKind::Terminate, self.id, Some(handle))
        {
            Ok(_) => {}
            Err(BusError::Removed) => debug!(pid = %handle, "bus gone, TERMINATE not sent"),
            Err(e) => warn!(pid = %handle, error = %e, "TERMINATE broadcast failed"),
        }
    }
}
