// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lifecycle Controller: the launch and terminate entry points the UI calls.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bus::{Bus, NotificationKind};
use crate::error::{BusError, LaunchError, RegistryError, TerminateError};
use crate::process::{self, Delivery, ProcessHandle};
use crate::registry::{InstanceId, NewProcess, ProcessMode, Registry};

/// Cheap to clone; every clone acts on behalf of the same instance.
#[derive(Clone)]
pub struct Lifecycle {
    registry: Arc<Registry>,
    bus: Arc<Bus>,
    id: InstanceId,
}

impl Lifecycle {
    pub fn new(registry: Arc<Registry>, bus: Arc<Bus>, id: InstanceId) -> Self {
        Self { registry, bus, id }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Spawn `command`, record it and announce START.
    ///
    /// ATTACHED blocks until the child exits, then retires the record and
    /// announces TERMINATE. DETACHED returns right after registration.
    /// A child that cannot be recorded is killed before the error returns.
    pub fn launch(&self, command: &str, mode: ProcessMode) -> Result<ProcessHandle, LaunchError> {
        let handle = process::spawn(command, mode)?;

        if let Err(e) = self
            .registry
            .allocate_slot(NewProcess::new(handle, self.id, command, mode))
        {
            warn!(pid = %handle, error = %e, "could not record process, killing it");
            discard(handle);
            return Err(match e {
                RegistryError::Full { .. } => LaunchError::RegistryFull { handle },
                other => other.into(),
            });
        }
        info!(pid = %handle, %mode, command, "process launched");
        self.announce(NotificationKind::Start, handle);

        if mode == ProcessMode::Attached {
            match process::wait(handle) {
                Ok(Some(exit)) => info!(pid = %handle, %exit, "attached process finished"),
                Ok(None) => debug!(pid = %handle, "attached process reaped elsewhere"),
                Err(source) => return Err(LaunchError::Wait { handle, source }),
            }
            if self.registry.free_slot(handle)? {
                self.announce(NotificationKind::Terminate, handle);
            }
        }
        Ok(handle)
    }

    /// SIGTERM a managed process and retire its record.
    ///
    /// A process that is already gone counts as terminated. Any other
    /// signal failure leaves the table untouched.
    pub fn terminate(&self, handle: ProcessHandle) -> Result<(), TerminateError> {
        if self.registry.find_active(handle)?.is_none() {
            return Err(TerminateError::NotFound(handle));
        }
        match process::terminate(handle) {
            Ok(Delivery::Delivered) => debug!(pid = %handle, "sent SIGTERM"),
            Ok(Delivery::NoSuchProcess) => debug!(pid = %handle, "process already gone"),
            Err(source) => return Err(TerminateError::SignalFailed { handle, source }),
        }
        let freed = self.registry.free_slot(handle)?;
        info!(pid = %handle, "process terminated");
        if freed {
            self.announce(NotificationKind::Terminate, handle);
        }
        Ok(())
    }

    fn announce(&self, kind: NotificationKind, handle: ProcessHandle) {
        match self.bus.broadcast(&self.registry, kind, self.id, Some(handle)) {
            Ok(delivered) => debug!(%kind, pid = %handle, delivered, "announced"),
            Err(BusError::Removed) => debug!(%kind, pid = %handle, "bus gone, not announced"),
            Err(e) => warn!(%kind, pid = %handle, error = %e, "broadcast failed"),
        }
    }
}

/// Kill and reap a child that never made it into the table.
fn discard(handle: ProcessHandle) {
    if let Err(e) = process::kill(handle) {
        warn!(pid = %handle, error = %e, "failed to kill unrecorded child");
        return;
    }
    if let Err(e) = process::wait(handle) {
        warn!(pid = %handle, error = %e, "failed to reap unrecorded child");
    }
}
