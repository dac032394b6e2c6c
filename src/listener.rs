// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Notification Listener: blocks on this instance's mailbox and applies the
// side effects of each event. Errors never escape the loop; a removed bus
// or a lost mailbox ends it.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{Bus, Notification, NotificationKind};
use crate::error::BusError;
use crate::process::{self, Delivery};
use crate::registry::{InstanceId, Registry};
use crate::shutdown::StopSignal;

/// Called for every START and TERMINATE this instance receives.
pub type EventHook = Arc<dyn Fn(&Notification) + Send + Sync>;

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOutcome {
    Started,
    /// `found` is true when this listener retired a still-active record.
    Terminated { found: bool },
    /// SIGTERM could not be delivered; the record stays active.
    SignalFailed,
    Ignored,
    Stop,
}

pub struct NotificationListener {
    registry: Arc<Registry>,
    bus: Arc<Bus>,
    id: InstanceId,
    stop: StopSignal,
    hook: Option<EventHook>,
}

impl NotificationListener {
    pub fn new(registry: Arc<Registry>, bus: Arc<Bus>, id: InstanceId, stop: StopSignal) -> Self {
        Self {
            registry,
            bus,
            id,
            stop,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Option<EventHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("listener-{}", self.id))
            .spawn(move || self.run())
    }

    fn run(&self) {
        debug!(instance = %self.id, "listener started");
        while !self.stop.is_triggered() {
            match self.bus.receive(self.id) {
                Ok(n) => {
                    if self.handle(&n) == ListenerOutcome::Stop {
                        break;
                    }
                }
                Err(BusError::Removed) => {
                    info!(instance = %self.id, "bus removed, listener exiting");
                    break;
                }
                Err(BusError::UnknownRecipient(_)) => {
                    debug!(instance = %self.id, "mailbox detached, listener exiting");
                    break;
                }
                Err(e) => {
                    warn!(instance = %self.id, error = %e, code = e.code(), "receive failed");
                    if self.stop.wait_timeout(ERROR_BACKOFF) {
                        break;
                    }
                }
            }
        }
        debug!(instance = %self.id, "listener stopped");
    }

    /// Apply one notification.
    pub fn handle(&self, n: &Notification) -> ListenerOutcome {
        match n.kind {
            NotificationKind::Start => {
                info!(
                    instance = %self.id,
                    sender = %n.sender,
                    pid = ?n.target.map(|h| h.as_raw()),
                    "START"
                );
                self.notify_hook(n);
                ListenerOutcome::Started
            }
            NotificationKind::Terminate => {
                let Some(handle) = n.target else {
                    warn!(sender = %n.sender, "TERMINATE without a target ignored");
                    return ListenerOutcome::Ignored;
                };
                match process::terminate(handle) {
                    Ok(Delivery::Delivered) => debug!(pid = %handle, "sent SIGTERM"),
                    Ok(Delivery::NoSuchProcess) => {}
                    Err(e) => {
                        // The process may still be running; keep its record.
                        warn!(
                            instance = %self.id,
                            sender = %n.sender,
                            pid = %handle,
                            error = %e,
                            "could not signal process, record kept"
                        );
                        self.notify_hook(n);
                        return ListenerOutcome::SignalFailed;
                    }
                }
                let found = match self.registry.free_slot(handle) {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(pid = %handle, error = %e, "failed to free slot");
                        false
                    }
                };
                info!(
                    instance = %self.id,
                    sender = %n.sender,
                    pid = %handle,
                    found,
                    "TERMINATE"
                );
                self.notify_hook(n);
                ListenerOutcome::Terminated { found }
            }
            NotificationKind::Shutdown => {
                if n.sender != self.id {
                    info!(instance = %self.id, sender = %n.sender, "remote SHUTDOWN");
                }
                ListenerOutcome::Stop
            }
            NotificationKind::Unknown(code) => {
                warn!(instance = %self.id, sender = %n.sender, code, "unknown notification ignored");
                ListenerOutcome::Ignored
            }
        }
    }

    fn notify_hook(&self, n: &Notification) {
        if let Some(hook) = &self.hook {
            hook(n);
        }
    }
}
