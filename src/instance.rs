// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One supervisor instance: attach to the shared resources, register, run
// the monitor and listener, and leave in order.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{Bus, NotificationKind};
use crate::config::Config;
use crate::error::{BusError, LaunchError, RegistryError, SetupError, TerminateError};
use crate::lifecycle::Lifecycle;
use crate::listener::{EventHook, NotificationListener};
use crate::monitor::LivenessMonitor;
use crate::process::ProcessHandle;
use crate::registry::{Deregistration, InstanceId, ProcessMode, ProcessRecord, Registry};
use crate::shm_name::ResourceNames;
use crate::shutdown::StopSignal;

const ATTACH_ATTEMPTS: usize = 20;
const ATTACH_BACKOFF: Duration = Duration::from_millis(50);

/// What an orderly shutdown did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// This was the last registered instance.
    pub was_last: bool,
    /// Shared resources were destroyed by this instance.
    pub destroyed: bool,
    /// Attached children that were signalled on the way out.
    pub terminated: Vec<ProcessHandle>,
}

pub struct Instance {
    id: InstanceId,
    config: Config,
    registry: Arc<Registry>,
    bus: Arc<Bus>,
    lifecycle: Lifecycle,
    stop: StopSignal,
    monitor: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    finished: bool,
}

impl Instance {
    pub fn start(config: Config) -> Result<Self, SetupError> {
        Self::start_with_hook(config, None)
    }

    /// Start with a callback invoked for every START/TERMINATE received.
    pub fn start_with_hook(config: Config, hook: Option<EventHook>) -> Result<Self, SetupError> {
        config.validate()?;
        let names = ResourceNames::new(&config.namespace);
        let (registry, bus, id) = attach(&names, &config)?;
        let registry = Arc::new(registry);
        let bus = Arc::new(bus);
        let stop = StopSignal::new();

        let mut instance = Self {
            id,
            lifecycle: Lifecycle::new(Arc::clone(&registry), Arc::clone(&bus), id),
            registry,
            bus,
            stop,
            monitor: None,
            listener: None,
            finished: false,
            config,
        };

        // On any `?` below, Drop unwinds the registration.
        let monitor = LivenessMonitor::new(
            Arc::clone(&instance.registry),
            Arc::clone(&instance.bus),
            id,
            &instance.config,
            instance.stop.clone(),
        );
        instance.monitor = Some(monitor.spawn().map_err(|source| SetupError::Thread {
            thread: "monitor",
            source,
        })?);

        let listener = NotificationListener::new(
            Arc::clone(&instance.registry),
            Arc::clone(&instance.bus),
            id,
            instance.stop.clone(),
        )
        .with_hook(hook);
        instance.listener = Some(listener.spawn().map_err(|source| SetupError::Thread {
            thread: "listener",
            source,
        })?);

        info!(instance = %id, namespace = %instance.config.namespace, "instance started");
        Ok(instance)
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// A controller that outlives borrows of `self`, for threads that block
    /// in attached launches.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    pub fn launch(&self, command: &str, mode: ProcessMode) -> Result<ProcessHandle, LaunchError> {
        self.lifecycle.launch(command, mode)
    }

    pub fn terminate(&self, handle: ProcessHandle) -> Result<(), TerminateError> {
        self.lifecycle.terminate(handle)
    }

    pub fn snapshot(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        self.registry.snapshot()
    }

    /// Stop both loops, deregister, and destroy the shared resources if no
    /// other instance remains.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.finish()
    }

    fn finish(&mut self) -> ShutdownReport {
        if self.finished {
            return ShutdownReport::default();
        }
        self.finished = true;

        self.stop.trigger();
        if let Err(e) = self.bus.request_shutdown(self.id) {
            debug!(instance = %self.id, error = %e, "could not wake listener");
        }
        join("monitor", self.monitor.take());
        join("listener", self.listener.take());

        let Deregistration {
            was_last,
            terminated,
        } = match self.registry.deregister_instance(self.id) {
            Ok(d) => d,
            Err(e) => {
                warn!(instance = %self.id, error = %e, "deregistration failed");
                Deregistration {
                    was_last: false,
                    terminated: Vec::new(),
                }
            }
        };

        if !was_last {
            for &handle in &terminated {
                if let Err(e) = self.bus.broadcast(
                    &self.registry,
                    NotificationKind::Terminate,
                    self.id,
                    Some(handle),
                ) {
                    warn!(pid = %handle, error = %e, "TERMINATE broadcast failed");
                }
            }
        }
        if let Err(e) = self.bus.detach(self.id) {
            debug!(instance = %self.id, error = %e, "mailbox detach failed");
        }

        // Bus first: anyone who sees a fresh registry will also see a fresh
        // bus.
        if was_last {
            self.bus.remove();
            self.registry.destroy();
        }

        info!(
            instance = %self.id,
            was_last,
            terminated = terminated.len(),
            "instance stopped"
        );
        ShutdownReport {
            was_last,
            destroyed: was_last,
            terminated,
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}

/// Open both resources and register, retrying while a departing last
/// instance is tearing the old ones down.
fn attach(names: &ResourceNames, config: &Config) -> Result<(Registry, Bus, InstanceId), SetupError> {
    for attempt in 1..=ATTACH_ATTEMPTS {
        let registry = Registry::open(names, config)?;
        let bus = Bus::open(names, config)?;
        match registry.register_instance() {
            Ok(id) => match bus.attach(id) {
                Ok(()) => return Ok((registry, bus, id)),
                Err(BusError::Removed) => {
                    debug!(attempt, "bus removed during attach, retrying");
                    abandon(&registry, &bus, id);
                }
                Err(e) => {
                    abandon(&registry, &bus, id);
                    return Err(e.into());
                }
            },
            Err(RegistryError::TornDown) => {
                debug!(attempt, "registry torn down during attach, retrying");
            }
            Err(e) => return Err(e.into()),
        }
        drop(bus);
        drop(registry);
        thread::sleep(ATTACH_BACKOFF);
    }
    Err(RegistryError::TornDown.into())
}

/// Undo a registration that never became a running instance.
fn abandon(registry: &Registry, bus: &Bus, id: InstanceId) {
    match registry.deregister_instance(id) {
        Ok(d) if d.was_last => {
            bus.remove();
            registry.destroy();
        }
        Ok(_) => {}
        Err(e) => warn!(instance = %id, error = %e, "could not undo registration"),
    }
}

fn join(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!(thread = name, "background thread panicked");
        }
    }
}
