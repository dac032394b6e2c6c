// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Multi-instance process supervisor. Independent terminals on one host share
// a process table in named shared memory, guarded by a robust mutex stored
// in the same segment, and tell each other about process starts and deaths
// over a shared-memory notification bus.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::ShmHandle;

mod mutex;
pub use mutex::IpcMutex;

mod condition;
pub use condition::IpcCondition;

mod scoped_lock;
pub use scoped_lock::ScopedLock;

pub mod error;
pub use error::{BusError, ConfigError, LaunchError, RegistryError, SetupError, TerminateError};

pub mod config;
pub use config::Config;

pub mod logging;

pub mod process;
pub use process::ProcessHandle;

pub mod registry;
pub use registry::{
    Deregistration, InstanceId, NewProcess, ProcessMode, ProcessRecord, ProcessStatus, Registry,
    SlotIndex,
};

pub mod bus;
pub use bus::{Bus, Notification, NotificationKind, Recipient};

pub mod monitor;
pub use monitor::{LivenessMonitor, MonitorPass};

pub mod listener;
pub use listener::{EventHook, ListenerOutcome, NotificationListener};

pub mod lifecycle;
pub use lifecycle::Lifecycle;

pub mod shutdown;
pub use shutdown::{ShutdownSequence, Stage, StopSignal};

pub mod instance;
pub use instance::{Instance, ShutdownReport};
