// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy. Setup failures are fatal; everything else is recoverable
// and leaves the shared tables exactly as they were before the attempt.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::ProcessHandle;
use crate::registry::InstanceId;

/// Shared-resource creation or attach failure. Fatal at startup.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to attach {resource} `{name}`: {source}")]
    Attach {
        resource: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{resource} layout mismatch: {detail}")]
    LayoutMismatch {
        resource: &'static str,
        detail: String,
    },

    #[error("could not register instance: {0}")]
    Register(#[from] RegistryError),

    #[error("could not attach mailbox: {0}")]
    Bus(#[from] BusError),

    #[error("failed to start {thread} thread: {source}")]
    Thread {
        thread: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl SetupError {
    pub(crate) fn attach(resource: &'static str, name: &str, source: io::Error) -> Self {
        Self::Attach {
            resource,
            name: name.to_owned(),
            source,
        }
    }

    /// Like [`attach`](Self::attach), but a segment sized for a different
    /// layout is reported as a mismatch.
    pub(crate) fn segment(resource: &'static str, name: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::InvalidData {
            return Self::LayoutMismatch {
                resource,
                detail: source.to_string(),
            };
        }
        Self::attach(resource, name, source)
    }

    pub fn code(&self) -> &'static str {
        match self {
            SetupError::Attach { .. } => "SET001",
            SetupError::LayoutMismatch { .. } => "SET002",
            SetupError::Register(_) => "SET003",
            SetupError::Thread { .. } => "SET004",
            SetupError::Config(_) => "SET005",
            SetupError::Bus(_) => "SET006",
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("process table is full ({capacity} slots)")]
    Full { capacity: usize },

    #[error("instance table is full ({capacity} slots)")]
    InstancesFull { capacity: usize },

    #[error("shared registry has been torn down")]
    TornDown,

    #[error("registry lock failed: {0}")]
    Lock(#[source] io::Error),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Full { .. } => "REG001",
            RegistryError::InstancesFull { .. } => "REG002",
            RegistryError::TornDown => "REG003",
            RegistryError::Lock(_) => "REG004",
        }
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    /// The bus was destroyed. Listener loops treat this as their exit signal.
    #[error("notification bus has been removed")]
    Removed,

    #[error("no instance attached at mailbox for {0}")]
    UnknownRecipient(InstanceId),

    #[error("bus lock failed: {0}")]
    Lock(#[source] io::Error),

    #[error("bus wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            BusError::Removed => "BUS001",
            BusError::UnknownRecipient(_) => "BUS002",
            BusError::Lock(_) => "BUS003",
            BusError::Wait(_) => "BUS004",
            BusError::Registry(_) => "BUS005",
        }
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The child was spawned but could not be recorded; it has been killed.
    #[error("registry full, killed freshly spawned process {handle}")]
    RegistryFull { handle: ProcessHandle },

    #[error("failed to wait for attached process {handle}: {source}")]
    Wait {
        handle: ProcessHandle,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::EmptyCommand => "LCH001",
            LaunchError::Spawn { .. } => "LCH002",
            LaunchError::RegistryFull { .. } => "LCH003",
            LaunchError::Wait { .. } => "LCH004",
            LaunchError::Registry(_) => "LCH005",
        }
    }
}

#[derive(Error, Debug)]
pub enum TerminateError {
    #[error("process {0} is not a managed running process")]
    NotFound(ProcessHandle),

    #[error("failed to signal process {handle}: {source}")]
    SignalFailed {
        handle: ProcessHandle,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl TerminateError {
    pub fn code(&self) -> &'static str {
        match self {
            TerminateError::NotFound(_) => "TRM001",
            TerminateError::SignalFailed { .. } => "TRM002",
            TerminateError::Registry(_) => "TRM003",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
