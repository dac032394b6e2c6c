// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// OS process collaborators: spawn, signal delivery, liveness check, reaping.
// Everything here is non-blocking except `wait`.

use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::LaunchError;
use crate::registry::ProcessMode;

/// OS process identifier of a managed child. Unique only while it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessHandle(libc::pid_t);

impl ProcessHandle {
    pub const fn from_raw(pid: libc::pid_t) -> Self {
        Self(pid)
    }

    pub const fn as_raw(self) -> libc::pid_t {
        self.0
    }

    /// Zero and negative pids address process groups in `kill(2)`; never
    /// signal those by accident.
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a signal that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The process is already gone (`ESRCH`).
    NoSuchProcess,
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    Exited(i32),
    Signaled(i32),
    Other,
}

impl ExitInfo {
    fn from_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            ExitInfo::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitInfo::Signaled(libc::WTERMSIG(status))
        } else {
            ExitInfo::Other
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitInfo::Exited(code) => write!(f, "exit code {code}"),
            ExitInfo::Signaled(sig) => write!(f, "signal {sig}"),
            ExitInfo::Other => f.write_str("unknown status"),
        }
    }
}

/// Result of a non-blocking reap of one specific child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapStatus {
    Exited(ExitInfo),
    Running,
    /// Not a child of this process, or already reaped by someone else.
    NotChild,
}

pub fn current_pid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

/// Launch `command` (whitespace-separated program and arguments).
///
/// Detached children get their own session via `setsid` so the launching
/// terminal's hangup and job-control signals do not reach them, and stdin
/// is closed so they never compete with the menu for input.
///
/// The returned child is never waited on by `std`; reaping happens through
/// [`wait`], [`try_reap`] or [`reap_any`].
pub fn spawn(command: &str, mode: ProcessMode) -> Result<ProcessHandle, LaunchError> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or(LaunchError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(parts);

    if mode == ProcessMode::Detached {
        cmd.stdin(Stdio::null());
        // Safety: setsid is async-signal-safe and runs in the forked child
        // before exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        command: command.to_owned(),
        source,
    })?;
    let handle = ProcessHandle(child.id() as libc::pid_t);
    debug!(pid = %handle, ?mode, "spawned child");
    Ok(handle)
}

/// Send `sig` to `handle`, distinguishing "already gone" from real failures.
pub fn signal(handle: ProcessHandle, sig: libc::c_int) -> io::Result<Delivery> {
    if !handle.is_valid() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {handle}"),
        ));
    }
    if unsafe { libc::kill(handle.0, sig) } == 0 {
        return Ok(Delivery::Delivered);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(Delivery::NoSuchProcess);
    }
    Err(err)
}

/// SIGTERM.
pub fn terminate(handle: ProcessHandle) -> io::Result<Delivery> {
    signal(handle, libc::SIGTERM)
}

/// SIGKILL.
pub fn kill(handle: ProcessHandle) -> io::Result<Delivery> {
    signal(handle, libc::SIGKILL)
}

/// Zero-effect existence check. `EPERM` means the pid exists but belongs to
/// someone else, which still counts as alive.
pub fn is_alive(handle: ProcessHandle) -> bool {
    if !handle.is_valid() {
        return false;
    }
    if unsafe { libc::kill(handle.0, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Non-blocking reap of one specific child.
pub fn try_reap(handle: ProcessHandle) -> ReapStatus {
    if !handle.is_valid() {
        return ReapStatus::NotChild;
    }
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(handle.0, &mut status, libc::WNOHANG) };
        if ret == handle.0 {
            return ReapStatus::Exited(ExitInfo::from_status(status));
        }
        if ret == 0 {
            return ReapStatus::Running;
        }
        if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return ReapStatus::NotChild;
    }
}

/// Reap any one exited child of this process without blocking.
pub fn reap_any() -> Option<(ProcessHandle, ExitInfo)> {
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if ret > 0 {
            return Some((ProcessHandle(ret), ExitInfo::from_status(status)));
        }
        if ret == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return None;
    }
}

/// Block until `handle` exits.
///
/// `Ok(None)` means another reaper (the liveness monitor, for instance)
/// collected the child first; it has exited either way.
pub fn wait(handle: ProcessHandle) -> io::Result<Option<ExitInfo>> {
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(handle.0, &mut status, 0) };
        if ret == handle.0 {
            return Ok(Some(ExitInfo::from_status(status)));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return Ok(None),
            _ => return Err(err),
        }
    }
}
