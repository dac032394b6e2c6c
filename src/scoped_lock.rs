// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RAII guard over a shared mutex. Shared tables are only ever read or written
// while one of these is alive.

use std::io;

use crate::IpcMutex;

/// Locks on construction, unlocks on drop.
pub struct ScopedLock<'a> {
    mtx: &'a IpcMutex,
}

impl<'a> ScopedLock<'a> {
    pub fn new(mtx: &'a IpcMutex) -> io::Result<Self> {
        mtx.lock()?;
        Ok(Self { mtx })
    }

    /// The held mutex, for condition-variable waits that release and
    /// re-acquire it atomically.
    pub(crate) fn mutex(&self) -> &'a IpcMutex {
        self.mtx
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mtx.unlock() {
            tracing::error!(error = %e, "failed to release shared lock");
        }
    }
}
