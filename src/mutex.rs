// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Inter-process mutex embedded in a shared segment.

use std::io;

use crate::platform::PlatformMutex;
use crate::ShmHandle;

/// A robust, process-shared mutex living inside a [`ShmHandle`] region.
///
/// A `pthread_mutex_t` with `PTHREAD_PROCESS_SHARED` and (off macOS)
/// `PTHREAD_MUTEX_ROBUST`. Because it is stored in the segment it guards,
/// a handle on the segment and its lock can never disagree about which
/// generation of the segment they belong to. Callers go through
/// [`ScopedLock`](crate::ScopedLock).
pub struct IpcMutex {
    _region: ShmHandle,
    inner: PlatformMutex,
}

impl IpcMutex {
    /// Bytes a mutex occupies inside a region.
    pub const SIZE: usize = std::mem::size_of::<libc::pthread_mutex_t>();

    /// Initialise a mutex at `ptr`. Meant for a region initialiser passed
    /// to [`ShmHandle::acquire`].
    ///
    /// # Safety
    /// `ptr` must be valid for `SIZE` bytes of writes, 8-byte aligned, and
    /// not yet visible to any other thread or process.
    pub unsafe fn init_at(ptr: *mut u8) -> io::Result<()> {
        PlatformMutex::init(ptr as *mut libc::pthread_mutex_t)
    }

    /// Bind to the mutex the region's initialiser placed at `offset`.
    pub fn in_region(region: &ShmHandle, offset: usize) -> io::Result<Self> {
        let mtx = region.at::<libc::pthread_mutex_t>(offset)?;
        Ok(Self {
            _region: region.clone(),
            inner: unsafe { PlatformMutex::from_raw(mtx) },
        })
    }

    /// Blocking lock. Recovers from an owner that died holding it.
    pub fn lock(&self) -> io::Result<()> {
        self.inner.lock()
    }

    pub fn unlock(&self) -> io::Result<()> {
        self.inner.unlock()
    }

    /// Recover a robust mutex re-acquired after its owner died.
    #[cfg(not(target_os = "macos"))]
    pub(crate) fn mark_consistent(&self) -> io::Result<()> {
        self.inner.mark_consistent()
    }

    pub(crate) fn native_mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.inner.as_raw()
    }
}
