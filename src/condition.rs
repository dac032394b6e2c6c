// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Inter-process condition variable: pthread_cond_t embedded in a shared
// segment with PTHREAD_PROCESS_SHARED. Bus receivers sleep on it.

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{IpcMutex, ShmHandle};

pub struct IpcCondition {
    _region: ShmHandle,
    cond: *mut libc::pthread_cond_t,
}

// Safety: the pointee is a process-shared pthread condvar kept mapped by
// `_region`.
unsafe impl Send for IpcCondition {}
unsafe impl Sync for IpcCondition {}

impl IpcCondition {
    /// Bytes a condition variable occupies inside a region.
    pub const SIZE: usize = std::mem::size_of::<libc::pthread_cond_t>();

    /// Initialise a condition variable at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for `SIZE` bytes of writes, 8-byte aligned, and
    /// not yet visible to any other thread or process.
    pub unsafe fn init_at(ptr: *mut u8) -> io::Result<()> {
        let cond_ptr = ptr as *mut libc::pthread_cond_t;
        std::ptr::write_bytes(cond_ptr, 0, 1);

        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_condattr_init(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }

        eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_condattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }

        eno = libc::pthread_cond_init(cond_ptr, &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Bind to the condition variable the region's initialiser placed at
    /// `offset`.
    pub fn in_region(region: &ShmHandle, offset: usize) -> io::Result<Self> {
        let cond = region.at::<libc::pthread_cond_t>(offset)?;
        Ok(Self {
            _region: region.clone(),
            cond,
        })
    }

    /// Wait with `mtx` held; it is released for the duration of the wait and
    /// re-acquired before returning. `Ok(false)` on timeout.
    pub fn wait(&self, mtx: &IpcMutex, timeout: Option<Duration>) -> io::Result<bool> {
        let mtx_ptr = mtx.native_mutex_ptr();

        let eno = match timeout {
            None => unsafe { libc::pthread_cond_wait(self.cond, mtx_ptr) },
            Some(d) => {
                // pthread condvars default to CLOCK_REALTIME deadlines.
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let deadline = now + d;
                let ts = libc::timespec {
                    tv_sec: deadline.as_secs() as libc::time_t,
                    tv_nsec: deadline.subsec_nanos() as libc::c_long,
                };
                unsafe { libc::pthread_cond_timedwait(self.cond, mtx_ptr, &ts) }
            }
        };
        match eno {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            #[cfg(not(target_os = "macos"))]
            libc::EOWNERDEAD => {
                mtx.mark_consistent()?;
                Ok(true)
            }
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_cond_broadcast(self.cond) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }
}
