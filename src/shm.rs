// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory region with a one-time initialiser.

use std::io;
use std::sync::Arc;

use crate::platform::PlatformShm;

/// A named, inter-process shared memory region.
///
/// The creator initialises the region before anyone else may touch it, so
/// the locks a region embeds always exist by the time an opener sees it. A
/// counter in the segment prefix tracks how many processes map it; when the
/// last mapping goes away the name is unlinked.
#[derive(Clone)]
pub struct ShmHandle {
    inner: Arc<PlatformShm>,
    created: bool,
}

impl ShmHandle {
    /// Acquire a named region of `size` usable bytes, creating it if absent.
    ///
    /// If this call creates the region, `init` runs on its zero-filled bytes
    /// and the region is published only once `init` succeeds. Otherwise the
    /// call waits for the creator to publish. Attaching to an existing
    /// region smaller than `size` fails with `InvalidData`.
    pub fn acquire<F>(name: &str, size: usize, init: F) -> io::Result<Self>
    where
        F: FnOnce(*mut u8) -> io::Result<()>,
    {
        let (inner, created) = PlatformShm::acquire(name, size)?;
        if created {
            if let Err(e) = init(inner.as_mut_ptr()) {
                inner.unlink_if_current();
                return Err(e);
            }
            inner.publish();
        } else {
            inner.wait_ready()?;
        }
        Ok(Self { inner, created })
    }

    /// Pointer to the start of the usable region.
    pub fn get(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// True when this handle created (and initialised) the region.
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Force-remove the name. Live mappings stay valid.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Remove a named segment without an open handle.
    pub fn clear_storage(name: &str) {
        PlatformShm::unlink_by_name(name);
    }

    /// Typed pointer to the `T` at `offset`, bounds and alignment checked.
    pub(crate) fn at<T>(&self, offset: usize) -> io::Result<*mut T> {
        let fits = offset
            .checked_add(std::mem::size_of::<T>())
            .is_some_and(|end| end <= self.inner.user_size());
        let p = self.get().wrapping_add(offset);
        if !fits || (p as usize) % std::mem::align_of::<T>() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} is not a valid slot in {}", self.inner.name()),
            ));
        }
        Ok(p as *mut T)
    }
}
