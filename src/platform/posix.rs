// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory segments and process-shared robust mutexes.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::shm_name;

// ---------------------------------------------------------------------------
// Robust mutex symbols. macOS has no robust mutexes.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Layout: an 8-byte prefix, then the user region rounded up to 8 bytes.
//
//   refs:  AtomicI32  handles (across all processes) mapping the object
//   ready: AtomicU32  READY once the creator has initialised the user region
//
// The prefix sits at offset 0 so that handles configured with different
// sizes still agree on where it is.
// ---------------------------------------------------------------------------

const ALIGN: usize = 8;
const PREFIX: usize = 8;
const READY: u32 = 0x5244_5921;

/// How long an opener waits for a concurrent creator to size and initialise
/// the object before giving up on it.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) fn calc_size(user_size: usize) -> usize {
    PREFIX + user_size.div_ceil(ALIGN) * ALIGN
}

/// # Safety
/// `mem` must point to a live mapping of at least `PREFIX` bytes.
unsafe fn refs_of<'a>(mem: *mut u8) -> &'a AtomicI32 {
    &*(mem as *const AtomicI32)
}

/// # Safety
/// `mem` must point to a live mapping of at least `PREFIX` bytes.
unsafe fn ready_of<'a>(mem: *mut u8) -> &'a AtomicU32 {
    &*(mem.add(4) as *const AtomicU32)
}

fn backoff(round: u32) {
    match round {
        0..=15 => thread::yield_now(),
        _ => thread::sleep(Duration::from_millis(1)),
    }
}

// ---------------------------------------------------------------------------
// Process-local mapping cache.
//
// Every handle inside one process that opens the same object shares one
// mapping: pthread objects embedded in it must be used through a single
// address per process, and several supervisor instances may live in one
// process. Entries are keyed by inode so a name that was unlinked and
// recreated never resolves to the old object's mapping.
// ---------------------------------------------------------------------------

type MappingCache = HashMap<(String, u64), Weak<PlatformShm>>;

fn mapping_cache() -> &'static Mutex<MappingCache> {
    static CACHE: OnceLock<Mutex<MappingCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    user_size: usize,
    name: String,
    ino: u64,
}

// Safety: the mapping is process-shared; callers synchronise through the
// mutexes embedded in each segment.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

fn shm_open(c_name: &CString, flags: libc::c_int) -> io::Result<i32> {
    let perms: libc::mode_t = 0o666;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, perms as libc::c_uint) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn fstat(fd: i32) -> io::Result<libc::stat> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

/// Unlink `c_name` only while it still names the object with inode `ino`.
fn unlink_if_same(c_name: &CString, ino: u64) {
    let Ok(fd) = shm_open(c_name, libc::O_RDONLY) else {
        return;
    };
    let same = fstat(fd).is_ok_and(|st| st.st_ino as u64 == ino);
    unsafe { libc::close(fd) };
    if same {
        unsafe { libc::shm_unlink(c_name.as_ptr()) };
    }
}

/// Open the object, creating it when absent. `true` when this call created it.
fn open_or_create(c_name: &CString) -> io::Result<(i32, bool)> {
    let exclusive = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;
    loop {
        match shm_open(c_name, exclusive) {
            Ok(fd) => return Ok((fd, true)),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {}
            Err(e) => return Err(e),
        }
        match shm_open(c_name, libc::O_RDWR) {
            Ok(fd) => return Ok((fd, false)),
            // Unlinked between the two calls; try to create it again.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Wait until a concurrent creator has sized the object.
///
/// A zero-length object is one whose creator has not reached `ftruncate`
/// yet. An object that stays empty past the deadline is abandoned and
/// unlinked so the next opener can create a fresh one. A non-empty object
/// smaller than `total` was sized by a creator with a different layout.
fn wait_for_size(
    fd: i32,
    c_name: &CString,
    posix_name: &str,
    total: usize,
) -> io::Result<libc::stat> {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    let mut round = 0;
    loop {
        let st = fstat(fd)?;
        let len = st.st_size as usize;
        if len >= total {
            return Ok(st);
        }
        if len > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment {posix_name} is {len} bytes, expected at least {total}"),
            ));
        }
        if Instant::now() >= deadline {
            unlink_if_same(c_name, st.st_ino as u64);
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("segment {posix_name} was never sized by its creator"),
            ));
        }
        backoff(round);
        round += 1;
    }
}

impl PlatformShm {
    /// Map the named object, creating it when absent.
    ///
    /// Returns the mapping and whether this call created the object. A
    /// creator must call [`publish`](Self::publish) once the user region is
    /// initialised; everyone else waits for that with
    /// [`wait_ready`](Self::wait_ready).
    pub fn acquire(name: &str, user_size: usize) -> io::Result<(Arc<Self>, bool)> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let total_size = calc_size(user_size);

        let (fd, created) = open_or_create(&c_name)?;
        unsafe { libc::fchmod(fd, 0o666) };

        // Only the creator truncates: resizing an object another process
        // already sized can wipe its contents on some kernels.
        let st = if created {
            let sized = if unsafe { libc::ftruncate(fd, total_size as libc::off_t) } == 0 {
                fstat(fd)
            } else {
                Err(io::Error::last_os_error())
            };
            match sized {
                Ok(st) => st,
                Err(e) => {
                    unsafe {
                        libc::shm_unlink(c_name.as_ptr());
                        libc::close(fd);
                    }
                    return Err(e);
                }
            }
        } else {
            match wait_for_size(fd, &c_name, &posix_name, total_size) {
                Ok(st) => st,
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            }
        };
        let ino = st.st_ino as u64;

        let mut cache = mapping_cache().lock().unwrap_or_else(PoisonError::into_inner);
        let key = (posix_name, ino);
        if let Some(existing) = cache.get(&key).and_then(Weak::upgrade) {
            unsafe { libc::close(fd) };
            if existing.size < total_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "segment {} is mapped with {} bytes, expected at least {total_size}",
                        existing.name, existing.size
                    ),
                ));
            }
            // Another thread here may have mapped our new object first.
            return Ok((existing, created));
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if created {
                unlink_if_same(&c_name, ino);
            }
            return Err(err);
        }
        unsafe { refs_of(mem as *mut u8).fetch_add(1, Ordering::AcqRel) };

        let (posix_name, _) = key;
        let shm = Arc::new(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name: posix_name.clone(),
            ino,
        });
        cache.retain(|_, w| w.strong_count() > 0);
        cache.insert((posix_name, ino), Arc::downgrade(&shm));
        Ok((shm, created))
    }

    /// Start of the user region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { self.mem.add(PREFIX) }
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the user region initialised.
    pub fn publish(&self) {
        unsafe { ready_of(self.mem).store(READY, Ordering::Release) };
    }

    /// Block until the creator has published the user region.
    ///
    /// A segment still unpublished at the deadline belongs to a creator that
    /// died mid-initialisation; its name is unlinked so it can be rebuilt.
    pub fn wait_ready(&self) -> io::Result<()> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        let ready = unsafe { ready_of(self.mem) };
        let mut round = 0;
        while ready.load(Ordering::Acquire) != READY {
            if Instant::now() >= deadline {
                self.unlink_if_current();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("segment {} was never initialised by its creator", self.name),
                ));
            }
            backoff(round);
            round += 1;
        }
        Ok(())
    }

    /// Remove the name. Existing mappings stay valid until dropped.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Unlink only if the name still refers to the object this handle maps.
    /// After an explicit teardown the name may already belong to a segment
    /// a newer instance created.
    pub fn unlink_if_current(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unlink_if_same(&c_name, self.ino);
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        // No pthread_*_destroy on embedded objects: other processes may still
        // be using them. Unmap + unlink reclaims the memory.
        let prev = unsafe { refs_of(self.mem).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink_if_current();
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformMutex: pthread_mutex_t embedded in a mapped segment.
// ---------------------------------------------------------------------------

pub struct PlatformMutex {
    mtx: *mut libc::pthread_mutex_t,
}

// Safety: the pointee is a process-shared pthread mutex.
unsafe impl Send for PlatformMutex {}
unsafe impl Sync for PlatformMutex {}

impl PlatformMutex {
    /// Initialise a mutex in place, `PTHREAD_PROCESS_SHARED` and, where
    /// supported, `PTHREAD_MUTEX_ROBUST` so that an instance that dies while
    /// holding the lock does not wedge every other terminal.
    ///
    /// # Safety
    /// `mtx` must be valid for writes, suitably aligned, and not yet visible
    /// to any other thread or process.
    pub unsafe fn init(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
        ptr::write_bytes(mtx, 0, 1);

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_mutexattr_init(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }

        eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }

        #[cfg(not(target_os = "macos"))]
        {
            eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
            if eno != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(io::Error::from_raw_os_error(eno));
            }
        }

        eno = libc::pthread_mutex_init(mtx, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// # Safety
    /// `mtx` must point to a mutex set up by [`init`](Self::init) whose
    /// mapping outlives the returned value.
    pub unsafe fn from_raw(mtx: *mut libc::pthread_mutex_t) -> Self {
        Self { mtx }
    }

    /// Blocking lock. A previous owner that died with the lock held
    /// (`EOWNERDEAD`) is recovered with `pthread_mutex_consistent`.
    pub fn lock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_lock(self.mtx) };
        match eno {
            0 => Ok(()),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => self.mark_consistent(),
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    #[cfg(not(target_os = "macos"))]
    pub(crate) fn mark_consistent(&self) -> io::Result<()> {
        tracing::warn!("previous lock owner died, recovering");
        let eno = unsafe { pthread_mutex_consistent(self.mtx) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    pub fn unlock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_unlock(self.mtx) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    pub(crate) fn as_raw(&self) -> *mut libc::pthread_mutex_t {
        self.mtx
    }
}
