// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Registry Store: the process table and the instance table, both living in
// one named shared segment together with the robust mutex that guards them.
//
// Segment layout (all offsets 8-byte aligned):
//
//   mutex | Header | InstanceSlot[instance_capacity] | RawRecord[process_capacity]
//
// Slots are never removed, only flagged inactive and later overwritten.

use std::fmt;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{RegistryError, SetupError};
use crate::process::{self, Delivery, ProcessHandle};
use crate::shm_name::ResourceNames;
use crate::{IpcMutex, ScopedLock, ShmHandle};

/// Bytes of command text kept per record, including room for a terminator.
pub const COMMAND_MAX: usize = 256;

const MAGIC: u32 = 0x5052_4358; // "PRCX"
const LAYOUT_VERSION: u32 = 1;

pub type SlotIndex = usize;

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// Identity of a registered instance: generation in the high 32 bits, slot in
/// the low 32. The slot also addresses the instance's bus mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub const fn new(generation: u32, slot: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn slot(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot(), self.generation())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// The launching call blocks until the child exits.
    Attached,
    /// The child runs in its own session; launch returns immediately.
    Detached,
}

impl ProcessMode {
    pub const fn code(self) -> u32 {
        match self {
            ProcessMode::Attached => 0,
            ProcessMode::Detached => 1,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ProcessMode::Attached),
            1 => Some(ProcessMode::Detached),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessMode::Attached => "Attached",
            ProcessMode::Detached => "Detached",
        })
    }
}

/// Once `Terminated`, a record never goes back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Terminated,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessStatus::Running => "Running",
            ProcessStatus::Terminated => "Terminated",
        })
    }
}

/// Owned copy of one process slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub slot: SlotIndex,
    pub handle: ProcessHandle,
    pub owner: InstanceId,
    pub command: String,
    pub mode: ProcessMode,
    pub status: ProcessStatus,
    pub started_at: SystemTime,
    pub active: bool,
}

impl ProcessRecord {
    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}

/// What `allocate_slot` writes.
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub handle: ProcessHandle,
    pub owner: InstanceId,
    pub command: String,
    pub mode: ProcessMode,
    pub started_at: SystemTime,
}

impl NewProcess {
    pub fn new(
        handle: ProcessHandle,
        owner: InstanceId,
        command: impl Into<String>,
        mode: ProcessMode,
    ) -> Self {
        Self {
            handle,
            owner,
            command: command.into(),
            mode,
            started_at: SystemTime::now(),
        }
    }
}

/// Outcome of `deregister_instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deregistration {
    /// No instance remains registered; shared resources may be destroyed.
    pub was_last: bool,
    /// Attached children of the departing instance that were signalled and
    /// retired.
    pub terminated: Vec<ProcessHandle>,
}

// ---------------------------------------------------------------------------
// Shared layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct Header {
    magic: u32,
    version: u32,
    process_capacity: u32,
    instance_capacity: u32,
    live_count: u32,
    torn_down: u32,
    next_generation: u32,
    _reserved: u32,
}

#[repr(C)]
struct InstanceSlot {
    id: u64,
    pid: i32,
    active: u32,
    registered_at: i64,
}

#[repr(C)]
struct RawRecord {
    handle: i32,
    mode: u32,
    status: u32,
    active: u32,
    owner: u64,
    started_at_ms: i64,
    command_len: u32,
    used: u32,
    command: [u8; COMMAND_MAX],
}

const STATUS_RUNNING: u32 = 0;
const STATUS_TERMINATED: u32 = 1;

const _: () = assert!(std::mem::size_of::<Header>() % 8 == 0);
const _: () = assert!(std::mem::size_of::<InstanceSlot>() % 8 == 0);
const _: () = assert!(std::mem::size_of::<RawRecord>() % 8 == 0);

impl RawRecord {
    fn write(&mut self, rec: &NewProcess) {
        let text = truncate_command(&rec.command);
        self.handle = rec.handle.as_raw();
        self.mode = rec.mode.code();
        self.status = STATUS_RUNNING;
        self.owner = rec.owner.as_u64();
        self.started_at_ms = to_unix_ms(rec.started_at);
        self.command = [0; COMMAND_MAX];
        self.command[..text.len()].copy_from_slice(text.as_bytes());
        self.command_len = text.len() as u32;
        self.used = 1;
        self.active = 1;
    }

    /// Mark TERMINATED and inactive. Returns false if already retired.
    fn retire(&mut self) -> bool {
        if self.active == 0 {
            return false;
        }
        self.status = STATUS_TERMINATED;
        self.active = 0;
        true
    }

    fn is_active(&self) -> bool {
        self.active != 0
    }

    fn to_record(&self, slot: SlotIndex) -> ProcessRecord {
        let len = (self.command_len as usize).min(COMMAND_MAX);
        ProcessRecord {
            slot,
            handle: ProcessHandle::from_raw(self.handle),
            owner: InstanceId::from_u64(self.owner),
            command: String::from_utf8_lossy(&self.command[..len]).into_owned(),
            mode: ProcessMode::from_code(self.mode).unwrap_or(ProcessMode::Detached),
            status: if self.status == STATUS_TERMINATED {
                ProcessStatus::Terminated
            } else {
                ProcessStatus::Running
            },
            started_at: from_unix_ms(self.started_at_ms),
            active: self.is_active(),
        }
    }
}

/// Keep at most `COMMAND_MAX - 1` bytes, cut on a char boundary.
pub(crate) fn truncate_command(command: &str) -> &str {
    let max = COMMAND_MAX - 1;
    if command.len() <= max {
        return command;
    }
    let mut end = max;
    while !command.is_char_boundary(end) {
        end -= 1;
    }
    &command[..end]
}

fn to_unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn from_unix_ms(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    header_off: usize,
    instances_off: usize,
    records_off: usize,
    total: usize,
    process_capacity: usize,
    instance_capacity: usize,
}

impl Layout {
    fn new(process_capacity: usize, instance_capacity: usize) -> Self {
        let header_off = IpcMutex::SIZE.div_ceil(8) * 8;
        let instances_off = header_off + std::mem::size_of::<Header>();
        let records_off = instances_off + instance_capacity * std::mem::size_of::<InstanceSlot>();
        let total = records_off + process_capacity * std::mem::size_of::<RawRecord>();
        Self {
            header_off,
            instances_off,
            records_off,
            total,
            process_capacity,
            instance_capacity,
        }
    }
}

/// Exclusive view of the shared tables, valid while the lock is held.
struct Table<'a> {
    _guard: ScopedLock<'a>,
    base: *mut u8,
    layout: Layout,
}

impl Table<'_> {
    fn header(&mut self) -> &mut Header {
        unsafe { &mut *(self.base.add(self.layout.header_off) as *mut Header) }
    }

    fn instances(&mut self) -> &mut [InstanceSlot] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(self.layout.instances_off) as *mut InstanceSlot,
                self.layout.instance_capacity,
            )
        }
    }

    fn records(&mut self) -> &mut [RawRecord] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(self.layout.records_off) as *mut RawRecord,
                self.layout.process_capacity,
            )
        }
    }

    fn member_ids(&mut self) -> Vec<InstanceId> {
        self.instances()
            .iter()
            .filter(|s| s.active != 0)
            .map(|s| InstanceId::from_u64(s.id))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handle on the shared Registry Store.
///
/// Every operation takes the registry lock for its whole duration and never
/// blocks while holding it. Raw lock access is not exposed.
pub struct Registry {
    shm: ShmHandle,
    lock: IpcMutex,
    names: ResourceNames,
    layout: Layout,
}

impl Registry {
    /// Attach to (or create) the registry for `names.namespace`.
    ///
    /// The creator sets up the lock and header with the configured
    /// capacities before the segment becomes visible; later openers must
    /// agree with them.
    pub fn open(names: &ResourceNames, config: &Config) -> Result<Self, SetupError> {
        let layout = Layout::new(config.process_capacity, config.instance_capacity);
        let shm = ShmHandle::acquire(&names.registry, layout.total, |base| unsafe {
            init_segment(base, &layout)
        })
        .map_err(|e| SetupError::segment("registry", &names.registry, e))?;
        let lock = IpcMutex::in_region(&shm, 0)
            .map_err(|e| SetupError::attach("registry", &names.registry, e))?;
        if shm.is_creator() {
            debug!(
                segment = %names.registry,
                process_capacity = layout.process_capacity,
                instance_capacity = layout.instance_capacity,
                "initialised registry"
            );
        }

        let registry = Self {
            shm,
            lock,
            names: names.clone(),
            layout,
        };
        registry.verify()?;
        Ok(registry)
    }

    fn verify(&self) -> Result<(), SetupError> {
        let mut table = self
            .table()
            .map_err(|e| SetupError::attach("registry", &self.names.registry, io_of(e)))?;
        let (process_capacity, instance_capacity) =
            (self.layout.process_capacity, self.layout.instance_capacity);
        let h = table.header();
        if h.magic != MAGIC || h.version != LAYOUT_VERSION {
            return Err(SetupError::LayoutMismatch {
                resource: "registry",
                detail: format!("magic {:#x} version {}", h.magic, h.version),
            });
        }
        if h.process_capacity as usize != process_capacity
            || h.instance_capacity as usize != instance_capacity
        {
            return Err(SetupError::LayoutMismatch {
                resource: "registry",
                detail: format!(
                    "segment has {} process / {} instance slots, configured {} / {}",
                    h.process_capacity, h.instance_capacity, process_capacity, instance_capacity
                ),
            });
        }
        Ok(())
    }

    fn table(&self) -> Result<Table<'_>, RegistryError> {
        let guard = ScopedLock::new(&self.lock).map_err(RegistryError::Lock)?;
        Ok(Table {
            _guard: guard,
            base: self.shm.get(),
            layout: self.layout,
        })
    }

    /// Lock and refuse to proceed on a segment that has been torn down.
    fn live_table(&self) -> Result<Table<'_>, RegistryError> {
        let mut table = self.table()?;
        if table.header().torn_down != 0 {
            return Err(RegistryError::TornDown);
        }
        Ok(table)
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    pub fn process_capacity(&self) -> usize {
        self.layout.process_capacity
    }

    pub fn instance_capacity(&self) -> usize {
        self.layout.instance_capacity
    }

    /// Claim an instance slot and bump the live count.
    ///
    /// Slots held by instances whose process no longer exists are reclaimed
    /// first, so a crashed terminal never pins the table.
    pub fn register_instance(&self) -> Result<InstanceId, RegistryError> {
        let me = process::current_pid();
        let mut table = self.live_table()?;

        let mut reclaimed = 0u32;
        for slot in table.instances().iter_mut() {
            if slot.active != 0
                && slot.pid != me
                && !process::is_alive(ProcessHandle::from_raw(slot.pid))
            {
                warn!(
                    instance = %InstanceId::from_u64(slot.id),
                    pid = slot.pid,
                    "reclaiming slot of dead instance"
                );
                slot.active = 0;
                reclaimed += 1;
            }
        }
        let h = table.header();
        h.live_count = h.live_count.saturating_sub(reclaimed);

        let capacity = self.layout.instance_capacity;
        let Some(index) = table.instances().iter().position(|s| s.active == 0) else {
            return Err(RegistryError::InstancesFull { capacity });
        };

        let h = table.header();
        h.next_generation = h.next_generation.wrapping_add(1).max(1);
        let id = InstanceId::new(h.next_generation, index as u32);
        h.live_count += 1;
        let live = h.live_count;

        let slot = &mut table.instances()[index];
        slot.id = id.as_u64();
        slot.pid = me;
        slot.registered_at = to_unix_ms(SystemTime::now());
        slot.active = 1;

        info!(instance = %id, live, "instance registered");
        Ok(id)
    }

    /// Release `id`'s slot, signal and retire its ATTACHED children.
    ///
    /// When the live count reaches zero the segment is flagged torn down in
    /// the same critical section, so no late registration can slip in
    /// between "last one out" and destruction.
    pub fn deregister_instance(&self, id: InstanceId) -> Result<Deregistration, RegistryError> {
        let mut table = self.table()?;

        let index = id.slot();
        let mut found = false;
        if let Some(slot) = table.instances().get_mut(index) {
            if slot.active != 0 && slot.id == id.as_u64() {
                slot.active = 0;
                found = true;
            }
        }
        if found {
            let h = table.header();
            h.live_count = h.live_count.saturating_sub(1);
        } else {
            warn!(instance = %id, "deregistering an instance that is not registered");
        }

        let mut terminated = Vec::new();
        for rec in table.records().iter_mut() {
            if !rec.is_active()
                || rec.owner != id.as_u64()
                || rec.mode != ProcessMode::Attached.code()
            {
                continue;
            }
            let handle = ProcessHandle::from_raw(rec.handle);
            match process::terminate(handle) {
                Ok(Delivery::Delivered) => debug!(pid = %handle, "signalled attached child"),
                Ok(Delivery::NoSuchProcess) => debug!(pid = %handle, "attached child already gone"),
                Err(e) => warn!(pid = %handle, error = %e, "failed to signal attached child"),
            }
            rec.retire();
            terminated.push(handle);
        }

        let h = table.header();
        let was_last = h.live_count == 0;
        if was_last {
            h.torn_down = 1;
        }
        info!(instance = %id, live = h.live_count, was_last, "instance deregistered");
        Ok(Deregistration {
            was_last,
            terminated,
        })
    }

    /// Record a freshly spawned process in the first free slot.
    ///
    /// An active record carrying the same handle can only be a dead process
    /// whose pid was reused; it is retired and its slot reused. Nothing is
    /// announced for it, since the pid now names the new process. On `Full`
    /// the table is untouched.
    pub fn allocate_slot(&self, rec: NewProcess) -> Result<SlotIndex, RegistryError> {
        let mut table = self.live_table()?;
        let records = table.records();

        let index = match records
            .iter()
            .position(|r| r.is_active() && r.handle == rec.handle.as_raw())
        {
            Some(stale) => {
                warn!(pid = %rec.handle, slot = stale, "retiring stale record with reused pid");
                records[stale].retire();
                stale
            }
            None => match records.iter().position(|r| !r.is_active()) {
                Some(free) => free,
                None => {
                    return Err(RegistryError::Full {
                        capacity: self.layout.process_capacity,
                    })
                }
            },
        };

        records[index].write(&rec);
        debug!(pid = %rec.handle, slot = index, owner = %rec.owner, "slot allocated");
        Ok(index)
    }

    /// Retire the active record for `handle`. Returns `true` only for the
    /// call that actually retired it; later or concurrent calls see `false`.
    pub fn free_slot(&self, handle: ProcessHandle) -> Result<bool, RegistryError> {
        let mut table = self.table()?;
        let retired = table
            .records()
            .iter_mut()
            .find(|r| r.is_active() && r.handle == handle.as_raw())
            .map(RawRecord::retire)
            .unwrap_or(false);
        if retired {
            debug!(pid = %handle, "slot freed");
        }
        Ok(retired)
    }

    pub fn find_active(&self, handle: ProcessHandle) -> Result<Option<ProcessRecord>, RegistryError> {
        let mut table = self.table()?;
        Ok(table
            .records()
            .iter()
            .enumerate()
            .find(|(_, r)| r.is_active() && r.handle == handle.as_raw())
            .map(|(i, r)| r.to_record(i)))
    }

    /// Every slot that has ever held a record, in slot order.
    pub fn snapshot(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        let mut table = self.table()?;
        Ok(table
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.used != 0)
            .map(|(i, r)| r.to_record(i))
            .collect())
    }

    pub fn active_records(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        let mut table = self.table()?;
        Ok(table
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_active())
            .map(|(i, r)| r.to_record(i))
            .collect())
    }

    pub fn members(&self) -> Result<Vec<InstanceId>, RegistryError> {
        Ok(self.table()?.member_ids())
    }

    pub fn live_count(&self) -> Result<usize, RegistryError> {
        Ok(self.table()?.header().live_count as usize)
    }

    pub fn is_torn_down(&self) -> Result<bool, RegistryError> {
        Ok(self.table()?.header().torn_down != 0)
    }

    /// Run `f` over the current membership with the registry lock held.
    /// `f` must not block.
    pub fn with_members<R>(&self, f: impl FnOnce(&[InstanceId]) -> R) -> Result<R, RegistryError> {
        let mut table = self.table()?;
        let members = table.member_ids();
        Ok(f(&members))
    }

    /// Mark the segment torn down and unlink it. Mappings held by this or
    /// any other handle stay valid until dropped, and every later operation
    /// through them sees `TornDown`; new openers get a fresh segment.
    pub fn destroy(&self) {
        if let Ok(mut table) = self.table() {
            table.header().torn_down = 1;
        }
        self.shm.unlink();
        info!(segment = %self.names.registry, "registry destroyed");
    }

    /// Remove a namespace's registry without attaching to it.
    pub fn clear_storage(names: &ResourceNames) {
        ShmHandle::clear_storage(&names.registry);
    }
}

/// Lay out a fresh segment: the lock at offset 0, then a header stamped
/// with this layout. Runs before any other handle can map the segment.
///
/// # Safety
/// `base` must be the zero-filled user region of a new segment of at least
/// `layout.total` bytes.
unsafe fn init_segment(base: *mut u8, layout: &Layout) -> io::Result<()> {
    IpcMutex::init_at(base)?;
    let h = &mut *(base.add(layout.header_off) as *mut Header);
    h.magic = MAGIC;
    h.version = LAYOUT_VERSION;
    h.process_capacity = layout.process_capacity as u32;
    h.instance_capacity = layout.instance_capacity as u32;
    Ok(())
}

fn io_of(e: RegistryError) -> io::Error {
    match e {
        RegistryError::Lock(e) => e,
        other => io::Error::other(other.to_string()),
    }
}
