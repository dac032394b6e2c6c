// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Notification Bus: one bounded FIFO mailbox per instance slot, in a named
// shared segment that also holds the mutex guarding it and the condition
// variable receivers sleep on.
//
//   mutex | cond | BusHeader | (MailboxHeader, RawNotification[mailbox_capacity]) * mailbox_count
//
// Lock order is registry -> bus. `receive` never touches the registry lock.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{BusError, SetupError};
use crate::process::ProcessHandle;
use crate::registry::{InstanceId, Registry};
use crate::shm_name::ResourceNames;
use crate::{IpcCondition, IpcMutex, ScopedLock, ShmHandle};

const MAGIC: u32 = 0x5042_5553; // "PBUS"
const LAYOUT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Start,
    Terminate,
    Shutdown,
    /// Sent by a newer build; receivers log and ignore it.
    Unknown(u32),
}

impl NotificationKind {
    pub const fn code(self) -> u32 {
        match self {
            NotificationKind::Start => 1,
            NotificationKind::Terminate => 2,
            NotificationKind::Shutdown => 3,
            NotificationKind::Unknown(c) => c,
        }
    }

    pub const fn from_code(code: u32) -> Self {
        match code {
            1 => NotificationKind::Start,
            2 => NotificationKind::Terminate,
            3 => NotificationKind::Shutdown,
            c => NotificationKind::Unknown(c),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Start => f.write_str("START"),
            NotificationKind::Terminate => f.write_str("TERMINATE"),
            NotificationKind::Shutdown => f.write_str("SHUTDOWN"),
            NotificationKind::Unknown(c) => write!(f, "UNKNOWN({c})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub sender: InstanceId,
    /// Process the event is about; `None` for SHUTDOWN.
    pub target: Option<ProcessHandle>,
    /// Bus-wide send counter, assigned when the notification is sent.
    pub sequence: u64,
}

impl Notification {
    pub fn new(kind: NotificationKind, sender: InstanceId, target: Option<ProcessHandle>) -> Self {
        Self {
            kind,
            sender,
            target,
            sequence: 0,
        }
    }

    fn shutdown_marker(id: InstanceId) -> Self {
        Self::new(NotificationKind::Shutdown, id, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Instance(InstanceId),
    /// Every attached mailbox.
    All,
}

// ---------------------------------------------------------------------------
// Shared layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct BusHeader {
    magic: u32,
    version: u32,
    mailbox_count: u32,
    mailbox_capacity: u32,
    removed: u32,
    _reserved: u32,
    sequence: u64,
}

#[repr(C)]
struct MailboxHeader {
    owner: u64,
    head: u32,
    len: u32,
    shutdown: u32,
    dropped: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawNotification {
    kind: u32,
    target: i32,
    sender: u64,
    sequence: u64,
}

impl RawNotification {
    fn from_notification(n: &Notification) -> Self {
        Self {
            kind: n.kind.code(),
            target: n.target.map(ProcessHandle::as_raw).unwrap_or(0),
            sender: n.sender.as_u64(),
            sequence: n.sequence,
        }
    }

    fn to_notification(self) -> Notification {
        Notification {
            kind: NotificationKind::from_code(self.kind),
            sender: InstanceId::from_u64(self.sender),
            target: (self.target != 0).then(|| ProcessHandle::from_raw(self.target)),
            sequence: self.sequence,
        }
    }
}

const _: () = assert!(std::mem::size_of::<BusHeader>() % 8 == 0);
const _: () = assert!(std::mem::size_of::<MailboxHeader>() % 8 == 0);
const _: () = assert!(std::mem::size_of::<RawNotification>() % 8 == 0);

#[derive(Debug, Clone, Copy)]
struct BusLayout {
    cond_off: usize,
    header_off: usize,
    mailboxes_off: usize,
    mailbox_count: usize,
    mailbox_capacity: usize,
    stride: usize,
    total: usize,
}

impl BusLayout {
    fn new(mailbox_count: usize, mailbox_capacity: usize) -> Self {
        let stride = std::mem::size_of::<MailboxHeader>()
            + mailbox_capacity * std::mem::size_of::<RawNotification>();
        let cond_off = IpcMutex::SIZE.div_ceil(8) * 8;
        let header_off = cond_off + IpcCondition::SIZE.div_ceil(8) * 8;
        let mailboxes_off = header_off + std::mem::size_of::<BusHeader>();
        Self {
            cond_off,
            header_off,
            mailboxes_off,
            mailbox_count,
            mailbox_capacity,
            stride,
            total: mailboxes_off + mailbox_count * stride,
        }
    }
}

struct Mailbox<'t> {
    head: &'t mut MailboxHeader,
    ring: &'t mut [RawNotification],
}

impl Mailbox<'_> {
    fn owned_by(&self, id: InstanceId) -> bool {
        self.head.owner == id.as_u64()
    }

    /// Enqueue, or count a drop when full. The sender never waits.
    fn push(&mut self, raw: RawNotification) -> bool {
        let cap = self.ring.len();
        if self.head.len as usize >= cap {
            self.head.dropped = self.head.dropped.wrapping_add(1);
            return false;
        }
        let tail = (self.head.head as usize + self.head.len as usize) % cap;
        self.ring[tail] = raw;
        self.head.len += 1;
        true
    }

    fn pop(&mut self) -> Option<RawNotification> {
        if self.head.len == 0 {
            return None;
        }
        let raw = self.ring[self.head.head as usize];
        self.head.head = ((self.head.head as usize + 1) % self.ring.len()) as u32;
        self.head.len -= 1;
        Some(raw)
    }

    fn reset(&mut self, owner: u64) {
        self.head.owner = owner;
        self.head.head = 0;
        self.head.len = 0;
        self.head.shutdown = 0;
        self.head.dropped = 0;
    }
}

/// Exclusive view of the bus segment, valid while the lock is held.
struct Slots<'a> {
    guard: ScopedLock<'a>,
    base: *mut u8,
    layout: BusLayout,
}

impl Slots<'_> {
    fn header(&mut self) -> &mut BusHeader {
        unsafe { &mut *(self.base.add(self.layout.header_off) as *mut BusHeader) }
    }

    fn mailbox(&mut self, index: usize) -> Option<Mailbox<'_>> {
        if index >= self.layout.mailbox_count {
            return None;
        }
        unsafe {
            let p = self
                .base
                .add(self.layout.mailboxes_off + index * self.layout.stride);
            let head = &mut *(p as *mut MailboxHeader);
            let ring = std::slice::from_raw_parts_mut(
                p.add(std::mem::size_of::<MailboxHeader>()) as *mut RawNotification,
                self.layout.mailbox_capacity,
            );
            Some(Mailbox { head, ring })
        }
    }

    fn ensure_present(&mut self) -> Result<(), BusError> {
        if self.header().removed != 0 {
            return Err(BusError::Removed);
        }
        Ok(())
    }

    fn next_sequence(&mut self) -> u64 {
        let h = self.header();
        h.sequence = h.sequence.wrapping_add(1);
        h.sequence
    }

    /// Deliver one copy to each listed instance whose mailbox it owns.
    fn deliver(&mut self, to: &[InstanceId], raw: RawNotification) -> usize {
        let mut delivered = 0;
        for &id in to {
            let Some(mut mb) = self.mailbox(id.slot()) else {
                continue;
            };
            if !mb.owned_by(id) {
                debug!(instance = %id, "member has no mailbox attached yet");
                continue;
            }
            if mb.push(raw) {
                delivered += 1;
            } else {
                warn!(
                    instance = %id,
                    kind = %NotificationKind::from_code(raw.kind),
                    "mailbox full, notification dropped"
                );
            }
        }
        delivered
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub struct Bus {
    shm: ShmHandle,
    lock: IpcMutex,
    cond: IpcCondition,
    names: ResourceNames,
    layout: BusLayout,
    receive_poll: Duration,
}

impl Bus {
    /// Attach to (or create) the bus. One mailbox per instance slot.
    pub fn open(names: &ResourceNames, config: &Config) -> Result<Self, SetupError> {
        let layout = BusLayout::new(config.instance_capacity, config.mailbox_capacity);
        let shm = ShmHandle::acquire(&names.bus, layout.total, |base| unsafe {
            init_segment(base, &layout)
        })
        .map_err(|e| SetupError::segment("bus", &names.bus, e))?;
        let lock = IpcMutex::in_region(&shm, 0)
            .map_err(|e| SetupError::attach("bus", &names.bus, e))?;
        let cond = IpcCondition::in_region(&shm, layout.cond_off)
            .map_err(|e| SetupError::attach("bus", &names.bus, e))?;
        if shm.is_creator() {
            debug!(segment = %names.bus, mailboxes = layout.mailbox_count, "initialised bus");
        }

        let bus = Self {
            shm,
            lock,
            cond,
            names: names.clone(),
            layout,
            receive_poll: config.receive_poll(),
        };
        bus.verify()?;
        Ok(bus)
    }

    fn verify(&self) -> Result<(), SetupError> {
        let mut slots = self
            .slots_unchecked()
            .map_err(|e| SetupError::attach("bus", &self.names.bus, e))?;
        let layout = self.layout;
        let h = slots.header();
        if h.magic != MAGIC
            || h.version != LAYOUT_VERSION
            || h.mailbox_count as usize != layout.mailbox_count
            || h.mailbox_capacity as usize != layout.mailbox_capacity
        {
            return Err(SetupError::LayoutMismatch {
                resource: "bus",
                detail: format!(
                    "segment has {} mailboxes of {}, configured {} of {}",
                    h.mailbox_count,
                    h.mailbox_capacity,
                    layout.mailbox_count,
                    layout.mailbox_capacity
                ),
            });
        }
        Ok(())
    }

    fn slots_unchecked(&self) -> std::io::Result<Slots<'_>> {
        let guard = ScopedLock::new(&self.lock)?;
        Ok(Slots {
            guard,
            base: self.shm.get(),
            layout: self.layout,
        })
    }

    fn slots(&self) -> Result<Slots<'_>, BusError> {
        let mut slots = self.slots_unchecked().map_err(BusError::Lock)?;
        slots.ensure_present()?;
        Ok(slots)
    }

    fn wake_all(&self) {
        if let Err(e) = self.cond.broadcast() {
            warn!(error = %e, "bus wake-up failed");
        }
    }

    /// Claim `id`'s mailbox, discarding anything a previous owner left.
    pub fn attach(&self, id: InstanceId) -> Result<(), BusError> {
        let mut slots = self.slots()?;
        let mut mb = slots
            .mailbox(id.slot())
            .ok_or(BusError::UnknownRecipient(id))?;
        mb.reset(id.as_u64());
        debug!(instance = %id, "mailbox attached");
        Ok(())
    }

    /// Release `id`'s mailbox. Pending notifications are discarded.
    pub fn detach(&self, id: InstanceId) -> Result<(), BusError> {
        {
            let mut slots = self.slots()?;
            if let Some(mut mb) = slots.mailbox(id.slot()) {
                if mb.owned_by(id) {
                    mb.reset(0);
                }
            }
        }
        self.wake_all();
        Ok(())
    }

    /// Enqueue without blocking. Returns how many mailboxes accepted it.
    pub fn send(&self, to: Recipient, notification: Notification) -> Result<usize, BusError> {
        let delivered = {
            let mut slots = self.slots()?;
            let mut raw = RawNotification::from_notification(&notification);
            raw.sequence = slots.next_sequence();
            match to {
                Recipient::Instance(id) => {
                    let owned = slots.mailbox(id.slot()).is_some_and(|mb| mb.owned_by(id));
                    if !owned {
                        return Err(BusError::UnknownRecipient(id));
                    }
                    slots.deliver(&[id], raw)
                }
                Recipient::All => {
                    let owners: Vec<InstanceId> = (0..self.layout.mailbox_count)
                        .filter_map(|i| slots.mailbox(i).map(|mb| mb.head.owner))
                        .filter(|&o| o != 0)
                        .map(InstanceId::from_u64)
                        .collect();
                    slots.deliver(&owners, raw)
                }
            }
        };
        self.wake_all();
        Ok(delivered)
    }

    /// Send one copy to every registered instance that has a mailbox. The
    /// sender's own copy is delivered too and discarded when it receives.
    ///
    /// Membership is read under the registry lock and delivery happens
    /// before it is released, so nobody registers or leaves mid-broadcast.
    pub fn broadcast(
        &self,
        registry: &Registry,
        kind: NotificationKind,
        sender: InstanceId,
        target: Option<ProcessHandle>,
    ) -> Result<usize, BusError> {
        let notification = Notification::new(kind, sender, target);
        let delivered = registry.with_members(|members| -> Result<usize, BusError> {
            let mut slots = self.slots()?;
            let mut raw = RawNotification::from_notification(&notification);
            raw.sequence = slots.next_sequence();
            Ok(slots.deliver(members, raw))
        })??;
        self.wake_all();
        debug!(%kind, sender = %sender, ?target, delivered, "broadcast");
        Ok(delivered)
    }

    /// Block until a notification for `id` arrives.
    ///
    /// Notifications `id` sent itself are discarded. A pending shutdown
    /// request yields a SHUTDOWN marker. Fails with `Removed` once the bus
    /// is destroyed.
    pub fn receive(&self, id: InstanceId) -> Result<Notification, BusError> {
        loop {
            if let Some(n) = self.receive_until(id, None)? {
                return Ok(n);
            }
        }
    }

    /// Like [`receive`](Self::receive) but gives up after `timeout`.
    pub fn receive_timeout(
        &self,
        id: InstanceId,
        timeout: Duration,
    ) -> Result<Option<Notification>, BusError> {
        self.receive_until(id, Some(Instant::now() + timeout))
    }

    fn receive_until(
        &self,
        id: InstanceId,
        deadline: Option<Instant>,
    ) -> Result<Option<Notification>, BusError> {
        let mut slots = self.slots_unchecked().map_err(BusError::Lock)?;
        loop {
            slots.ensure_present()?;
            let mut mb = slots
                .mailbox(id.slot())
                .filter(|mb| mb.owned_by(id))
                .ok_or(BusError::UnknownRecipient(id))?;
            if mb.head.shutdown != 0 {
                return Ok(Some(Notification::shutdown_marker(id)));
            }
            while let Some(raw) = mb.pop() {
                if raw.sender == id.as_u64() {
                    continue;
                }
                return Ok(Some(raw.to_notification()));
            }

            let slice = match deadline {
                None => self.receive_poll,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(None);
                    }
                    (d - now).min(self.receive_poll)
                }
            };
            // The condition is shared by every mailbox; a wake-up may be
            // for someone else, so always re-check.
            self.cond
                .wait(slots.guard.mutex(), Some(slice))
                .map_err(BusError::Wait)?;
        }
    }

    /// Make `id`'s pending or next `receive` return a SHUTDOWN marker.
    pub fn request_shutdown(&self, id: InstanceId) -> Result<(), BusError> {
        {
            let mut slots = self.slots()?;
            if let Some(mut mb) = slots.mailbox(id.slot()) {
                if mb.owned_by(id) {
                    mb.head.shutdown = 1;
                }
            }
        }
        self.wake_all();
        Ok(())
    }

    /// Notifications dropped on overflow for `id`'s mailbox.
    pub fn dropped(&self, id: InstanceId) -> Result<u32, BusError> {
        let mut slots = self.slots()?;
        Ok(slots
            .mailbox(id.slot())
            .filter(|mb| mb.owned_by(id))
            .map(|mb| mb.head.dropped)
            .unwrap_or(0))
    }

    /// Destroy the bus: blocked receivers fail with `Removed`, and the
    /// segment name is unlinked.
    pub fn remove(&self) {
        match self.slots_unchecked() {
            Ok(mut slots) => slots.header().removed = 1,
            Err(e) => warn!(error = %e, "could not lock bus for removal"),
        }
        self.wake_all();
        self.shm.unlink();
        info!(segment = %self.names.bus, "bus removed");
    }

    pub fn is_removed(&self) -> Result<bool, BusError> {
        let mut slots = self.slots_unchecked().map_err(BusError::Lock)?;
        Ok(slots.header().removed != 0)
    }

    /// Remove a namespace's bus without attaching to it.
    pub fn clear_storage(names: &ResourceNames) {
        ShmHandle::clear_storage(&names.bus);
    }
}

/// Lay out a fresh segment: lock, condition variable, then a header stamped
/// with this layout.
///
/// # Safety
/// `base` must be the zero-filled user region of a new segment of at least
/// `layout.total` bytes.
unsafe fn init_segment(base: *mut u8, layout: &BusLayout) -> std::io::Result<()> {
    IpcMutex::init_at(base)?;
    IpcCondition::init_at(base.add(layout.cond_off))?;
    let h = &mut *(base.add(layout.header_off) as *mut BusHeader);
    h.magic = MAGIC;
    h.version = LAYOUT_VERSION;
    h.mailbox_count = layout.mailbox_count as u32;
    h.mailbox_capacity = layout.mailbox_capacity as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        for kind in [
            NotificationKind::Start,
            NotificationKind::Terminate,
            NotificationKind::Shutdown,
        ] {
            assert_eq!(NotificationKind::from_code(kind.code()), kind);
        }
        assert_eq!(NotificationKind::from_code(99), NotificationKind::Unknown(99));
        assert_eq!(NotificationKind::Unknown(99).to_string(), "UNKNOWN(99)");
    }

    #[test]
    fn raw_form_keeps_missing_target() {
        let n = Notification::new(NotificationKind::Shutdown, InstanceId::new(1, 0), None);
        assert_eq!(RawNotification::from_notification(&n).to_notification(), n);

        let n = Notification::new(
            NotificationKind::Terminate,
            InstanceId::new(2, 5),
            Some(ProcessHandle::from_raw(4321)),
        );
        assert_eq!(RawNotification::from_notification(&n).to_notification(), n);
    }

    #[test]
    fn mailbox_ring_is_fifo_and_bounded() {
        let mut head = MailboxHeader {
            owner: 1,
            head: 0,
            len: 0,
            shutdown: 0,
            dropped: 0,
        };
        let mut ring = [RawNotification {
            kind: 0,
            target: 0,
            sender: 0,
            sequence: 0,
        }; 2];
        let mut mb = Mailbox {
            head: &mut head,
            ring: &mut ring,
        };
        let raw = |seq| RawNotification {
            kind: 1,
            target: 0,
            sender: 9,
            sequence: seq,
        };
        assert!(mb.push(raw(1)));
        assert!(mb.push(raw(2)));
        assert!(!mb.push(raw(3)));
        assert_eq!(mb.head.dropped, 1);
        assert_eq!(mb.pop().map(|r| r.sequence), Some(1));
        assert!(mb.push(raw(4)));
        assert_eq!(mb.pop().map(|r| r.sequence), Some(2));
        assert_eq!(mb.pop().map(|r| r.sequence), Some(4));
        assert!(mb.pop().is_none());
    }
}
