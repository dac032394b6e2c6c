// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Notification Listener: per-event side effects and loop termination.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use procx::process::{self, ExitInfo};
use procx::shm_name::ResourceNames;
use procx::{
    Bus, Config, EventHook, InstanceId, ListenerOutcome, NewProcess, Notification,
    NotificationKind, NotificationListener, ProcessHandle, ProcessMode, Recipient, Registry,
    StopSignal,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

struct Fixture {
    registry: Arc<Registry>,
    bus: Arc<Bus>,
    me: InstanceId,
    peer: InstanceId,
    seen: Arc<Mutex<Vec<Notification>>>,
}

fn fixture(prefix: &str) -> Fixture {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let namespace = format!("procx_t{}_{prefix}_{n}", std::process::id());
    let names = ResourceNames::new(&namespace);
    Registry::clear_storage(&names);
    Bus::clear_storage(&names);
    let config = Config {
        namespace,
        process_capacity: 4,
        instance_capacity: 4,
        mailbox_capacity: 8,
        receive_poll_ms: 20,
        ..Config::default()
    };
    let registry = Arc::new(Registry::open(&names, &config).expect("registry"));
    let bus = Arc::new(Bus::open(&names, &config).expect("bus"));
    let me = registry.register_instance().unwrap();
    let peer = registry.register_instance().unwrap();
    bus.attach(me).unwrap();
    bus.attach(peer).unwrap();
    Fixture {
        registry,
        bus,
        me,
        peer,
        seen: Arc::default(),
    }
}

impl Fixture {
    fn listener(&self, stop: StopSignal) -> NotificationListener {
        let seen = Arc::clone(&self.seen);
        let hook: EventHook = Arc::new(move |n: &Notification| seen.lock().unwrap().push(*n));
        NotificationListener::new(Arc::clone(&self.registry), Arc::clone(&self.bus), self.me, stop)
            .with_hook(Some(hook))
    }

    fn from_peer(&self, kind: NotificationKind, target: Option<ProcessHandle>) -> Notification {
        Notification::new(kind, self.peer, target)
    }
}

/// A pid that certainly belonged to a process that is gone now.
fn exited_pid() -> ProcessHandle {
    let h = process::spawn("true", ProcessMode::Attached).unwrap();
    process::wait(h).unwrap();
    h
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ========== handle() ==========

#[test]
fn start_only_reports() {
    let f = fixture("start");
    let listener = f.listener(StopSignal::new());
    let n = f.from_peer(NotificationKind::Start, Some(ProcessHandle::from_raw(4242)));

    assert_eq!(listener.handle(&n), ListenerOutcome::Started);
    assert_eq!(*f.seen.lock().unwrap(), vec![n]);
    assert!(f.registry.snapshot().unwrap().is_empty());
}

#[test]
fn terminate_signals_and_retires_live_process() {
    let f = fixture("terminate");
    let listener = f.listener(StopSignal::new());

    let h = process::spawn("sleep 30", ProcessMode::Detached).unwrap();
    f.registry
        .allocate_slot(NewProcess::new(h, f.peer, "sleep 30", ProcessMode::Detached))
        .unwrap();

    let n = f.from_peer(NotificationKind::Terminate, Some(h));
    assert_eq!(listener.handle(&n), ListenerOutcome::Terminated { found: true });
    assert_eq!(process::wait(h).unwrap(), Some(ExitInfo::Signaled(libc::SIGTERM)));
    assert!(f.registry.find_active(h).unwrap().is_none());
    assert_eq!(f.seen.lock().unwrap().len(), 1);
}

#[test]
fn terminate_for_unknown_process_is_tolerated() {
    let f = fixture("unknown_pid");
    let listener = f.listener(StopSignal::new());

    let gone = exited_pid();
    let n = f.from_peer(NotificationKind::Terminate, Some(gone));
    assert_eq!(listener.handle(&n), ListenerOutcome::Terminated { found: false });
    assert_eq!(f.seen.lock().unwrap().len(), 1);
}

#[test]
fn terminate_retires_record_of_already_dead_process() {
    let f = fixture("dead_record");
    let listener = f.listener(StopSignal::new());

    let gone = exited_pid();
    f.registry
        .allocate_slot(NewProcess::new(gone, f.peer, "true", ProcessMode::Detached))
        .unwrap();

    let n = f.from_peer(NotificationKind::Terminate, Some(gone));
    assert_eq!(listener.handle(&n), ListenerOutcome::Terminated { found: true });
    assert!(f.registry.active_records().unwrap().is_empty());
}

#[test]
fn terminate_keeps_record_when_signal_cannot_be_sent() {
    let f = fixture("unsignalable");
    let listener = f.listener(StopSignal::new());

    // A handle kill(2) would read as a process group is never signalled.
    let bogus = ProcessHandle::from_raw(-4242);
    f.registry
        .allocate_slot(NewProcess::new(bogus, f.peer, "sleep 30", ProcessMode::Detached))
        .unwrap();

    let n = f.from_peer(NotificationKind::Terminate, Some(bogus));
    assert_eq!(listener.handle(&n), ListenerOutcome::SignalFailed);
    assert!(f.registry.find_active(bogus).unwrap().is_some());
    assert_eq!(*f.seen.lock().unwrap(), vec![n]);
}

#[test]
fn malformed_and_unknown_events_are_ignored() {
    let f = fixture("ignored");
    let listener = f.listener(StopSignal::new());

    let no_target = f.from_peer(NotificationKind::Terminate, None);
    assert_eq!(listener.handle(&no_target), ListenerOutcome::Ignored);

    let future = f.from_peer(NotificationKind::Unknown(99), Some(ProcessHandle::from_raw(1)));
    assert_eq!(listener.handle(&future), ListenerOutcome::Ignored);

    assert!(f.seen.lock().unwrap().is_empty());
}

#[test]
fn shutdown_stops_the_loop() {
    let f = fixture("shutdown_kind");
    let listener = f.listener(StopSignal::new());
    let n = f.from_peer(NotificationKind::Shutdown, None);
    assert_eq!(listener.handle(&n), ListenerOutcome::Stop);
}

// ========== Background loop ==========

#[test]
fn running_listener_applies_remote_terminate() {
    let f = fixture("loop");
    let stop = StopSignal::new();
    let thread = f.listener(stop.clone()).spawn().unwrap();

    let gone = exited_pid();
    f.registry
        .allocate_slot(NewProcess::new(gone, f.peer, "true", ProcessMode::Detached))
        .unwrap();
    f.bus
        .send(
            Recipient::Instance(f.me),
            f.from_peer(NotificationKind::Terminate, Some(gone)),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        f.registry.find_active(gone).unwrap().is_none()
    }));

    stop.trigger();
    f.bus.request_shutdown(f.me).unwrap();
    thread.join().unwrap();
}

#[test]
fn listener_exits_when_bus_is_removed() {
    let f = fixture("removed");
    let thread = f.listener(StopSignal::new()).spawn().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    f.bus.remove();
    thread.join().unwrap();
}

#[test]
fn listener_exits_on_shutdown_request() {
    let f = fixture("request");
    let thread = f.listener(StopSignal::new()).spawn().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    f.bus.request_shutdown(f.me).unwrap();
    thread.join().unwrap();
    assert!(f.seen.lock().unwrap().is_empty());
}
