// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Registry Store: instance bookkeeping, slot allocation and retirement,
// capacity errors and the attached-child cleanup on deregistration.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use procx::process::{self, ExitInfo};
use procx::registry::COMMAND_MAX;
use procx::shm_name::ResourceNames;
use procx::{
    Config, InstanceId, NewProcess, ProcessHandle, ProcessMode, ProcessStatus, Registry,
    RegistryError, SetupError,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn scratch(prefix: &str, processes: usize, instances: usize) -> (ResourceNames, Config) {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let namespace = format!("procx_t{}_{prefix}_{n}", std::process::id());
    let names = ResourceNames::new(&namespace);
    Registry::clear_storage(&names);
    let config = Config {
        namespace,
        process_capacity: processes,
        instance_capacity: instances,
        ..Config::default()
    };
    (names, config)
}

fn fake(pid: i32, owner: InstanceId) -> NewProcess {
    NewProcess::new(
        ProcessHandle::from_raw(pid),
        owner,
        format!("sleep {pid}"),
        ProcessMode::Detached,
    )
}

// ========== Setup ==========

#[test]
fn open_initialises_empty_tables() {
    let (names, config) = scratch("open", 4, 3);
    let registry = Registry::open(&names, &config).expect("open");
    assert_eq!(registry.process_capacity(), 4);
    assert_eq!(registry.instance_capacity(), 3);
    assert_eq!(registry.live_count().unwrap(), 0);
    assert!(registry.snapshot().unwrap().is_empty());
    assert!(!registry.is_torn_down().unwrap());
}

#[test]
fn second_opener_sees_same_table() {
    let (names, config) = scratch("shared", 4, 3);
    let a = Registry::open(&names, &config).expect("open a");
    let b = Registry::open(&names, &config).expect("open b");

    let id = a.register_instance().unwrap();
    b.allocate_slot(fake(900_001, id)).unwrap();
    assert_eq!(a.active_records().unwrap().len(), 1);
    assert_eq!(b.members().unwrap(), vec![id]);
}

#[test]
fn capacity_disagreement_is_a_layout_mismatch() {
    let (names, config) = scratch("mismatch", 4, 3);
    let _first = Registry::open(&names, &config).expect("open");

    let other = Config {
        process_capacity: 2,
        ..config.clone()
    };
    match Registry::open(&names, &other) {
        Err(SetupError::LayoutMismatch { resource, .. }) => assert_eq!(resource, "registry"),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("mismatched capacities accepted"),
    }
}

#[test]
fn larger_configuration_than_the_segment_is_a_layout_mismatch() {
    let (names, config) = scratch("mismatch_up", 4, 3);
    let _first = Registry::open(&names, &config).expect("open");

    let other = Config {
        process_capacity: 8,
        ..config.clone()
    };
    assert!(matches!(
        Registry::open(&names, &other),
        Err(SetupError::LayoutMismatch { resource: "registry", .. })
    ));
}

#[test]
fn racing_first_openers_all_attach() {
    const OPENERS: usize = 6;
    for round in 0..10 {
        let (names, config) = scratch(&format!("race{round}"), 4, OPENERS);
        let barrier = Arc::new(Barrier::new(OPENERS));

        let openers: Vec<_> = (0..OPENERS)
            .map(|_| {
                let (names, config) = (names.clone(), config.clone());
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let registry = Registry::open(&names, &config).expect("open");
                    registry.register_instance().expect("register");
                    registry
                })
            })
            .collect();
        let registries: Vec<Registry> = openers.into_iter().map(|t| t.join().unwrap()).collect();
        for registry in &registries {
            assert_eq!(registry.live_count().unwrap(), OPENERS, "round {round}");
        }
        Registry::clear_storage(&names);
    }
}

// A handle opened before the last-out teardown keeps talking to the old
// segment and its lock: it reports TornDown and never touches the table a
// later opener creates.
#[test]
fn handle_from_before_teardown_never_reaches_the_new_table() {
    let (names, config) = scratch("generation_split", 4, 3);
    let leaving = Registry::open(&names, &config).unwrap();
    let late = Registry::open(&names, &config).unwrap();

    let id = leaving.register_instance().unwrap();
    assert!(leaving.deregister_instance(id).unwrap().was_last);
    leaving.destroy();

    let fresh = Registry::open(&names, &config).unwrap();
    assert!(!fresh.is_torn_down().unwrap());
    let member = fresh.register_instance().unwrap();

    assert!(late.is_torn_down().unwrap());
    assert!(matches!(late.register_instance(), Err(RegistryError::TornDown)));
    assert!(matches!(
        late.allocate_slot(fake(900_002, member)),
        Err(RegistryError::TornDown)
    ));
    assert_eq!(fresh.live_count().unwrap(), 1);
    assert!(fresh.snapshot().unwrap().is_empty());

    // Two handles on the new segment share its lock and its table.
    let peer = Registry::open(&names, &config).unwrap();
    peer.allocate_slot(fake(900_003, member)).unwrap();
    assert_eq!(fresh.active_records().unwrap().len(), 1);
}

// ========== Instances ==========

#[test]
fn register_assigns_distinct_ids_and_counts_live() {
    let (names, config) = scratch("register", 4, 3);
    let registry = Registry::open(&names, &config).unwrap();

    let ids: Vec<_> = (0..3).map(|_| registry.register_instance().unwrap()).collect();
    let slots: HashSet<_> = ids.iter().map(|id| id.slot()).collect();
    assert_eq!(slots.len(), 3);
    assert_eq!(registry.live_count().unwrap(), 3);
    assert_eq!(registry.members().unwrap(), ids);

    match registry.register_instance() {
        Err(RegistryError::InstancesFull { capacity }) => assert_eq!(capacity, 3),
        other => panic!("expected InstancesFull, got {other:?}"),
    }
    assert_eq!(registry.live_count().unwrap(), 3);
}

#[test]
fn reused_instance_slot_gets_new_generation() {
    let (names, config) = scratch("generation", 4, 2);
    let registry = Registry::open(&names, &config).unwrap();

    let keep = registry.register_instance().unwrap();
    let first = registry.register_instance().unwrap();
    registry.deregister_instance(first).unwrap();
    let second = registry.register_instance().unwrap();

    assert_eq!(first.slot(), second.slot());
    assert_ne!(first, second);
    registry.deregister_instance(second).unwrap();
    registry.deregister_instance(keep).unwrap();
}

#[test]
fn only_last_deregistration_reports_last_and_tears_down() {
    let (names, config) = scratch("last", 4, 3);
    let registry = Registry::open(&names, &config).unwrap();
    let a = registry.register_instance().unwrap();
    let b = registry.register_instance().unwrap();

    let first = registry.deregister_instance(b).unwrap();
    assert!(!first.was_last);
    assert!(!registry.is_torn_down().unwrap());

    let second = registry.deregister_instance(a).unwrap();
    assert!(second.was_last);
    assert!(registry.is_torn_down().unwrap());

    assert!(matches!(registry.register_instance(), Err(RegistryError::TornDown)));
    assert!(matches!(
        registry.allocate_slot(fake(900_002, a)),
        Err(RegistryError::TornDown)
    ));
}

#[test]
fn destroy_lets_next_opener_start_fresh() {
    let (names, config) = scratch("destroy", 4, 3);
    let old = Registry::open(&names, &config).unwrap();
    let id = old.register_instance().unwrap();
    assert!(old.deregister_instance(id).unwrap().was_last);
    old.destroy();

    let fresh = Registry::open(&names, &config).unwrap();
    assert!(!fresh.is_torn_down().unwrap());
    let again = fresh.register_instance().unwrap();
    assert_eq!(fresh.live_count().unwrap(), 1);
    fresh.deregister_instance(again).unwrap();
}

// ========== Process slots ==========

#[test]
fn allocate_uses_first_free_slot_and_full_changes_nothing() {
    let (names, config) = scratch("allocate", 2, 2);
    let registry = Registry::open(&names, &config).unwrap();
    let id = registry.register_instance().unwrap();

    assert_eq!(registry.allocate_slot(fake(900_010, id)).unwrap(), 0);
    assert_eq!(registry.allocate_slot(fake(900_011, id)).unwrap(), 1);

    let before = registry.snapshot().unwrap();
    match registry.allocate_slot(fake(900_012, id)) {
        Err(RegistryError::Full { capacity }) => assert_eq!(capacity, 2),
        other => panic!("expected Full, got {other:?}"),
    }
    assert_eq!(registry.snapshot().unwrap(), before);

    assert!(registry.free_slot(ProcessHandle::from_raw(900_010)).unwrap());
    assert_eq!(registry.allocate_slot(fake(900_012, id)).unwrap(), 0);
}

#[test]
fn free_slot_is_idempotent_and_terminated_is_final() {
    let (names, config) = scratch("free", 4, 2);
    let registry = Registry::open(&names, &config).unwrap();
    let id = registry.register_instance().unwrap();
    let h = ProcessHandle::from_raw(900_020);
    registry.allocate_slot(fake(900_020, id)).unwrap();

    assert!(registry.free_slot(h).unwrap());
    let after_first = registry.snapshot().unwrap();
    assert!(!registry.free_slot(h).unwrap());
    assert_eq!(registry.snapshot().unwrap(), after_first);

    let rec = &after_first[0];
    assert_eq!(rec.status, ProcessStatus::Terminated);
    assert!(!rec.active);
    assert!(registry.find_active(h).unwrap().is_none());
    assert!(registry.active_records().unwrap().is_empty());
}

#[test]
fn concurrent_frees_retire_exactly_once() {
    let (names, config) = scratch("race", 4, 2);
    let registry = Arc::new(Registry::open(&names, &config).unwrap());
    let id = registry.register_instance().unwrap();
    let h = ProcessHandle::from_raw(900_030);
    registry.allocate_slot(fake(900_030, id)).unwrap();

    let barrier = Arc::new(Barrier::new(8));
    let wins: usize = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.free_slot(h).unwrap()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap() as usize)
        .sum();
    assert_eq!(wins, 1);
}

#[test]
fn duplicate_handle_retires_stale_record() {
    let (names, config) = scratch("dup", 4, 2);
    let registry = Registry::open(&names, &config).unwrap();
    let id = registry.register_instance().unwrap();

    let first = registry.allocate_slot(fake(900_040, id)).unwrap();
    registry.allocate_slot(fake(900_041, id)).unwrap();
    let again = registry.allocate_slot(fake(900_040, id)).unwrap();
    assert_eq!(first, again);

    let active = registry.active_records().unwrap();
    let handles: Vec<_> = active.iter().map(|r| r.handle.as_raw()).collect();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles.iter().filter(|&&h| h == 900_040).count(), 1);
}

// The stale record and the new one share a pid, so the only thing another
// instance could be told is "TERMINATE <pid>", which names the new process.
// Peers read the shared table, so the replacement is already visible to them.
#[test]
fn reused_pid_replacement_is_visible_to_other_handles() {
    let (names, config) = scratch("dup_peer", 4, 2);
    let launcher = Registry::open(&names, &config).unwrap();
    let peer = Registry::open(&names, &config).unwrap();
    let old_owner = launcher.register_instance().unwrap();
    let new_owner = launcher.register_instance().unwrap();

    let h = ProcessHandle::from_raw(900_045);
    launcher
        .allocate_slot(NewProcess::new(h, old_owner, "sleep old", ProcessMode::Detached))
        .unwrap();
    launcher
        .allocate_slot(NewProcess::new(h, new_owner, "sleep new", ProcessMode::Detached))
        .unwrap();

    let rec = peer.find_active(h).unwrap().expect("replacement record");
    assert_eq!(rec.owner, new_owner);
    assert_eq!(rec.command, "sleep new");
    assert_eq!(peer.active_records().unwrap().len(), 1);
}

#[test]
fn record_keeps_launch_details() {
    let (names, config) = scratch("details", 4, 2);
    let registry = Registry::open(&names, &config).unwrap();
    let id = registry.register_instance().unwrap();
    let h = ProcessHandle::from_raw(900_050);
    registry
        .allocate_slot(NewProcess::new(h, id, "sleep 100", ProcessMode::Attached))
        .unwrap();

    let rec = registry.find_active(h).unwrap().expect("record");
    assert_eq!(rec.owner, id);
    assert_eq!(rec.command, "sleep 100");
    assert_eq!(rec.mode, ProcessMode::Attached);
    assert_eq!(rec.status, ProcessStatus::Running);
    assert!(rec.active);
    assert!(rec.uptime().as_secs() < 60);
}

#[test]
fn long_commands_are_truncated() {
    let (names, config) = scratch("truncate", 4, 2);
    let registry = Registry::open(&names, &config).unwrap();
    let id = registry.register_instance().unwrap();
    let long = format!("echo {}", "x".repeat(400));
    let h = ProcessHandle::from_raw(900_060);
    registry
        .allocate_slot(NewProcess::new(h, id, long.clone(), ProcessMode::Detached))
        .unwrap();

    let rec = registry.find_active(h).unwrap().unwrap();
    assert_eq!(rec.command.len(), COMMAND_MAX - 1);
    assert!(long.starts_with(&rec.command));
}

#[test]
fn with_members_sees_consistent_membership() {
    let (names, config) = scratch("members", 4, 3);
    let registry = Registry::open(&names, &config).unwrap();
    let a = registry.register_instance().unwrap();
    let b = registry.register_instance().unwrap();

    let seen = registry.with_members(|m| m.to_vec()).unwrap();
    assert_eq!(seen, vec![a, b]);
}

// ========== Deregistration side effects ==========

#[test]
fn deregister_signals_only_owned_attached_children() {
    let (names, config) = scratch("dereg", 4, 3);
    let registry = Registry::open(&names, &config).unwrap();
    let me = registry.register_instance().unwrap();
    let other = registry.register_instance().unwrap();

    let attached = process::spawn("sleep 30", ProcessMode::Attached).unwrap();
    let detached = process::spawn("sleep 30", ProcessMode::Detached).unwrap();
    registry
        .allocate_slot(NewProcess::new(attached, me, "sleep 30", ProcessMode::Attached))
        .unwrap();
    registry
        .allocate_slot(NewProcess::new(detached, me, "sleep 30", ProcessMode::Detached))
        .unwrap();
    registry.allocate_slot(fake(900_070, other)).unwrap();

    let d = registry.deregister_instance(me).unwrap();
    assert!(!d.was_last);
    assert_eq!(d.terminated, vec![attached]);

    match process::wait(attached).unwrap() {
        Some(exit) => assert_eq!(exit, ExitInfo::Signaled(libc::SIGTERM)),
        None => panic!("attached child was reaped elsewhere"),
    }
    assert!(registry.find_active(attached).unwrap().is_none());
    assert!(registry.find_active(detached).unwrap().is_some());
    assert!(registry.find_active(ProcessHandle::from_raw(900_070)).unwrap().is_some());

    process::kill(detached).unwrap();
    process::wait(detached).unwrap();
    registry.deregister_instance(other).unwrap();
}
