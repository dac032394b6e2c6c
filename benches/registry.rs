// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Registry and bus hot paths.
//
// Run with:
//   cargo bench --bench registry
//
// Groups:
//   registry_slot      allocate + free of one record under the registry lock
//   registry_snapshot  full-table copy at three table sizes
//   bus_roundtrip      point-to-point send + receive between two mailboxes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use procx::shm_name::ResourceNames;
use procx::{
    Bus, Config, InstanceId, NewProcess, Notification, NotificationKind, ProcessHandle,
    ProcessMode, Recipient, Registry,
};

const TABLE_SIZES: &[usize] = &[16, 50, 256];

fn scratch(tag: &str, process_capacity: usize) -> (ResourceNames, Config) {
    let namespace = format!("procx_bench{}_{tag}", std::process::id());
    let names = ResourceNames::new(&namespace);
    Registry::clear_storage(&names);
    Bus::clear_storage(&names);
    let config = Config {
        namespace,
        process_capacity,
        instance_capacity: 4,
        ..Config::default()
    };
    (names, config)
}

fn bench_slot_cycle(c: &mut Criterion) {
    let (names, config) = scratch("slot", 50);
    let registry = Registry::open(&names, &config).expect("registry");
    let owner = registry.register_instance().expect("register");
    let handle = ProcessHandle::from_raw(900_500);

    let mut group = c.benchmark_group("registry_slot");
    group.throughput(Throughput::Elements(1));
    group.bench_function("allocate_free", |b| {
        b.iter(|| {
            let slot = registry
                .allocate_slot(NewProcess::new(handle, owner, "sleep 1", ProcessMode::Detached))
                .expect("allocate");
            black_box(slot);
            black_box(registry.free_slot(handle).expect("free"));
        });
    });
    group.finish();

    Registry::clear_storage(&names);
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_snapshot");

    for &size in TABLE_SIZES {
        let (names, config) = scratch(&format!("snap{size}"), size);
        let registry = Registry::open(&names, &config).expect("registry");
        let owner = registry.register_instance().expect("register");
        for i in 0..size {
            let h = ProcessHandle::from_raw(900_600 + i as i32);
            registry
                .allocate_slot(NewProcess::new(h, owner, "sleep 1", ProcessMode::Detached))
                .expect("fill");
        }

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(registry.snapshot().expect("snapshot")));
        });

        Registry::clear_storage(&names);
    }

    group.finish();
}

fn bench_bus_roundtrip(c: &mut Criterion) {
    let (names, config) = scratch("bus", 4);
    let registry = Registry::open(&names, &config).expect("registry");
    let bus = Bus::open(&names, &config).expect("bus");
    let a: InstanceId = registry.register_instance().expect("register a");
    let b_id: InstanceId = registry.register_instance().expect("register b");
    bus.attach(a).expect("attach a");
    bus.attach(b_id).expect("attach b");
    let note = Notification::new(
        NotificationKind::Start,
        a,
        Some(ProcessHandle::from_raw(900_700)),
    );

    let mut group = c.benchmark_group("bus_roundtrip");
    group.throughput(Throughput::Elements(1));
    group.bench_function("send_receive", |b| {
        b.iter(|| {
            bus.send(Recipient::Instance(b_id), note).expect("send");
            black_box(bus.receive(b_id).expect("receive"));
        });
    });
    group.finish();

    bus.remove();
    registry.destroy();
}

criterion_group!(benches, bench_slot_cycle, bench_snapshot, bench_bus_roundtrip);
criterion_main!(benches);
