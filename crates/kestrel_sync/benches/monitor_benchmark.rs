//! # Monitor Benchmark
//!
//! Uncontended and contended cost of the monitor operations, and of a
//! sandbox pull/edit/compare-and-set cycle.
//!
//! Run with: `cargo bench --package kestrel_sync`

// Benchmarks don't need docs
#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kestrel_sync::{Monitor, MonitorConfig, Sandbox, TimeUnit};

/// Benchmark: single-threaded read and write.
fn bench_uncontended(c: &mut Criterion) {
    let monitor = Monitor::new(0_u64);
    let mut group = c.benchmark_group("uncontended");

    group.bench_function("read", |b| b.iter(|| black_box(monitor.read(|v| *v))));
    group.bench_function("write", |b| b.iter(|| monitor.write(|v| *v += 1)));
    group.bench_function("read_when_satisfied", |b| {
        b.iter(|| black_box(monitor.read_when(|v| *v, |_| true)))
    });
    group.bench_function("write_when_satisfied", |b| {
        b.iter(|| black_box(monitor.write_when(|v| *v += 1, |_| true)))
    });
    group.bench_function("write_within_satisfied", |b| {
        b.iter(|| {
            black_box(monitor.write_within(|v| *v += 1, |_| true, 1, TimeUnit::Seconds))
        })
    });

    group.finish();
}

/// Benchmark: reads while background threads keep writing.
fn bench_read_under_writers(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_under_writers");

    for config in [MonitorConfig::writer_preferring(), MonitorConfig::reader_preferring()] {
        let monitor = Arc::new(Monitor::with_config(0_u64, &config));
        let stop = Arc::new(AtomicBool::new(false));
        let writers: Vec<_> = (0..2)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        monitor.write(|v| *v = v.wrapping_add(1));
                    }
                })
            })
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", config.policy)),
            &monitor,
            |b, monitor| b.iter(|| black_box(monitor.read(|v| *v))),
        );

        stop.store(true, Ordering::Relaxed);
        for writer in writers {
            writer.join().unwrap();
        }
    }

    group.finish();
}

/// Benchmark: one optimistic update of a 1k-element entity.
fn bench_sandbox_cycle(c: &mut Criterion) {
    let monitor = Monitor::new(Arc::new(vec![0_u32; 1_000]));
    let mut sandbox = Sandbox::new();

    c.bench_function("sandbox_pull_edit_cas", |b| {
        b.iter(|| {
            sandbox.pull(&monitor).unwrap();
            sandbox.get_mut().unwrap()[0] += 1;
            black_box(sandbox.cas_by_reference(&monitor).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_uncontended,
    bench_read_under_writers,
    bench_sandbox_cycle,
);
criterion_main!(benches);
