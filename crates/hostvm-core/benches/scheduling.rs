//! Scheduling benchmarks for hostvm-core
//!
//! These measure the host's own overhead around a runtime that does
//! nothing on attach or detach:
//! - Round trip through an idle, already attached worker
//! - Fan-out bursts that force on-demand worker creation
//! - Full boot-to-shutdown cycle of a generation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hostvm_core::{HostConfig, Lifecycle, ModuleLifetime, Priority, Runtime};

/// Runtime whose every operation succeeds immediately.
struct NoopRuntime;

impl Runtime for NoopRuntime {
    type Config = ();
    type Handle = ();
    type Env = ();
    type Error = String;

    fn boot(&self, _config: ()) -> Result<(), String> {
        Ok(())
    }

    fn attach_current_thread(&self, _handle: &()) -> Result<(), String> {
        Ok(())
    }

    fn detach_current_thread(&self, _handle: &(), _env: ()) {}

    fn shutdown(&self, _handle: ()) {}
}

fn host() -> Lifecycle<NoopRuntime> {
    Lifecycle::with_module_lifetime(NoopRuntime, HostConfig::default(), ModuleLifetime::untracked())
}

// ============================================================================
// Round-trip Benchmarks
// ============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    let lifecycle = host();
    let generation = match lifecycle.create_runtime(()) {
        Ok(generation) => generation,
        Err(err) => panic!("boot failed: {}", err),
    };

    // Served by the boot thread once it is idle.
    group.bench_function("sync_noop", |b| {
        b.iter(|| {
            lifecycle
                .schedule_with_result(generation, Priority::Sync, |_| black_box(42))
                .unwrap()
                .wait()
                .unwrap()
        })
    });

    // The first iteration spawns one async worker; later ones reuse it.
    group.bench_function("async_noop", |b| {
        b.iter(|| {
            lifecycle
                .schedule_with_result(generation, Priority::Async, |_| black_box(42))
                .unwrap()
                .wait()
                .unwrap()
        })
    });

    group.finish();
}

// ============================================================================
// Fan-out Benchmarks
// ============================================================================

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for num_jobs in [10_usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*num_jobs as u64));

        group.bench_with_input(BenchmarkId::new("async_burst", num_jobs), num_jobs, |b, &n| {
            let lifecycle = host();
            let generation = lifecycle.create_runtime(()).unwrap();
            b.iter(|| {
                let counter = Arc::new(AtomicUsize::new(0));
                let completions: Vec<_> = (0..n)
                    .map(|_| {
                        let counter = Arc::clone(&counter);
                        lifecycle
                            .schedule_with_result(generation, Priority::Async, move |_| {
                                counter.fetch_add(1, Ordering::Relaxed)
                            })
                            .unwrap()
                    })
                    .collect();
                for completion in completions {
                    let _ = completion.wait();
                }
                assert_eq!(counter.load(Ordering::Relaxed), n);
            })
        });
    }

    group.finish();
}

// ============================================================================
// Lifecycle Benchmarks
// ============================================================================

fn bench_generation_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation_cycle");
    let lifecycle = host();

    group.bench_function("boot_terminate", |b| {
        b.iter(|| {
            let generation = lifecycle.create_runtime(()).unwrap();
            lifecycle.begin_termination(generation).unwrap();
            lifecycle.wait_until_stopped(None)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_round_trip,
    bench_fan_out,
    bench_generation_cycle,
);

criterion_main!(benches);
