//! Scheduler throughput benchmarks using criterion.
//!
//! Measures fan-out of N tiny tasks from the host thread, nested fan-out
//! from inside fibers, and the raw cost of a fiber round trip.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use jobfiber::fiber::{RootSwitch, SwitchReason};
use jobfiber::{CorosenseiPlatform, FiberPlatform, Job, JobSystem, JobSystemConfig};
use std::hint::black_box;

fn bench_fan_out(c: &mut Criterion) {
    let system = JobSystem::new(JobSystemConfig::default()).expect("job system");

    let mut group = c.benchmark_group("fan_out");
    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::new("tasks", count), |b| {
            b.iter(|| {
                let job = Job::new("bench", count, |i, _| {
                    black_box(i);
                });
                system.do_and_wait(&job).expect("do_and_wait");
            });
        });
    }
    group.finish();

    system.shutdown().expect("shutdown");
}

fn bench_nested(c: &mut Criterion) {
    let system = JobSystem::new(JobSystemConfig::default()).expect("job system");

    let mut group = c.benchmark_group("nested");
    group.sample_size(20);
    group.bench_function("16x256", |b| {
        b.iter(|| {
            let outer = Job::new("outer", 16, |_, ctx| {
                let inner = Job::batched("inner", 32, 256, |item, _| {
                    black_box(item);
                });
                ctx.do_and_wait(&inner).expect("inner");
            });
            system.do_and_wait(&outer).expect("outer");
        });
    });
    group.finish();

    system.shutdown().expect("shutdown");
}

fn ping_pong(root: &dyn RootSwitch) {
    loop {
        root.switch_to_root(SwitchReason::Yielded);
    }
}

fn bench_fiber_round_trip(c: &mut Criterion) {
    let mut fiber = CorosenseiPlatform
        .create_fiber(64 * 1024, Box::new(ping_pong))
        .expect("fiber");

    c.bench_function("fiber_round_trip", |b| {
        b.iter(|| black_box(fiber.switch_in()));
    });
}

criterion_group!(benches, bench_fan_out, bench_nested, bench_fiber_round_trip);
criterion_main!(benches);
