//! Fiber switch latency benchmark using criterion.
//!
//! Measures the raw resume/yield cost on a single fiber and the round trip
//! of one task through a running scheduler.

use criterion::{Criterion, criterion_group, criterion_main};
use fibersched::{Fiber, FiberState, Scheduler, Semaphore};
use std::sync::Arc;

/// Resume into a parked fiber and let it yield straight back.
fn bench_raw_fiber_switch(c: &mut Criterion) {
    let fiber = Fiber::new(
        || loop {
            Fiber::yield_ready();
        },
        128 * 1024,
    )
    .unwrap();

    // Warmup
    for _ in 0..1000 {
        fiber.resume();
    }

    c.bench_function("raw_fiber_switch", |b| {
        b.iter(|| {
            std::hint::black_box(fiber.resume());
        })
    });

    // The loop never ends, so the fiber cannot be dropped cleanly.
    std::mem::forget(fiber);
}

/// Reset a finished fiber and run a tiny callback to completion.
fn bench_reset_and_run(c: &mut Criterion) {
    let fiber = Fiber::new(|| {}, 128 * 1024).unwrap();
    fiber.resume();

    c.bench_function("fiber_reset_and_run", |b| {
        b.iter(|| {
            fiber.reset(|| {
                std::hint::black_box(42);
            });
            let state = fiber.resume();
            debug_assert_eq!(state, FiberState::Term);
        })
    });
}

/// Schedule one callback and wait for it to signal back.
fn bench_scheduler_round_trip(c: &mut Criterion) {
    let scheduler = Scheduler::new(1, false, "bench-round-trip").unwrap();
    scheduler.start().unwrap();
    let done = Arc::new(Semaphore::new(0));

    c.bench_function("scheduler_round_trip", |b| {
        b.iter(|| {
            let signal = done.clone();
            scheduler
                .schedule_fn(move || {
                    signal.notify();
                })
                .unwrap();
            done.wait();
        });
    });

    scheduler.stop().unwrap();
}

criterion_group!(
    benches,
    bench_raw_fiber_switch,
    bench_reset_and_run,
    bench_scheduler_round_trip
);
criterion_main!(benches);
