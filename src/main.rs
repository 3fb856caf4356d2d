use fibersched::log::{self, LogLevel};
use fibersched::{Affinity, Config, Fiber, Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

fn main() {
    log::init_logging(LogLevel::Info);
    println!("fibersched - stackful fibers on an N:M scheduler\n");

    if let Some(path) = std::env::args().nth(1) {
        match Config::load_from_file(&path) {
            Ok(()) => println!("Loaded configuration from {path}\n"),
            Err(err) => {
                eprintln!("failed to load {path}: {err}");
                std::process::exit(1);
            }
        }
    }

    let config = SchedulerConfig {
        name: "demo".to_string(),
        ..SchedulerConfig::default()
    };
    let workers = config.workers;
    let scheduler = match Scheduler::new_with_config(config) {
        Ok(scheduler) => scheduler,
        Err(err) => {
            eprintln!("failed to create scheduler: {err}");
            std::process::exit(1);
        }
    };
    println!("Scheduler `{}` with {workers} workers (caller included)\n", scheduler.name());

    if let Err(err) = run_demo(&scheduler) {
        eprintln!("demo failed: {err}");
        std::process::exit(1);
    }
}

fn run_demo(scheduler: &Scheduler) -> fibersched::Result<()> {
    scheduler.start()?;

    // Example 1: fibers that yield back to the scheduler between steps
    println!("Example 1: Cooperative yielding");
    let steps = Arc::new(AtomicUsize::new(0));
    for i in 0..4 {
        let steps = steps.clone();
        scheduler.schedule_fn(move || {
            for step in 0..3 {
                println!("  fiber {i} step {step} on fiber id {}", Fiber::current_id());
                steps.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_ready();
            }
        })?;
    }

    // Example 2: a batch of small jobs submitted under one lock
    println!("Example 2: Batch submission");
    let sum = Arc::new(AtomicUsize::new(0));
    let jobs = (0..1000).map(|i| {
        let sum = sum.clone();
        fibersched::Task::callback(move || {
            sum.fetch_add(i, Ordering::Relaxed);
        })
    });
    let start = Instant::now();
    scheduler.schedule_batch(jobs, Affinity::Any)?;

    // Example 3: a task pinned to the last worker
    let last = scheduler.worker_count() - 1;
    scheduler.schedule(
        fibersched::Task::callback(move || {
            println!("  pinned task ran on worker {:?}", Scheduler::current_worker());
        }),
        Affinity::Worker(last),
    )?;

    scheduler.stop()?;

    println!("\nCompleted {} yielding steps", steps.load(Ordering::SeqCst));
    println!(
        "Batch sum {} (expected {}) in {:?}",
        sum.load(Ordering::Relaxed),
        (0..1000).sum::<usize>(),
        start.elapsed()
    );
    println!("Live fibers at exit: {}", Fiber::total_fibers());
    Ok(())
}
