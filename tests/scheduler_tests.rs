use fibersched::{Affinity, Fiber, FiberState, Scheduler, SchedulerConfig, SchedulerState, Task};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn wait_for(counter: &AtomicUsize, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "timed out waiting for tasks");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_fifo_order_on_single_worker() {
    let scheduler = Scheduler::new(1, true, "fifo").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = order.clone();
        scheduler
            .schedule_fn(move || {
                order.lock().push(i);
            })
            .unwrap();
    }

    scheduler.start().unwrap();
    scheduler.stop().unwrap();

    assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_every_task_runs_exactly_once() {
    let scheduler = Scheduler::new(4, false, "exactly-once").unwrap();
    scheduler.start().unwrap();

    let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..500).map(|_| AtomicUsize::new(0)).collect());
    for i in 0..500 {
        let hits = hits.clone();
        scheduler
            .schedule_fn(move || {
                hits[i].fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    scheduler.stop().expect("Shutdown failed");
    assert!(hits.iter().all(|hit| hit.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_ready_fibers_are_rescheduled() {
    let scheduler = Scheduler::new(2, false, "reschedule").unwrap();
    scheduler.start().unwrap();

    let steps = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let steps = steps.clone();
        scheduler
            .schedule_fn(move || {
                for _ in 0..5 {
                    steps.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_ready();
                }
            })
            .unwrap();
    }

    wait_for(&steps, 100);
    scheduler.stop().unwrap();
    assert_eq!(steps.load(Ordering::SeqCst), 100);
}

#[test]
fn test_pinned_tasks_run_on_their_worker() {
    let scheduler = Scheduler::new(3, false, "pinned").unwrap();
    scheduler.start().unwrap();

    let wrong = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..60 {
        let worker = i % 3;
        let wrong = wrong.clone();
        let done = done.clone();
        scheduler
            .schedule(
                Task::callback(move || {
                    if Scheduler::current_worker() != Some(worker) {
                        wrong.fetch_add(1, Ordering::SeqCst);
                    }
                    Fiber::yield_ready();
                    if Scheduler::current_worker() != Some(worker) {
                        wrong.fetch_add(1, Ordering::SeqCst);
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                }),
                Affinity::Worker(worker),
            )
            .unwrap();
    }

    wait_for(&done, 60);
    scheduler.stop().unwrap();
    assert_eq!(wrong.load(Ordering::SeqCst), 0);
}

#[test]
fn test_concurrent_submission_loses_nothing() {
    let scheduler = Arc::new(Scheduler::new(4, false, "concurrent").unwrap());
    scheduler.start().unwrap();

    let executed = Arc::new(AtomicUsize::new(0));
    let submitters: Vec<_> = (0..8)
        .map(|t| {
            let handle = scheduler.handle();
            let executed = executed.clone();
            std::thread::spawn(move || {
                for i in 0..250 {
                    let executed = executed.clone();
                    let affinity = if (t + i) % 2 == 0 {
                        Affinity::Worker(1)
                    } else {
                        Affinity::Worker(2)
                    };
                    handle
                        .schedule(
                            Task::callback(move || {
                                executed.fetch_add(1, Ordering::SeqCst);
                            }),
                            affinity,
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    scheduler.stop().unwrap();
    assert_eq!(executed.load(Ordering::SeqCst), 8 * 250);
}

#[test]
fn test_fiber_tasks_run_on_workers() {
    let scheduler = Scheduler::new(2, false, "fiber-tasks").unwrap();
    let threads = Arc::new(Mutex::new(HashSet::new()));

    let fibers: Vec<Arc<Fiber>> = (0..10)
        .map(|_| {
            let threads = threads.clone();
            Fiber::new(
                move || {
                    threads.lock().insert(std::thread::current().name().map(str::to_string));
                },
                0,
            )
            .unwrap()
        })
        .collect();
    scheduler
        .schedule_batch(fibers.iter().cloned(), Affinity::Any)
        .unwrap();

    scheduler.start().unwrap();
    scheduler.stop().unwrap();

    assert!(fibers.iter().all(|fiber| fiber.state().is_terminal()));
    for name in threads.lock().iter() {
        let name = name.as_deref().unwrap_or("");
        assert!(name.starts_with("fiber-tasks_"), "unexpected thread {name}");
    }
}

#[test]
fn test_self_rescheduling_fiber() {
    let scheduler = Scheduler::new(2, false, "self-schedule").unwrap();
    scheduler.start().unwrap();

    let rounds = Arc::new(AtomicUsize::new(0));
    let rounds_clone = rounds.clone();
    scheduler
        .schedule_fn(move || {
            for _ in 0..10 {
                rounds_clone.fetch_add(1, Ordering::SeqCst);
                let me = Fiber::current();
                let handle = Scheduler::current().unwrap();
                handle.schedule(me, Affinity::Any).unwrap();
                Fiber::yield_hold();
            }
        })
        .unwrap();

    wait_for(&rounds, 10);
    scheduler.stop().unwrap();
    assert_eq!(rounds.load(Ordering::SeqCst), 10);
}

#[test]
fn test_state_transitions() {
    let config = SchedulerConfig {
        workers: 2,
        use_caller: false,
        name: "lifecycle".to_string(),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new_with_config(config).unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    scheduler.start().unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Running);
    assert_eq!(scheduler.handle().state(), SchedulerState::Running);
    scheduler.stop().unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    // A stopped scheduler can be started again.
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();
    scheduler.start().unwrap();
    scheduler
        .schedule_fn(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    scheduler.stop().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pinned_workers_still_run() {
    let config = SchedulerConfig {
        workers: 2,
        use_caller: true,
        name: "pinned-cores".to_string(),
        pin_workers: true,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new_with_config(config).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let counter = counter.clone();
        scheduler
            .schedule_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    scheduler.start().unwrap();
    scheduler.stop().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 10);
}

#[test]
fn test_main_fiber_cannot_be_scheduled() {
    let scheduler = Scheduler::new(1, false, "main-fiber").unwrap();
    scheduler.start().unwrap();

    let main = Fiber::current();
    assert!(main.is_main());
    let err = scheduler.schedule(main.clone(), Affinity::Any).unwrap_err();
    assert!(matches!(err, fibersched::Error::MainFiberTask));

    // A batch with a main fiber in it is rejected as a whole.
    let spawned = Fiber::new(|| {}, 0).unwrap();
    let err = scheduler
        .schedule_batch(vec![spawned.clone(), main.clone()], Affinity::Any)
        .unwrap_err();
    assert!(matches!(err, fibersched::Error::MainFiberTask));
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(spawned.state(), FiberState::Init);

    scheduler.stop().unwrap();
    assert_eq!(main.state(), FiberState::Exec);
}
