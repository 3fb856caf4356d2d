use fibersched::{Semaphore, Thread};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn test_handshake_completes_before_new_returns() {
    let started = Arc::new(AtomicBool::new(false));
    let observed_id = Arc::new(AtomicU64::new(0));
    let started_clone = started.clone();
    let observed_clone = observed_id.clone();
    let mut thread = Thread::new(
        move || {
            started_clone.store(true, Ordering::SeqCst);
            observed_clone.store(Thread::current_id(), Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
        },
        "handshake",
    )
    .unwrap();

    assert_eq!(thread.name(), "handshake");
    // The id is published by the handshake, before the body runs.
    let id = thread.id();
    assert_ne!(id, 0);
    thread.join().unwrap();
    assert!(started.load(Ordering::SeqCst));
    assert_eq!(observed_id.load(Ordering::SeqCst), id);
    assert_eq!(thread.id(), id);
}

#[test]
fn test_callback_runs_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut threads: Vec<Thread> = (0..8)
        .map(|i| {
            let runs = runs.clone();
            Thread::new(
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                },
                &format!("once_{i}"),
            )
            .unwrap()
        })
        .collect();
    for thread in &mut threads {
        thread.join().unwrap();
        thread.join().unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 8);
}

#[test]
fn test_thread_sees_its_own_name() {
    let name = Arc::new(parking_lot::Mutex::new(String::new()));
    let name_clone = name.clone();
    let mut thread = Thread::new(
        move || {
            *name_clone.lock() = Thread::current_name();
        },
        "named-worker",
    )
    .unwrap();
    thread.join().unwrap();
    assert_eq!(*name.lock(), "named-worker");
}

#[test]
fn test_semaphore_ping_pong() {
    let ping = Arc::new(Semaphore::new(0));
    let pong = Arc::new(Semaphore::new(0));
    let (ping_clone, pong_clone) = (ping.clone(), pong.clone());
    let mut thread = Thread::new(
        move || {
            for _ in 0..100 {
                ping_clone.wait();
                pong_clone.notify();
            }
        },
        "ping-pong",
    )
    .unwrap();

    for _ in 0..100 {
        ping.notify();
        pong.wait();
    }
    thread.join().unwrap();
    assert_eq!(ping.available(), 0);
    assert_eq!(pong.available(), 0);
}
