use fibersched::{Fiber, FiberOutcome, FiberState, context};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const STACK: usize = 128 * 1024;

#[test]
fn test_state_sequence_through_yields() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed_clone = observed.clone();
    let fiber = Fiber::new(
        move || {
            for _ in 0..3 {
                observed_clone.lock().push(Fiber::current().state());
                Fiber::yield_ready();
            }
        },
        STACK,
    )
    .unwrap();

    let mut states = vec![fiber.state()];
    loop {
        let state = fiber.resume();
        states.push(state);
        if state.is_terminal() {
            break;
        }
    }

    assert_eq!(
        states,
        vec![
            FiberState::Init,
            FiberState::Ready,
            FiberState::Ready,
            FiberState::Ready,
            FiberState::Term,
        ]
    );
    assert_eq!(*observed.lock(), vec![FiberState::Exec; 3]);
}

#[test]
fn test_hold_then_resume() {
    let fiber = Fiber::new(Fiber::yield_hold, STACK).unwrap();
    assert_eq!(fiber.resume(), FiberState::Hold);
    assert!(!fiber.is_running());
    assert_eq!(fiber.resume(), FiberState::Term);
}

#[test]
fn test_switch_out_leaves_fiber_held() {
    let fiber = Fiber::new(|| Fiber::current().switch_out(), STACK).unwrap();
    assert_eq!(fiber.resume(), FiberState::Hold);
    assert_eq!(fiber.resume(), FiberState::Term);
}

#[test]
fn test_panic_sets_except() {
    let fiber = Fiber::new(|| panic!("fiber body failed"), STACK).unwrap();
    assert_eq!(fiber.resume(), FiberState::Except);
    assert_eq!(
        fiber.outcome(),
        Some(FiberOutcome::Faulted("fiber body failed".to_string()))
    );
    // The fault stays inside the fiber; this thread carries on.
    assert_eq!(context::current_fiber().state(), FiberState::Exec);
}

#[test]
fn test_reset_preserves_stack() {
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = runs.clone();
    let fiber = Fiber::new(
        move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        },
        192 * 1024,
    )
    .unwrap();
    assert_eq!(fiber.resume(), FiberState::Term);

    let runs_clone = runs.clone();
    fiber.reset(move || {
        runs_clone.fetch_add(10, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), FiberState::Init);
    assert_eq!(fiber.stack_size(), 192 * 1024);
    assert_eq!(fiber.outcome(), None);

    assert_eq!(fiber.resume(), FiberState::Term);
    assert_eq!(runs.load(Ordering::SeqCst), 11);
}

#[test]
fn test_reset_after_panic() {
    let fiber = Fiber::new(|| panic!("first run"), STACK).unwrap();
    assert_eq!(fiber.resume(), FiberState::Except);
    fiber.reset(|| {});
    assert_eq!(fiber.resume(), FiberState::Term);
    assert_eq!(fiber.outcome(), Some(FiberOutcome::Completed));
}

#[test]
fn test_nested_resume_returns_to_resumer() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let inner_order = order.clone();
    let inner = Fiber::new(
        move || {
            inner_order.lock().push("inner start");
            Fiber::yield_ready();
            inner_order.lock().push("inner end");
        },
        STACK,
    )
    .unwrap();

    let outer_order = order.clone();
    let inner_clone = inner.clone();
    let outer = Fiber::new(
        move || {
            let me = Fiber::current();
            outer_order.lock().push("outer start");
            assert_eq!(inner_clone.resume(), FiberState::Ready);
            assert!(Arc::ptr_eq(&Fiber::current(), &me));
            assert_eq!(me.state(), FiberState::Exec);
            outer_order.lock().push("outer middle");
            assert_eq!(inner_clone.resume(), FiberState::Term);
            outer_order.lock().push("outer end");
        },
        STACK,
    )
    .unwrap();

    assert_eq!(outer.resume(), FiberState::Term);
    assert_eq!(inner.state(), FiberState::Term);
    assert_eq!(
        *order.lock(),
        vec!["outer start", "inner start", "outer middle", "inner end", "outer end"]
    );
}

#[test]
fn test_at_most_one_exec_per_thread() {
    let outer_slot: Arc<Mutex<Option<Arc<Fiber>>>> = Arc::new(Mutex::new(None));
    let violations = Arc::new(AtomicUsize::new(0));

    let slot = outer_slot.clone();
    let violations_clone = violations.clone();
    let outer = Fiber::new(
        move || {
            let outer = slot.lock().clone().unwrap();
            let main = context::main_fiber();
            let outer_for_inner = outer.clone();
            let violations_inner = violations_clone.clone();
            let inner = Fiber::new(
                move || {
                    let main = context::main_fiber();
                    let exec = [main.state(), outer_for_inner.state(), Fiber::current().state()]
                        .iter()
                        .filter(|state| **state == FiberState::Exec)
                        .count();
                    if exec != 1 {
                        violations_inner.fetch_add(1, Ordering::SeqCst);
                    }
                },
                STACK,
            )
            .unwrap();

            let exec = [main.state(), outer.state()]
                .iter()
                .filter(|state| **state == FiberState::Exec)
                .count();
            if exec != 1 {
                violations_clone.fetch_add(1, Ordering::SeqCst);
            }
            drop(outer);
            assert_eq!(inner.resume(), FiberState::Term);
        },
        STACK,
    )
    .unwrap();
    *outer_slot.lock() = Some(outer.clone());

    assert_eq!(outer.resume(), FiberState::Term);
    outer_slot.lock().take();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(context::main_fiber().state(), FiberState::Exec);
}

#[test]
fn test_fiber_migrates_between_threads() {
    let threads = Arc::new(Mutex::new(Vec::new()));
    let threads_clone = threads.clone();
    let fiber = Fiber::new(
        move || {
            threads_clone.lock().push(std::thread::current().id());
            Fiber::yield_ready();
            threads_clone.lock().push(std::thread::current().id());
        },
        STACK,
    )
    .unwrap();

    assert_eq!(fiber.resume(), FiberState::Ready);
    let moved = fiber.clone();
    let (state, other) = std::thread::spawn(move || (moved.resume(), std::thread::current().id()))
        .join()
        .unwrap();
    assert_eq!(state, FiberState::Term);
    assert_eq!(*threads.lock(), vec![std::thread::current().id(), other]);
}
