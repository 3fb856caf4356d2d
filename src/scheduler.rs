//! N:M scheduler: fibers multiplexed over a fixed set of worker threads.
//!
//! Every worker runs the same loop. It takes the oldest queued task it is
//! allowed to run, resumes it on a fiber, and then inspects the state the
//! fiber left in. A `Ready` fiber goes back to the queue. A `Hold` fiber is
//! left to whoever holds its handle. A finished fiber is returned to the
//! worker's [`FiberPool`].
//!
//! The queue is a single FIFO protected by a mutex. Tasks may be pinned to a
//! worker with [`Affinity::Worker`]; the scan skips tasks that the worker is
//! not allowed to run, so ordering is FIFO among the tasks eligible for a
//! given worker.

use crate::context;
use crate::error::{Error, Result};
use crate::fiber::{Callback, Fiber, FiberState};
use crate::fiber_pool::FiberPool;
use crate::log::Logger;
use crate::park::{CondvarPark, Park};
use crate::thread::Thread;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::ThreadId;

/// Which workers may run a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Affinity {
    #[default]
    Any,
    /// Only the worker with this index.
    Worker(usize),
}

impl Affinity {
    pub fn admits(self, worker: usize) -> bool {
        match self {
            Affinity::Any => true,
            Affinity::Worker(pinned) => pinned == worker,
        }
    }
}

/// A unit of work for the scheduler: an existing fiber to resume, or a
/// callback that will run on a pooled fiber.
pub enum Task {
    Fiber(Arc<Fiber>),
    Callback(Callback),
}

impl Task {
    pub fn callback<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }

    fn is_running(&self) -> bool {
        match self {
            Task::Fiber(fiber) => fiber.is_running(),
            Task::Callback(_) => false,
        }
    }

    /// Main fibers run on their thread's own stack and can never be resumed.
    fn check_schedulable(&self) -> Result<()> {
        match self {
            Task::Fiber(fiber) if fiber.is_main() => Err(Error::MainFiberTask),
            _ => Ok(()),
        }
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl From<Callback> for Task {
    fn from(callback: Callback) -> Self {
        Task::Callback(callback)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(fiber).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Lifecycle of a scheduler.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Stopping,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Stopped,
            1 => SchedulerState::Running,
            _ => SchedulerState::Stopping,
        }
    }
}

/// Construction parameters, loadable from YAML.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Logical workers, the caller thread included when `use_caller` is set.
    pub workers: usize,
    /// Run worker 0 on the thread that calls [`Scheduler::stop`].
    pub use_caller: bool,
    pub name: String,
    /// Pin worker `i` to core `i` where the platform reports core ids.
    pub pin_workers: bool,
    /// Finished fibers each worker keeps for reuse.
    pub fiber_pool_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            use_caller: true,
            name: "scheduler".to_string(),
            pin_workers: false,
            fiber_pool_capacity: 16,
        }
    }
}

struct ScheduledTask {
    task: Task,
    affinity: Affinity,
}

enum Next {
    Run(ScheduledTask),
    Idle,
    Exit,
}

struct Shared {
    name: String,
    worker_count: usize,
    queue: Mutex<VecDeque<ScheduledTask>>,
    state: AtomicU8,
    /// Workers currently between taking a task and finishing with it.
    active: AtomicUsize,
    park: Box<dyn Park>,
    pin_workers: bool,
    fiber_pool_capacity: usize,
}

impl Shared {
    fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SchedulerState, to: SchedulerState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| Error::InvalidState {
                name: self.name.clone(),
                expected: from,
                actual: SchedulerState::from_u8(actual),
            })
    }

    fn check_affinity(&self, affinity: Affinity) -> Result<()> {
        match affinity {
            Affinity::Worker(worker) if worker >= self.worker_count => Err(Error::InvalidAffinity {
                worker,
                workers: self.worker_count,
            }),
            _ => Ok(()),
        }
    }

    fn push(&self, entry: ScheduledTask) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(entry);
            was_empty
        };
        if need_tickle {
            self.park.tickle();
        }
    }

    fn next(&self, worker: usize) -> Next {
        let mut need_tickle = false;
        let next = {
            let mut queue = self.queue.lock();
            let position = queue
                .iter()
                .position(|entry| entry.affinity.admits(worker) && !entry.task.is_running());
            match position.and_then(|index| queue.remove(index)) {
                Some(entry) => {
                    self.active.fetch_add(1, Ordering::AcqRel);
                    need_tickle = !queue.is_empty();
                    Next::Run(entry)
                }
                None => {
                    let drained = self.state() == SchedulerState::Stopping
                        && self.active.load(Ordering::Acquire) == 0
                        && !queue.iter().any(|entry| entry.affinity.admits(worker));
                    if drained { Next::Exit } else { Next::Idle }
                }
            }
        };
        if need_tickle {
            self.park.tickle();
        }
        next
    }

    fn execute(&self, entry: ScheduledTask, worker: usize, pool: &mut FiberPool) {
        let ScheduledTask { task, affinity } = entry;
        let fiber = match task {
            Task::Fiber(fiber) => fiber,
            Task::Callback(callback) => match pool.get(callback) {
                Ok(fiber) => fiber,
                Err(err) => {
                    Logger::system().error(format_args!(
                        "scheduler `{}` worker {worker} dropped a task: {err}",
                        self.name
                    ));
                    return;
                }
            },
        };

        let state = fiber.state();
        if !state.is_resumable() {
            Logger::system().warn(format_args!(
                "scheduler `{}` worker {worker} skipped fiber {} in state {state:?}",
                self.name,
                fiber.id()
            ));
            return;
        }

        match fiber.resume() {
            FiberState::Ready => self.push(ScheduledTask {
                task: Task::Fiber(fiber),
                affinity,
            }),
            FiberState::Term | FiberState::Except => {
                pool.return_fiber(fiber);
            }
            FiberState::Hold | FiberState::Init | FiberState::Exec => {}
        }
    }
}

thread_local! {
    static WORKER: RefCell<Option<(Handle, usize)>> = const { RefCell::new(None) };
}

/// Marks the calling thread as a worker for the duration of a worker loop.
struct WorkerScope {
    previous: Option<(Handle, usize)>,
}

impl WorkerScope {
    fn enter(handle: Handle, worker: usize) -> Self {
        let previous = WORKER.with(|slot| slot.borrow_mut().replace((handle, worker)));
        WorkerScope { previous }
    }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        WORKER.with(|slot| *slot.borrow_mut() = previous);
    }
}

fn pin_to_core(worker: usize) {
    if let Some(core_ids) = core_affinity::get_core_ids() {
        if let Some(core) = core_ids.get(worker) {
            if !core_affinity::set_for_current(*core) {
                tracing::debug!(worker, "failed to pin worker to core");
            }
        }
    }
}

fn run(shared: Arc<Shared>, worker: usize) {
    if shared.pin_workers {
        pin_to_core(worker);
    }
    let _scope = WorkerScope::enter(Handle(shared.clone()), worker);
    // Workers always switch back to their thread's main fiber.
    let _main = context::main_fiber();
    let mut pool = FiberPool::new(shared.fiber_pool_capacity, 0);

    tracing::debug!(scheduler = %shared.name, worker, "worker started");
    loop {
        match shared.next(worker) {
            Next::Run(entry) => {
                shared.execute(entry, worker, &mut pool);
                shared.active.fetch_sub(1, Ordering::AcqRel);
            }
            Next::Idle => shared.park.idle(),
            Next::Exit => break,
        }
    }
    tracing::debug!(scheduler = %shared.name, worker, "worker stopped");
}

/// A cheap, clonable handle for submitting work to a scheduler.
#[derive(Clone)]
pub struct Handle(Arc<Shared>);

impl Handle {
    /// The scheduler whose worker loop is running on this thread, if any.
    pub fn current() -> Option<Handle> {
        WORKER.with(|slot| slot.borrow().as_ref().map(|(handle, _)| handle.clone()))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn worker_count(&self) -> usize {
        self.0.worker_count
    }

    pub fn state(&self) -> SchedulerState {
        self.0.state()
    }

    /// Queues `task` and wakes a worker if the queue was empty.
    pub fn schedule<T: Into<Task>>(&self, task: T, affinity: Affinity) -> Result<()> {
        self.0.check_affinity(affinity)?;
        let task = task.into();
        task.check_schedulable()?;
        self.0.push(ScheduledTask { task, affinity });
        Ok(())
    }

    /// Queues a closure that any worker may run.
    pub fn schedule_fn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::callback(f), Affinity::Any)
    }

    /// Queues every task under one lock acquisition, waking at most one worker.
    ///
    /// Nothing is queued if any task is rejected.
    pub fn schedule_batch<I>(&self, tasks: I, affinity: Affinity) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        self.0.check_affinity(affinity)?;
        let tasks: Vec<Task> = tasks.into_iter().map(Into::into).collect();
        for task in &tasks {
            task.check_schedulable()?;
        }
        let need_tickle = {
            let mut queue = self.0.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(tasks.into_iter().map(|task| ScheduledTask { task, affinity }));
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.0.park.tickle();
        }
        Ok(())
    }

    /// Number of queued tasks, fibers waiting to be resumed included.
    pub fn pending(&self) -> usize {
        self.0.queue.lock().len()
    }

    fn is(&self, shared: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.0, shared)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.0.name)
            .field("state", &self.0.state())
            .finish()
    }
}

/// Owns the worker threads of a scheduler.
///
/// `Stopped -> Running -> Stopping -> Stopped`. [`Scheduler::stop`] lets the
/// workers drain every task still eligible for them before joining them.
pub struct Scheduler {
    shared: Arc<Shared>,
    use_caller: bool,
    caller: ThreadId,
    threads: Mutex<Vec<Thread>>,
}

impl Scheduler {
    /// Creates a stopped scheduler with `workers` logical workers.
    ///
    /// With `use_caller`, the constructing thread is worker 0 and runs its
    /// loop from inside [`Scheduler::stop`]; only `workers - 1` threads are
    /// spawned.
    pub fn new(workers: usize, use_caller: bool, name: &str) -> Result<Scheduler> {
        Scheduler::new_with_config(SchedulerConfig {
            workers,
            use_caller,
            name: name.to_string(),
            ..SchedulerConfig::default()
        })
    }

    /// Creates a scheduler whose idle workers sleep on a condition variable.
    pub fn new_with_config(config: SchedulerConfig) -> Result<Scheduler> {
        Scheduler::new_with_park(config, Box::new(CondvarPark::from_config()))
    }

    /// Creates a scheduler with a custom idle and wake strategy.
    pub fn new_with_park(config: SchedulerConfig, park: Box<dyn Park>) -> Result<Scheduler> {
        if config.workers == 0 {
            return Err(Error::NoWorkers);
        }
        let name = if config.name.is_empty() {
            SchedulerConfig::default().name
        } else {
            config.name
        };
        Ok(Scheduler {
            shared: Arc::new(Shared {
                name,
                worker_count: config.workers,
                queue: Mutex::new(VecDeque::new()),
                state: AtomicU8::new(SchedulerState::Stopped as u8),
                active: AtomicUsize::new(0),
                park,
                pin_workers: config.pin_workers,
                fiber_pool_capacity: config.fiber_pool_capacity,
            }),
            use_caller: config.use_caller,
            caller: std::thread::current().id(),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    pub fn uses_caller(&self) -> bool {
        self.use_caller
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    pub fn handle(&self) -> Handle {
        Handle(self.shared.clone())
    }

    /// Spawns the worker threads.
    ///
    /// If a spawn fails, the workers already started are stopped and joined
    /// and the error is returned.
    pub fn start(&self) -> Result<()> {
        self.shared
            .transition(SchedulerState::Stopped, SchedulerState::Running)?;

        let first = usize::from(self.use_caller);
        let mut threads = self.threads.lock();
        for worker in first..self.shared.worker_count {
            let shared = self.shared.clone();
            let name = format!("{}_{}", self.shared.name, worker);
            match Thread::new(move || run(shared, worker), &name) {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    drop(threads);
                    Logger::system().error(format_args!(
                        "scheduler `{}` failed to start worker {worker}: {err}",
                        self.shared.name
                    ));
                    self.shared.set_state(SchedulerState::Stopping);
                    self.shared.park.tickle_all();
                    let _ = self.join_workers();
                    self.shared.set_state(SchedulerState::Stopped);
                    return Err(err);
                }
            }
        }
        drop(threads);

        Logger::system().info(format_args!(
            "scheduler `{}` started with {} workers",
            self.shared.name, self.shared.worker_count
        ));
        Ok(())
    }

    /// Drains the queue and joins every worker.
    ///
    /// With `use_caller` this must be called from the constructing thread,
    /// which runs worker 0's loop until the queue is drained. Stopping a
    /// stopped scheduler is a no-op.
    pub fn stop(&self) -> Result<()> {
        if self.use_caller && std::thread::current().id() != self.caller {
            return Err(Error::ForeignStop {
                name: self.shared.name.clone(),
            });
        }
        if Handle::current().is_some_and(|handle| handle.is(&self.shared)) {
            fatal!("scheduler `{}` stopped from one of its own workers", self.shared.name);
        }
        match self
            .shared
            .transition(SchedulerState::Running, SchedulerState::Stopping)
        {
            Ok(()) => {}
            Err(Error::InvalidState {
                actual: SchedulerState::Stopped,
                ..
            }) => return Ok(()),
            Err(err) => return Err(err),
        }

        self.shared.park.tickle_all();
        if self.use_caller {
            run(self.shared.clone(), 0);
        }
        let joined = self.join_workers();
        self.shared.set_state(SchedulerState::Stopped);

        let leftover = self.shared.queue.lock().len();
        if leftover > 0 {
            Logger::system().warn(format_args!(
                "scheduler `{}` stopped with {leftover} tasks still queued",
                self.shared.name
            ));
        }
        Logger::system().info(format_args!("scheduler `{}` stopped", self.shared.name));
        joined
    }

    /// Joins every spawned worker, returning the first failure.
    fn join_workers(&self) -> Result<()> {
        let threads: Vec<Thread> = self.threads.lock().drain(..).collect();
        let mut first_error = None;
        for mut thread in threads {
            if let Err(err) = thread.join() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn schedule<T: Into<Task>>(&self, task: T, affinity: Affinity) -> Result<()> {
        self.handle().schedule(task, affinity)
    }

    pub fn schedule_fn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().schedule_fn(f)
    }

    pub fn schedule_batch<I>(&self, tasks: I, affinity: Affinity) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        self.handle().schedule_batch(tasks, affinity)
    }

    pub fn pending(&self) -> usize {
        self.handle().pending()
    }

    /// The scheduler whose worker loop is running on this thread, if any.
    pub fn current() -> Option<Handle> {
        Handle::current()
    }

    /// Index of the worker running on this thread, if any.
    pub fn current_worker() -> Option<usize> {
        WORKER.with(|slot| slot.borrow().as_ref().map(|(_, worker)| *worker))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.state() == SchedulerState::Stopped {
            return;
        }
        Logger::system().error(format_args!(
            "scheduler `{}` dropped while {:?}",
            self.shared.name,
            self.state()
        ));
        if let Err(err) = self.stop() {
            Logger::system().error(format_args!(
                "scheduler `{}` did not stop cleanly: {err}",
                self.shared.name
            ));
            self.shared.set_state(SchedulerState::Stopping);
            self.shared.park.tickle_all();
            let _ = self.join_workers();
            self.shared.set_state(SchedulerState::Stopped);
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.shared.name)
            .field("workers", &self.shared.worker_count)
            .field("use_caller", &self.use_caller)
            .field("state", &self.state())
            .finish()
    }
}
