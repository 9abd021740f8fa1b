//! # Command Queue
//!
//! This module moves units of work from a producer thread (usually the main or
//! game thread) onto consumers: a set of dedicated worker threads, a shared
//! thread pool, or nobody at all, in which case commands run synchronously on
//! the producer.
//!
//! ## Architecture Overview
//!
//! - `CommandQueue`: Owns the FIFO, the consumers and the pause/shutdown logic
//! - `Command`: A unit of work with a single `execute()` operation
//! - `WorkerThread`: A dedicated consumer thread owned by the queue
//! - `ThreadPoolTask`: A reusable adapter submitted to a shared pool
//! - `QueueHandle`: A cheap, cloneable producer handle for other threads
//!
//! ## Consumption Modes
//!
//! Exactly one mode is chosen by initialization and kept until shutdown:
//! - **Dedicated workers**: `initialize(capacity, n)` with `n > 0` spawns `n`
//!   named threads that sleep while the queue is empty
//! - **Shared pool**: `initialize_with_pool(pool, capacity, yield)` submits up
//!   to one adapter per pool worker, never more
//! - **Manual**: `initialize(capacity, 0)` queues commands until the owner
//!   pumps them with `execute_queued_commands()`
//! - **Disabled**: capacity `0` executes every command on the caller before the
//!   enqueue returns
//!
//! ## Guarantees
//! - Commands execute in enqueue order (total order across producers)
//! - Every command is executed and dropped exactly once, by one consumer
//! - `queue_blocking_command` returns only after the command has run
//! - Between `pause_workers()` and `resume_workers()` no queued command starts,
//!   except ones the pausing thread pumps itself
//! - `exit_workers()` and `Drop` return only once the queue is empty
//!
//! ## Example Usage
//! ```rust
//! use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
//! use command_queue::CommandQueue;
//!
//! let mut queue = CommandQueue::new();
//! queue.initialize(256, 1).unwrap();
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..10 {
//!     let counter = counter.clone();
//!     queue.queue_lambda_command(move || {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     });
//! }
//!
//! // Frame boundary: wait for the worker to go idle and hold it there.
//! queue.pause_workers();
//! assert_eq!(counter.load(Ordering::SeqCst), 10);
//! queue.resume_workers();
//! ```

pub mod command;
pub mod config;
pub mod error;
mod state;
pub mod thread_pool_task;
pub mod worker_thread;

use std::{
    fmt,
    marker::PhantomData,
    sync::{
        mpsc::{sync_channel, RecvTimeoutError},
        Arc,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use log::{info, warn};

use crate::thread_pool::SharedThreadPool;
use command::{Command, LambdaCommand, QueueEntry};
use config::CommandQueueConfig;
use error::InitError;
use state::{run_entry, Dispatch, Mode, PoolBinding, Shared};
use thread_pool_task::ThreadPoolTask;
use worker_thread::WorkerThread;

/// How often a blocking caller checks whether the last worker has died while
/// it was waiting.
const WORKER_CHECK_INTERVAL: Duration = Duration::from_millis(10);

pub use state::QueueStats;

/// A cross-thread command queue.
///
/// The queue starts out inert: until it is initialized, commands run on the
/// caller like a disabled queue. Initialization picks the consumption mode and
/// records the calling thread as the creator thread, the only thread allowed to
/// issue blocking commands.
///
/// # Thread Safety
/// - All `queue_*`, pause and drain methods take `&self`; share the queue
///   behind an `Arc` or hand out [`QueueHandle`]s to other producers
/// - Commands run without the queue lock held, so a command may enqueue more
///   commands onto its own queue
/// - The queue does not protect state a command shares with its producer
pub struct CommandQueue {
    name: String,
    capacity: usize,
    shared: Arc<Shared>,
    workers: Vec<WorkerThread>,
    pool_tasks: usize,
    creator: Option<ThreadId>,
}

impl CommandQueue {
    /// Creates an inert queue with the default name.
    pub fn new() -> Self {
        Self::named(CommandQueueConfig::default().name)
    }

    /// Creates an inert queue whose workers and log lines use `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: 0,
            shared: Arc::new(Shared::new()),
            workers: Vec::new(),
            pool_tasks: 0,
            creator: None,
        }
    }

    /// Initializes the queue with its own worker threads.
    ///
    /// # Arguments
    /// * `capacity` - `0` disables the queue; otherwise the number of entries
    ///   reserved up front
    /// * `workers` - Number of dedicated threads; `0` means the owner pumps the
    ///   queue with [`execute_queued_commands`](Self::execute_queued_commands)
    ///
    /// # Errors
    /// - [`InitError::AlreadyInitialized`] if the queue was initialized before
    /// - [`InitError::WorkerSpawn`] if a thread could not be started; threads
    ///   started by this call are stopped and the queue stays inert
    pub fn initialize(&mut self, capacity: usize, workers: usize) -> Result<(), InitError> {
        let config = CommandQueueConfig {
            name: self.name.clone(),
            capacity,
            workers,
            stack_size: None,
        };
        self.initialize_with_config(&config)
    }

    /// Initializes the queue from a [`CommandQueueConfig`].
    ///
    /// Same as [`initialize`](Self::initialize), but also takes the queue name
    /// and the worker stack size from the configuration.
    pub fn initialize_with_config(&mut self, config: &CommandQueueConfig) -> Result<(), InitError> {
        let mut state = self.shared.lock();
        if state.mode != Mode::Inert {
            return Err(InitError::AlreadyInitialized);
        }

        self.name = config.name.clone();
        self.capacity = config.capacity;
        self.creator = Some(thread::current().id());

        if config.capacity == 0 {
            state.mode = Mode::Disabled;
            info!("Command queue '{}' disabled, commands run inline", self.name);
            return Ok(());
        }

        state.reserve(config.capacity);
        if config.workers == 0 {
            state.mode = Mode::Manual;
            info!(
                "Command queue '{}' initialized without consumers (capacity {})",
                self.name, config.capacity
            );
            return Ok(());
        }

        state.mode = Mode::Workers {
            count: config.workers,
        };
        drop(state);

        self.workers.reserve(config.workers);
        for index in 0..config.workers {
            match WorkerThread::spawn(self.shared.clone(), &self.name, index, config.stack_size) {
                Ok(worker) => self.workers.push(worker),
                Err(source) => {
                    self.teardown_workers();
                    self.shared.lock().mode = Mode::Inert;
                    self.creator = None;
                    return Err(InitError::WorkerSpawn { index, source });
                }
            }
        }

        info!(
            "Command queue '{}' initialized with {} workers (capacity {})",
            self.name, config.workers, config.capacity
        );
        Ok(())
    }

    /// Initializes the queue to run on an externally owned thread pool.
    ///
    /// One [`ThreadPoolTask`] is created per pool worker. At most that many are
    /// ever submitted at once.
    ///
    /// # Arguments
    /// * `pool` - The shared pool; the queue keeps a reference to it
    /// * `capacity` - `0` disables the queue and ignores the pool
    /// * `yield_to_other_jobs` - Whether a draining task gives its pool thread
    ///   back when other jobs are waiting
    ///
    /// # Errors
    /// - [`InitError::AlreadyInitialized`] if the queue was initialized before
    /// - [`InitError::EmptyPool`] if the pool has no workers
    pub fn initialize_with_pool(
        &mut self,
        pool: Arc<dyn SharedThreadPool>,
        capacity: usize,
        yield_to_other_jobs: bool,
    ) -> Result<(), InitError> {
        let mut state = self.shared.lock();
        if state.mode != Mode::Inert {
            return Err(InitError::AlreadyInitialized);
        }

        if capacity == 0 {
            self.capacity = 0;
            self.creator = Some(thread::current().id());
            state.mode = Mode::Disabled;
            info!("Command queue '{}' disabled, commands run inline", self.name);
            return Ok(());
        }

        let worker_count = pool.worker_count();
        if worker_count == 0 {
            return Err(InitError::EmptyPool);
        }

        let tasks = (0..worker_count)
            .map(|slot| Arc::new(ThreadPoolTask::new(Arc::downgrade(&self.shared), slot)))
            .collect();
        let binding = PoolBinding {
            pool,
            tasks,
            yield_to_other_jobs,
        };
        if self.shared.pool.set(binding).is_err() {
            return Err(InitError::AlreadyInitialized);
        }

        state.reserve(capacity);
        state.set_task_slots(worker_count);
        state.mode = Mode::Pool;

        self.capacity = capacity;
        self.pool_tasks = worker_count;
        self.creator = Some(thread::current().id());
        info!(
            "Command queue '{}' initialized on a shared pool of {} workers (capacity {}, yield: {})",
            self.name, worker_count, capacity, yield_to_other_jobs
        );
        Ok(())
    }

    /// Queues a command without waiting for it.
    ///
    /// On a disabled, stopped or uninitialized queue the command runs on the
    /// calling thread before this returns.
    pub fn queue_command<C: Command + 'static>(&self, command: C) {
        dispatch(&self.shared, QueueEntry::new(command, None));
    }

    /// Queues a closure without waiting for it.
    pub fn queue_lambda_command<F>(&self, callable: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_command(LambdaCommand::new(callable));
    }

    /// Queues a command and waits until a consumer has executed and dropped it.
    ///
    /// Only the creator thread may issue blocking commands. If nothing else
    /// consumes the queue (manual mode, or every worker has died) or the
    /// caller holds the pause, the caller pumps the queue itself up to and
    /// including this command.
    ///
    /// # Panics
    /// Panics if the command panicked on its consumer.
    pub fn queue_blocking_command<C: Command + 'static>(&self, command: C) {
        debug_assert!(
            self.creator.map_or(true, |creator| creator == thread::current().id()),
            "blocking commands on '{}' may only be queued from the thread that initialized it",
            self.name
        );

        let (completion_tx, completion_rx) = sync_channel(1);
        match self.shared.enqueue(QueueEntry::new(command, Some(completion_tx))) {
            Dispatch::Inline(entry) => run_entry(entry),
            Dispatch::Queued { self_serve } => {
                if self_serve || self.is_paused_by_caller() {
                    self.shared.drain();
                }
                loop {
                    match completion_rx.recv_timeout(WORKER_CHECK_INTERVAL) {
                        Ok(()) => break,
                        Err(RecvTimeoutError::Disconnected) => panic!(
                            "blocking command on '{}' panicked before completing",
                            self.name
                        ),
                        Err(RecvTimeoutError::Timeout) => {
                            if self.shared.lock().workers_gone() {
                                self.shared.drain();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Queues a closure and waits until it has run.
    pub fn queue_blocking_lambda_command<F>(&self, callable: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_blocking_command(LambdaCommand::new(callable));
    }

    /// Waits until the queue is empty and no consumer is executing, then keeps
    /// every consumer from starting new commands until
    /// [`resume_workers`](Self::resume_workers).
    ///
    /// Without dedicated workers the calling thread drains the queue itself
    /// while it waits. Commands queued while paused are held. Pauses nest on
    /// the same thread; each needs its own resume.
    ///
    /// Must not be called from inside a command of this queue.
    pub fn pause_workers(&self) {
        self.shared.pause();
    }

    /// Releases one pause taken by [`pause_workers`](Self::pause_workers) on
    /// this thread.
    pub fn resume_workers(&self) {
        if !self.shared.resume() {
            warn!(
                "resume_workers on '{}' without a pause held by this thread",
                self.name
            );
        }
    }

    /// Pauses the workers until the returned guard is dropped.
    pub fn paused(&self) -> PausedWorkers<'_> {
        self.pause_workers();
        PausedWorkers {
            queue: self,
            _not_send: PhantomData,
        }
    }

    /// Executes queued commands on the calling thread until the queue is empty.
    ///
    /// If the queue is empty but other consumers are still busy, waits for them
    /// and checks again.
    ///
    /// # Returns
    /// `true` if at least one command ran on this thread, `false` if there was
    /// nothing to do
    pub fn execute_queued_commands(&self) -> bool {
        self.shared.drain()
    }

    /// Drains the queue, stops and joins every worker, and leaves the queue
    /// stopped. Commands queued afterwards run on the caller.
    ///
    /// A pause still held at this point is released first.
    pub fn exit_workers(&mut self) {
        let mode = self.shared.lock().mode;
        if matches!(mode, Mode::Inert | Mode::Stopped) {
            return;
        }

        if self.shared.force_resume() {
            warn!("Command queue '{}' shut down while paused", self.name);
        }

        self.shared.stop();

        let worker_count = self.workers.len();
        for worker in self.workers.drain(..) {
            worker.join();
        }
        self.shared.wait_for_tasks();

        info!(
            "Command queue '{}' stopped ({} workers joined)",
            self.name, worker_count
        );
    }

    /// Stops and joins workers started by a failed initialization.
    fn teardown_workers(&mut self) {
        self.shared.lock().exit = true;
        self.shared.wake_all_workers();
        for worker in self.workers.drain(..) {
            worker.join();
        }
        self.shared.lock().exit = false;
    }

    fn is_paused_by_caller(&self) -> bool {
        self.shared.lock().paused_by == Some(thread::current().id())
    }

    /// Returns a producer handle that can be moved to other threads.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: self.shared.clone(),
        }
    }

    /// Name used for worker threads and log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity passed at initialization.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether enqueued commands are handed to a consumer rather than run on
    /// the caller.
    pub fn is_enabled(&self) -> bool {
        !self.shared.lock().mode.is_inline()
    }

    /// Number of dedicated worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The dedicated worker at `index`, if any.
    pub fn worker(&self, index: usize) -> Option<&WorkerThread> {
        self.workers.get(index)
    }

    /// Number of pool task adapters, i.e. the admission cap in pool mode.
    pub fn pool_task_count(&self) -> usize {
        self.pool_tasks
    }

    /// Number of pool task adapters currently submitted or running.
    pub fn active_pool_tasks(&self) -> usize {
        self.shared.lock().active_tasks
    }

    /// Number of commands waiting to be executed.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending()
    }

    /// Total payload size of the commands waiting to be executed, in bytes.
    pub fn pending_bytes(&self) -> usize {
        self.shared.lock().pending_bytes()
    }

    /// Lifetime traffic counters.
    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shared.wait_for_tasks();
        self.exit_workers();

        let pending = self.shared.lock().pending();
        if !thread::panicking() {
            assert_eq!(
                pending, 0,
                "command queue '{}' dropped with {} pending commands",
                self.name, pending
            );
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("CommandQueue")
            .field("name", &self.name)
            .field("mode", &state.mode)
            .field("capacity", &self.capacity)
            .field("workers", &self.workers.len())
            .field("pending", &state.pending())
            .finish()
    }
}

/// Hands an entry to the queue, running it here if the queue doesn't consume.
fn dispatch(shared: &Shared, entry: QueueEntry) {
    if let Dispatch::Inline(entry) = shared.enqueue(entry) {
        run_entry(entry);
    }
}

/// A cloneable producer handle to a [`CommandQueue`].
///
/// Handles only queue fire-and-forget commands; blocking calls stay on the
/// creator thread. A handle that outlives its queue runs commands inline.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl QueueHandle {
    /// Queues a command without waiting for it.
    pub fn queue_command<C: Command + 'static>(&self, command: C) {
        dispatch(&self.shared, QueueEntry::new(command, None));
    }

    /// Queues a closure without waiting for it.
    pub fn queue_lambda_command<F>(&self, callable: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_command(LambdaCommand::new(callable));
    }

    /// Number of commands waiting to be executed.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending()
    }
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Keeps a queue's workers paused; resumes them on drop.
///
/// Returned by [`CommandQueue::paused`]. The pause belongs to the thread that
/// took it, so the guard cannot be sent elsewhere.
#[must_use = "the workers resume as soon as the guard is dropped"]
pub struct PausedWorkers<'a> {
    queue: &'a CommandQueue,
    _not_send: PhantomData<*const ()>,
}

impl PausedWorkers<'_> {
    /// Resumes the workers now.
    pub fn resume(self) {
        drop(self);
    }
}

impl Drop for PausedWorkers<'_> {
    fn drop(&mut self) {
        self.queue.resume_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    fn counter_command(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_inert_queue_runs_inline() {
        let queue = CommandQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.queue_lambda_command(counter_command(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!queue.is_enabled());
    }

    #[test]
    fn test_double_initialize_fails() {
        let mut queue = CommandQueue::new();
        queue.initialize(16, 0).unwrap();
        assert!(matches!(
            queue.initialize(16, 1),
            Err(InitError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_manual_queue_waits_for_pump() {
        let mut queue = CommandQueue::named("manual");
        queue.initialize(16, 0).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            queue.queue_lambda_command(counter_command(&counter));
        }
        assert_eq!(queue.pending_count(), 3);
        assert!(queue.pending_bytes() > 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(queue.execute_queued_commands());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!queue.execute_queued_commands());
    }

    #[test]
    fn test_manual_blocking_call_pumps_itself() {
        let mut queue = CommandQueue::new();
        queue.initialize(16, 0).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.queue_lambda_command(counter_command(&counter));
        queue.queue_blocking_lambda_command(counter_command(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_worker_accessors() {
        let mut queue = CommandQueue::named("accessors");
        queue.initialize(16, 2).unwrap();

        assert_eq!(queue.worker_count(), 2);
        assert_eq!(queue.worker(1).map(WorkerThread::name), Some("accessors-worker-1"));
        assert!(queue.worker(2).is_none());
        assert!(queue.is_enabled());
    }

    #[test]
    fn test_exit_workers_stops_queue() {
        let mut queue = CommandQueue::new();
        queue.initialize(16, 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            queue.queue_lambda_command(counter_command(&counter));
        }
        queue.exit_workers();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(queue.worker_count(), 0);
        assert!(!queue.is_enabled());

        // Stopped queues run commands on the caller.
        queue.queue_lambda_command(counter_command(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 51);
    }

    #[test]
    fn test_paused_guard_resumes_on_drop() {
        let mut queue = CommandQueue::new();
        queue.initialize(16, 1).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let _paused = queue.paused();
            let log = log.clone();
            queue.queue_lambda_command(move || log.lock().unwrap().push("ran"));
            assert_eq!(queue.pending_count(), 1);
        }

        queue.queue_blocking_lambda_command(|| {});
        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
    }

    #[test]
    fn test_paused_guard_resume_releases_pause() {
        let mut queue = CommandQueue::new();
        queue.initialize(16, 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let paused = queue.paused();
        queue.queue_lambda_command(counter_command(&counter));
        assert!(queue.is_paused_by_caller());
        paused.resume();
        assert!(!queue.is_paused_by_caller());

        queue.pause_workers();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        queue.resume_workers();
    }

    #[test]
    fn test_blocking_call_while_paused_pumps_itself() {
        let mut queue = CommandQueue::new();
        queue.initialize(16, 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.pause_workers();
        queue.queue_lambda_command(counter_command(&counter));
        queue.queue_blocking_lambda_command(counter_command(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        queue.resume_workers();
    }

    #[test]
    fn test_exit_releases_pause() {
        let mut queue = CommandQueue::new();
        queue.initialize(16, 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.pause_workers();
        queue.queue_lambda_command(counter_command(&counter));
        queue.exit_workers();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_count_traffic() {
        let mut queue = CommandQueue::new();
        queue.initialize(16, 0).unwrap();

        queue.queue_lambda_command(|| {});
        queue.queue_lambda_command(|| {});
        queue.queue_blocking_lambda_command(|| {});

        let stats = queue.stats();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.executed, 3);
        assert_eq!(stats.blocking_calls, 1);
        assert_eq!(stats.executed_inline, 0);
        assert!(stats.peak_pending >= 2);
    }
}
