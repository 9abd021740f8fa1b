//! # Shared Queue State
//!
//! Everything the producer side and the consumer side of a command queue need
//! to agree on lives here, behind a single mutex:
//! - the FIFO of pending entries
//! - the consumption mode chosen at initialization
//! - live-worker, active-worker, active-task and executing counters
//! - the pause owner and its nesting depth
//! - the exit flag used by dedicated workers
//!
//! Two condition variables hang off the same mutex. `wake` is used to put
//! idle dedicated workers to sleep and wake them on enqueue; `idle` is
//! notified whenever a consumer stops executing, so pause and drain can wait on
//! "queue empty and nothing executing" instead of spinning.

use std::{
    cell::Cell,
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError},
    thread::{self, ThreadId},
};

use log::{debug, trace};

use super::{command::QueueEntry, thread_pool_task::ThreadPoolTask};
use crate::thread_pool::SharedThreadPool;

thread_local! {
    /// Number of queued commands currently executing on this thread.
    static COMMAND_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Returns true if the calling thread is inside a queued command's `execute()`.
pub(crate) fn in_command() -> bool {
    COMMAND_DEPTH.with(|depth| depth.get() > 0)
}

/// Runs an entry with the thread-local command depth raised.
pub(crate) fn run_entry(entry: QueueEntry) {
    struct DepthGuard;

    impl Drop for DepthGuard {
        fn drop(&mut self) {
            COMMAND_DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }

    COMMAND_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let _guard = DepthGuard;
    trace!(
        "Executing command ({} bytes, blocking: {})",
        entry.payload_size(),
        entry.is_blocking()
    );
    entry.run();
}

/// How queued entries reach a consumer. Fixed by initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Never initialized. Enqueues execute on the caller.
    Inert,
    /// Initialized with capacity 0. Enqueues execute on the caller.
    Disabled,
    /// No consumer of its own; pumped through `execute_queued_commands`.
    Manual,
    /// Consumed by `count` owned worker threads.
    Workers { count: usize },
    /// Consumed by task adapters submitted to a shared thread pool.
    Pool,
    /// Shut down by `exit_workers`. Enqueues execute on the caller.
    Stopped,
}

impl Mode {
    /// Whether entries are executed synchronously instead of being queued.
    pub(crate) fn is_inline(self) -> bool {
        matches!(self, Mode::Inert | Mode::Disabled | Mode::Stopped)
    }
}

/// Counters describing the lifetime traffic of a command queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Commands appended to the FIFO.
    pub queued: u64,
    /// Commands executed by a consumer after being dequeued.
    pub executed: u64,
    /// Commands executed synchronously on the producer because the queue was
    /// disabled, stopped or never initialized.
    pub executed_inline: u64,
    /// Blocking calls issued.
    pub blocking_calls: u64,
    /// Largest number of entries ever pending at once.
    pub peak_pending: usize,
}

/// Which kind of consumer is executing an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumerKind {
    Worker,
    Task,
    Drain,
}

/// The state guarded by the queue mutex.
pub(crate) struct QueueState {
    fifo: VecDeque<QueueEntry>,
    pub(crate) mode: Mode,
    pub(crate) exit: bool,
    pub(crate) live_workers: usize,
    pub(crate) active_workers: usize,
    pub(crate) active_tasks: usize,
    pub(crate) executing: usize,
    task_active: Vec<bool>,
    pub(crate) paused_by: Option<ThreadId>,
    pub(crate) pause_depth: usize,
    pending_bytes: usize,
    pub(crate) stats: QueueStats,
}

impl QueueState {
    fn new() -> Self {
        Self {
            fifo: VecDeque::new(),
            mode: Mode::Inert,
            exit: false,
            live_workers: 0,
            active_workers: 0,
            active_tasks: 0,
            executing: 0,
            task_active: Vec::new(),
            paused_by: None,
            pause_depth: 0,
            pending_bytes: 0,
            stats: QueueStats::default(),
        }
    }

    /// Reserves room for `capacity` entries up front.
    pub(crate) fn reserve(&mut self, capacity: usize) {
        self.fifo.reserve(capacity);
    }

    /// Prepares one inactive flag per pool adapter.
    pub(crate) fn set_task_slots(&mut self, count: usize) {
        self.task_active = vec![false; count];
        self.active_tasks = 0;
    }

    pub(crate) fn pending(&self) -> usize {
        self.fifo.len()
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    fn push(&mut self, entry: QueueEntry) {
        self.pending_bytes += entry.payload_size();
        self.fifo.push_back(entry);
        self.stats.queued += 1;
        self.stats.peak_pending = self.stats.peak_pending.max(self.fifo.len());
    }

    /// Whether `consumer` may take entries right now.
    ///
    /// While paused only the pausing thread may consume; background
    /// consumers pass `None`.
    fn may_consume(&self, consumer: Option<ThreadId>) -> bool {
        match self.paused_by {
            None => true,
            Some(owner) => consumer == Some(owner),
        }
    }

    /// Pops the front entry if `consumer` is allowed to consume.
    pub(crate) fn pop(&mut self, consumer: Option<ThreadId>) -> Option<QueueEntry> {
        if !self.may_consume(consumer) {
            return None;
        }
        let entry = self.fifo.pop_front()?;
        self.pending_bytes -= entry.payload_size();
        Some(entry)
    }

    /// Marks the first inactive pool adapter as active and returns its slot.
    ///
    /// Respects the admission cap: never more active adapters than slots.
    pub(crate) fn claim_task_slot(&mut self) -> Option<usize> {
        if self.mode != Mode::Pool
            || self.paused_by.is_some()
            || self.active_tasks >= self.task_active.len()
        {
            return None;
        }

        let slot = self.task_active.iter().position(|active| !active)?;
        self.task_active[slot] = true;
        self.active_tasks += 1;
        Some(slot)
    }

    /// Marks a pool adapter as inactive again.
    pub(crate) fn release_task_slot(&mut self, slot: usize) {
        debug_assert!(self.task_active[slot], "task slot {slot} released twice");
        self.task_active[slot] = false;
        self.active_tasks -= 1;
    }

    fn begin(&mut self, kind: ConsumerKind) {
        self.executing += 1;
        if kind == ConsumerKind::Worker {
            self.active_workers += 1;
        }
    }

    fn end(&mut self, kind: ConsumerKind) {
        self.executing -= 1;
        self.stats.executed += 1;
        if kind == ConsumerKind::Worker {
            self.active_workers -= 1;
        }
    }

    /// True once nothing is pending and no consumer is mid-execution.
    fn is_quiescent(&self) -> bool {
        self.fifo.is_empty() && self.executing == 0
    }

    /// Whether a thread waiting for the queue has to execute entries itself.
    ///
    /// Dedicated workers consume on their own for as long as one of them is
    /// alive. Once the last one has died, nobody else will.
    pub(crate) fn caller_drains(&self) -> bool {
        match self.mode {
            Mode::Workers { .. } => self.workers_gone(),
            _ => true,
        }
    }

    /// True in worker mode once every dedicated worker has died.
    pub(crate) fn workers_gone(&self) -> bool {
        matches!(self.mode, Mode::Workers { .. }) && self.live_workers == 0
    }
}

/// The pool a queue submits its task adapters to.
pub(crate) struct PoolBinding {
    pub(crate) pool: Arc<dyn SharedThreadPool>,
    pub(crate) tasks: Vec<Arc<ThreadPoolTask>>,
    pub(crate) yield_to_other_jobs: bool,
}

/// What `Shared::enqueue` did with an entry.
pub(crate) enum Dispatch {
    /// The queue is not consuming; the caller must run the entry itself.
    Inline(QueueEntry),
    /// The entry was appended to the FIFO. `self_serve` is set when no
    /// background consumer will pick it up.
    Queued { self_serve: bool },
}

/// State shared between a `CommandQueue`, its handles and its consumers.
pub(crate) struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
    pub(crate) pool: OnceLock<PoolBinding>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            wake: Condvar::new(),
            idle: Condvar::new(),
            pool: OnceLock::new(),
        }
    }

    /// Locks the queue state.
    ///
    /// Commands never run under this lock, so poisoning can only come from a
    /// bug in the queue itself; the guard is recovered rather than propagated.
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Puts a dedicated worker to sleep until the next wake-up.
    pub(crate) fn wait_for_work<'a>(
        &self,
        state: MutexGuard<'a, QueueState>,
    ) -> MutexGuard<'a, QueueState> {
        self.wake.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until some consumer finishes or the pause state changes.
    pub(crate) fn wait_for_idle<'a>(
        &self,
        state: MutexGuard<'a, QueueState>,
    ) -> MutexGuard<'a, QueueState> {
        self.idle.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake_all_workers(&self) {
        self.wake.notify_all();
    }

    pub(crate) fn notify_idle(&self) {
        self.idle.notify_all();
    }

    /// Appends `entry` to the FIFO and makes the scheduling decision.
    ///
    /// # Returns
    /// - `Dispatch::Inline(entry)` if the queue does not consume; the caller
    ///   executes the entry on its own thread
    /// - `Dispatch::Queued` otherwise
    pub(crate) fn enqueue(&self, entry: QueueEntry) -> Dispatch {
        let mut state = self.lock();
        if entry.is_blocking() {
            state.stats.blocking_calls += 1;
        }

        let mode = state.mode;
        if mode.is_inline() {
            state.stats.executed_inline += 1;
            return Dispatch::Inline(entry);
        }

        trace!(
            "Queued command ({} bytes, blocking: {}), {} pending",
            entry.payload_size(),
            entry.is_blocking(),
            state.pending() + 1
        );
        state.push(entry);

        // Pool adapters get submitted below; manual queues and queues whose
        // workers all died rely on the caller.
        let self_serve = mode != Mode::Pool && state.caller_drains();
        let mut claimed = None;
        match mode {
            Mode::Workers { count } => {
                if state.active_workers < count {
                    self.wake.notify_one();
                }
            }
            Mode::Pool => claimed = state.claim_task_slot(),
            _ => {}
        }

        // Someone may be draining or pausing and waiting for more work.
        self.idle.notify_all();
        drop(state);

        if let Some(slot) = claimed {
            self.submit_task(slot);
        }
        Dispatch::Queued { self_serve }
    }

    /// Hands the adapter in `slot` to the shared pool.
    pub(crate) fn submit_task(&self, slot: usize) {
        if let Some(binding) = self.pool.get() {
            debug!("Submitting pool task {slot}");
            binding.pool.submit(binding.tasks[slot].clone());
        }
    }

    /// Executes queued entries on the calling thread until none are left.
    ///
    /// If the FIFO is empty but a worker or pool task is still busy, waits for
    /// it to finish and looks again, since it may not be the last entry.
    ///
    /// # Returns
    /// `true` if at least one entry was executed by this call
    pub(crate) fn drain(&self) -> bool {
        let me = thread::current().id();
        // A command draining its own queue must not wait for itself.
        let nested = in_command();
        let mut ran = false;
        let mut state = self.lock();

        loop {
            if let Some(entry) = state.pop(Some(me)) {
                let active = Executing::begin(self, &mut state, ConsumerKind::Drain);
                drop(state);
                run_entry(entry);
                ran = true;
                state = active.finish();
                continue;
            }

            let others_busy = state.active_workers > 0 || state.active_tasks > 0;
            if state.is_empty() && others_busy && !nested {
                state = self.wait_for_idle(state);
                continue;
            }
            break;
        }
        ran
    }

    /// Waits until the queue is empty and nothing executes, then marks it
    /// paused by the calling thread. Re-entrant on the same thread.
    ///
    /// Without live dedicated workers the calling thread drains the queue
    /// itself while it waits.
    pub(crate) fn pause(&self) {
        self.quiesce(false);
    }

    /// Waits like [`pause`](Self::pause), then stops the queue in the same
    /// critical section. Later enqueues execute on their caller, so no entry
    /// can slip in between the last drain and the stop.
    pub(crate) fn stop(&self) {
        self.quiesce(true);
    }

    fn quiesce(&self, stop: bool) {
        let me = thread::current().id();
        let mut state = self.lock();

        loop {
            let owned = state.paused_by == Some(me);
            if owned && !stop {
                state.pause_depth += 1;
                return;
            }

            if owned || state.paused_by.is_none() {
                if state.is_quiescent() {
                    if stop {
                        state.exit = true;
                        state.mode = Mode::Stopped;
                        state.paused_by = None;
                        state.pause_depth = 0;
                        self.wake.notify_all();
                        self.idle.notify_all();
                        debug!("Queue stopped");
                    } else {
                        state.paused_by = Some(me);
                        state.pause_depth = 1;
                        debug!("Workers paused");
                    }
                    return;
                }

                if state.caller_drains() {
                    if let Some(entry) = state.pop(Some(me)) {
                        let active = Executing::begin(self, &mut state, ConsumerKind::Drain);
                        drop(state);
                        run_entry(entry);
                        state = active.finish();
                        continue;
                    }
                }
            }

            state = self.wait_for_idle(state);
        }
    }

    /// Releases one level of pause held by the calling thread.
    ///
    /// # Returns
    /// `false` if the calling thread did not hold the pause
    pub(crate) fn resume(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.lock();
        if state.paused_by != Some(me) {
            return false;
        }

        state.pause_depth -= 1;
        if state.pause_depth > 0 {
            return true;
        }

        state.paused_by = None;
        debug!("Workers resumed with {} pending", state.pending());
        let claimed = self.claim_for_pending(&mut state);
        self.wake.notify_all();
        self.idle.notify_all();
        drop(state);

        for slot in claimed {
            self.submit_task(slot);
        }
        true
    }

    /// Drops any pause, whoever holds it. Used on shutdown.
    ///
    /// # Returns
    /// `true` if a pause was released
    pub(crate) fn force_resume(&self) -> bool {
        let mut state = self.lock();
        if state.paused_by.is_none() {
            return false;
        }
        state.paused_by = None;
        state.pause_depth = 0;
        let claimed = self.claim_for_pending(&mut state);
        self.wake.notify_all();
        self.idle.notify_all();
        drop(state);

        for slot in claimed {
            self.submit_task(slot);
        }
        true
    }

    /// Claims as many idle pool adapters as there are pending entries, up to
    /// the admission cap.
    fn claim_for_pending(&self, state: &mut QueueState) -> Vec<usize> {
        let mut claimed = Vec::new();
        while claimed.len() < state.pending() {
            match state.claim_task_slot() {
                Some(slot) => claimed.push(slot),
                None => break,
            }
        }
        claimed
    }

    /// Waits until every submitted pool adapter has gone inactive.
    pub(crate) fn wait_for_tasks(&self) {
        let mut state = self.lock();
        while state.active_tasks > 0 {
            state = self.wait_for_idle(state);
        }
    }
}

/// Marks a consumer as executing an entry for as long as it lives.
///
/// `finish()` is the normal exit and hands back the relocked state. If the
/// command unwinds instead, `Drop` restores the counters so pause, drain and
/// shutdown do not wait on a consumer that no longer exists.
pub(crate) struct Executing<'a> {
    shared: &'a Shared,
    kind: ConsumerKind,
    armed: bool,
}

impl<'a> Executing<'a> {
    pub(crate) fn begin(shared: &'a Shared, state: &mut QueueState, kind: ConsumerKind) -> Self {
        state.begin(kind);
        Self {
            shared,
            kind,
            armed: true,
        }
    }

    pub(crate) fn finish(mut self) -> MutexGuard<'a, QueueState> {
        self.armed = false;
        let mut state = self.shared.lock();
        state.end(self.kind);
        if state.executing == 0 {
            self.shared.notify_idle();
        }
        state
    }
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.end(self.kind);
            self.shared.notify_idle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_queue::command::LambdaCommand;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(counter: &Arc<AtomicUsize>) -> QueueEntry {
        let counter = counter.clone();
        QueueEntry::new(
            LambdaCommand::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        )
    }

    #[test]
    fn test_inert_queue_dispatches_inline() {
        let shared = Shared::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(matches!(shared.enqueue(entry(&counter)), Dispatch::Inline(_)));
        assert_eq!(shared.lock().stats.executed_inline, 1);
    }

    #[test]
    fn test_manual_queue_drains_in_order() {
        let shared = Shared::new();
        shared.lock().mode = Mode::Manual;
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            let queued = QueueEntry::new(
                LambdaCommand::new(move || log.lock().unwrap().push(i)),
                None,
            );
            assert!(matches!(shared.enqueue(queued), Dispatch::Queued { .. }));
        }

        assert_eq!(shared.lock().pending(), 5);
        assert!(shared.drain());
        assert!(!shared.drain());
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(shared.lock().pending_bytes(), 0);
    }

    #[test]
    fn test_pause_blocks_other_consumers() {
        let shared = Shared::new();
        shared.lock().mode = Mode::Manual;
        let counter = Arc::new(AtomicUsize::new(0));

        shared.pause();
        shared.enqueue(entry(&counter));

        assert!(shared.lock().pop(None).is_none());

        assert!(shared.resume());
        assert!(shared.drain());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pause_is_reentrant() {
        let shared = Shared::new();
        shared.lock().mode = Mode::Manual;

        shared.pause();
        shared.pause();
        assert_eq!(shared.lock().pause_depth, 2);
        assert!(shared.resume());
        assert!(shared.lock().paused_by.is_some());
        assert!(shared.resume());
        assert!(shared.lock().paused_by.is_none());
        assert!(!shared.resume());
    }

    #[test]
    fn test_stop_drains_and_runs_later_enqueues_inline() {
        let shared = Shared::new();
        shared.lock().mode = Mode::Manual;
        let counter = Arc::new(AtomicUsize::new(0));

        shared.enqueue(entry(&counter));
        shared.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        {
            let state = shared.lock();
            assert_eq!(state.mode, Mode::Stopped);
            assert!(state.exit);
            assert!(state.paused_by.is_none());
        }

        assert!(matches!(shared.enqueue(entry(&counter)), Dispatch::Inline(_)));
        assert_eq!(shared.lock().pending(), 0);
    }

    #[test]
    fn test_workers_gone_only_in_worker_mode() {
        let mut state = QueueState::new();
        state.mode = Mode::Manual;
        assert!(!state.workers_gone());
        assert!(state.caller_drains());

        state.mode = Mode::Workers { count: 2 };
        state.live_workers = 1;
        assert!(!state.workers_gone());
        assert!(!state.caller_drains());

        state.live_workers = 0;
        assert!(state.workers_gone());
        assert!(state.caller_drains());
    }

    #[test]
    fn test_claim_respects_slot_count() {
        let mut state = QueueState::new();
        state.mode = Mode::Pool;
        state.set_task_slots(2);

        assert_eq!(state.claim_task_slot(), Some(0));
        assert_eq!(state.claim_task_slot(), Some(1));
        assert_eq!(state.claim_task_slot(), None);

        state.release_task_slot(0);
        assert_eq!(state.claim_task_slot(), Some(0));
        assert_eq!(state.active_tasks, 2);
    }

    #[test]
    fn test_executing_guard_restores_on_unwind() {
        let shared = Shared::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut state = shared.lock();
            let _active = Executing::begin(&shared, &mut state, ConsumerKind::Worker);
            drop(state);
            panic!("command failed");
        }));

        assert!(result.is_err());
        let state = shared.lock();
        assert_eq!(state.executing, 0);
        assert_eq!(state.active_workers, 0);
    }
}
