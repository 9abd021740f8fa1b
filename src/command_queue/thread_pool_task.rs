//! # Thread Pool Task Adapter
//!
//! When a command queue is initialized against a shared thread pool it does not
//! own any threads. Instead it owns one `ThreadPoolTask` per pool worker and
//! submits an idle one to the pool whenever work arrives and fewer adapters
//! than the pool's worker count are active.
//!
//! A submitted adapter drains the queue cooperatively: it keeps dequeuing until
//! the queue is empty or, when the queue was set up to yield to other jobs,
//! until the pool reports contention. Yielding puts the adapter back at the end
//! of the pool's queue; it stays active so no pending entry is left without a
//! consumer.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use log::debug;

use super::state::{run_entry, ConsumerKind, Executing, QueueState, Shared};
use crate::thread_pool::PoolJob;

/// A reusable unit of pool work that drains one command queue.
pub struct ThreadPoolTask {
    queue: Weak<Shared>,
    slot: usize,
}

impl ThreadPoolTask {
    pub(crate) fn new(queue: Weak<Shared>, slot: usize) -> Self {
        Self { queue, slot }
    }

    /// Index of this adapter among its queue's adapters.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Dequeues and executes entries until the queue is empty, paused, or the
    /// pool asks for a yield.
    fn process_work(self: &Arc<Self>, shared: &Shared) {
        let Some(binding) = shared.pool.get() else {
            return;
        };

        let mut activation = Activation {
            shared,
            slot: self.slot,
            armed: true,
        };

        let mut ran_any = false;
        let mut state = shared.lock();
        loop {
            if ran_any
                && binding.yield_to_other_jobs
                && !state.is_empty()
                && binding.pool.should_yield()
            {
                drop(state);
                activation.armed = false;
                debug!("Pool task {} yielding to other jobs", self.slot);
                binding.pool.submit(self.clone());
                return;
            }

            let Some(entry) = state.pop(None) else {
                break;
            };

            let active = Executing::begin(shared, &mut state, ConsumerKind::Task);
            drop(state);
            run_entry(entry);
            ran_any = true;
            state = active.finish();
        }

        activation.release(&mut state);
    }
}

impl PoolJob for ThreadPoolTask {
    fn run(self: Arc<Self>) {
        // The queue waits for every adapter before it is dropped, so a dead
        // reference means the adapter was queued in a pool that outlived it.
        if let Some(shared) = self.queue.upgrade() {
            self.process_work(&shared);
        }
    }
}

impl fmt::Debug for ThreadPoolTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolTask")
            .field("slot", &self.slot)
            .finish()
    }
}

/// Keeps an adapter's slot marked active while it runs and frees it on exit,
/// including when a command unwinds through `process_work`.
struct Activation<'a> {
    shared: &'a Shared,
    slot: usize,
    armed: bool,
}

impl Activation<'_> {
    fn release(mut self, state: &mut QueueState) {
        self.armed = false;
        state.release_task_slot(self.slot);
        self.shared.notify_idle();
    }
}

impl Drop for Activation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.release_task_slot(self.slot);
            self.shared.notify_idle();
        }
    }
}
