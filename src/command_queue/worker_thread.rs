//! Dedicated consumer threads owned by a command queue.

use std::{
    fmt, io,
    sync::Arc,
    thread::{self, JoinHandle, Thread, ThreadId},
};

use log::{debug, error, warn};

use super::state::{run_entry, ConsumerKind, Executing, Shared};

/// An OS thread that repeatedly dequeues and executes entries from its queue.
///
/// Worker threads are created by `CommandQueue::initialize` and joined by
/// `CommandQueue::exit_workers`. They hold no state of their own besides the
/// back-reference to the queue.
///
/// # Lifecycle
/// - **Active**: pops the front entry under the lock, then runs it unlocked
/// - **Sleeping**: the queue is empty (or paused); waits on the wake condition
/// - **Exited**: woke up with nothing to consume while the exit flag is set
///
/// A panic inside a command unwinds the worker thread. It is not respawned;
/// the queue keeps running on whatever consumers remain. Once no worker is
/// left, pause, blocking calls and shutdown execute pending entries on the
/// calling thread.
pub struct WorkerThread {
    index: usize,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawns a worker named `{queue_name}-worker-{index}`.
    ///
    /// # Arguments
    /// * `shared` - The queue state the worker consumes from
    /// * `queue_name` - Prefix for the OS thread name
    /// * `index` - Position of the worker in its queue
    /// * `stack_size` - Optional stack size override for the OS thread
    ///
    /// # Returns
    /// The running worker, or the I/O error reported by the OS
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        queue_name: &str,
        index: usize,
        stack_size: Option<usize>,
    ) -> io::Result<Self> {
        let name = format!("{queue_name}-worker-{index}");
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }

        shared.lock().live_workers += 1;
        let thread_shared = shared.clone();
        let handle = match builder.spawn(move || process_commands(&thread_shared)) {
            Ok(handle) => handle,
            Err(err) => {
                shared.lock().live_workers -= 1;
                return Err(err);
            }
        };

        Ok(Self {
            index,
            name,
            handle: Some(handle),
        })
    }

    /// Position of this worker in its queue.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Name of the underlying OS thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the underlying OS thread, until the worker is joined.
    pub fn thread(&self) -> Option<&Thread> {
        self.handle.as_ref().map(JoinHandle::thread)
    }

    /// Identifier of the underlying OS thread, until the worker is joined.
    pub fn id(&self) -> Option<ThreadId> {
        self.thread().map(Thread::id)
    }

    /// Whether the thread has returned, either by exiting or by panicking.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the thread to return.
    ///
    /// The caller must have set the exit flag and woken the workers first.
    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Worker {} stopped after a command panicked", self.name);
            }
        }
    }
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Counts a worker as alive until its thread returns or unwinds.
struct LiveWorker<'a>(&'a Shared);

impl Drop for LiveWorker<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.live_workers -= 1;
        if state.live_workers == 0 && !state.is_empty() {
            warn!("Last worker gone with {} commands pending", state.pending());
        }
        drop(state);
        self.0.notify_idle();
    }
}

/// The worker loop.
fn process_commands(shared: &Shared) {
    debug!(
        "Worker {} started",
        thread::current().name().unwrap_or("<unnamed>")
    );

    let _live = LiveWorker(shared);
    let mut state = shared.lock();
    loop {
        if let Some(entry) = state.pop(None) {
            let active = Executing::begin(shared, &mut state, ConsumerKind::Worker);
            drop(state);
            run_entry(entry);
            state = active.finish();
            continue;
        }

        if state.exit {
            break;
        }
        state = shared.wait_for_work(state);
    }
    drop(state);

    debug!(
        "Worker {} exiting",
        thread::current().name().unwrap_or("<unnamed>")
    );
}
