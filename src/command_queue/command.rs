//! # Command Core Types
//!
//! This module defines the unit of work moved through a [`CommandQueue`](super::CommandQueue)
//! and the entry that carries it from the producer to exactly one consumer.
//!
//! ## Core Components
//! - `Command`: A type-erased unit of work with a single `execute()` operation
//! - `LambdaCommand`: Adapts any `FnOnce() + Send` closure to the `Command` trait
//! - `QueueEntry`: The boxed command plus a small header (payload size, blocking flag)
//!
//! ## Entry Lifecycle
//! 1. The producer boxes the command into a `QueueEntry` while holding the queue lock
//! 2. The entry is appended to the back of the FIFO
//! 3. A consumer pops it from the front and calls `QueueEntry::run()` without the lock
//! 4. `run()` executes the command, drops it, then signals a waiting producer (if any)

use std::{fmt, mem::size_of_val, sync::mpsc::SyncSender};

/// A unit of work that can be queued onto a command queue.
///
/// Commands are the payload of the queue. They are executed exactly once, on
/// exactly one consumer, and dropped by that same consumer right after
/// `execute()` returns.
///
/// # Implementation Guidelines
/// - Must be `Send` to be transferred to the consumer thread
/// - Should own everything it touches; state shared with the producer must be
///   synchronized by the caller
/// - There is no result channel back to the producer and no cancellation hook
///
/// # Example
/// ```rust
/// use command_queue::Command;
///
/// struct Flip(std::sync::Arc<std::sync::atomic::AtomicBool>);
///
/// impl Command for Flip {
///     fn execute(&mut self) {
///         self.0.fetch_xor(true, std::sync::atomic::Ordering::SeqCst);
///     }
/// }
/// ```
pub trait Command: Send {
    /// Performs the work. Called once by the consumer that dequeued the entry.
    fn execute(&mut self);
}

/// Wraps a closure so it can be queued as a [`Command`].
///
/// The closure is consumed by the first call to `execute()`; later calls are
/// no-ops, which can only happen if the wrapper is driven by hand.
pub struct LambdaCommand<F>
where
    F: FnOnce() + Send,
{
    callable: Option<F>,
}

impl<F> LambdaCommand<F>
where
    F: FnOnce() + Send,
{
    /// Creates a new command from the given closure.
    pub fn new(callable: F) -> Self {
        Self {
            callable: Some(callable),
        }
    }
}

impl<F> Command for LambdaCommand<F>
where
    F: FnOnce() + Send,
{
    fn execute(&mut self) {
        if let Some(callable) = self.callable.take() {
            callable();
        }
    }
}

/// A queued command together with its header.
///
/// Ownership moves from the producer to whichever consumer dequeues the entry.
/// The consumer runs and releases it; the producer never touches it again.
pub(crate) struct QueueEntry {
    command: Box<dyn Command>,
    payload_size: usize,
    completion: Option<SyncSender<()>>,
}

impl QueueEntry {
    /// Boxes `command` into a new entry.
    ///
    /// # Arguments
    /// * `command` - The command to carry
    /// * `completion` - Signalled after the command ran, for blocking calls
    pub(crate) fn new<C: Command + 'static>(command: C, completion: Option<SyncSender<()>>) -> Self {
        let command: Box<dyn Command> = Box::new(command);
        let payload_size = size_of_val(&*command);

        Self {
            command,
            payload_size,
            completion,
        }
    }

    /// Size in bytes of the type-erased command payload.
    pub(crate) fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Whether a producer is waiting for this entry to complete.
    pub(crate) fn is_blocking(&self) -> bool {
        self.completion.is_some()
    }

    /// Executes the command, releases it, and then wakes a blocked producer.
    ///
    /// The command is dropped before the completion signal is sent, so a
    /// blocking producer observes both `execute()` and the destructor as done.
    /// If `execute()` panics, the sender is dropped during unwinding and the
    /// producer sees a disconnected channel instead of a completion.
    pub(crate) fn run(self) {
        let QueueEntry {
            mut command,
            completion,
            ..
        } = self;

        command.execute();
        drop(command);

        if let Some(completion) = completion {
            // The producer may already be gone if it panicked while waiting.
            let _ = completion.send(());
        }
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("payload_size", &self.payload_size)
            .field("is_blocking", &self.is_blocking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::sync_channel,
        Arc,
    };

    struct DropCounter {
        executed: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    impl Command for DropCounter {
        fn execute(&mut self) {
            self.executed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_lambda_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let mut command = LambdaCommand::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        command.execute();
        command.execute();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_entry_executes_then_drops() {
        let executed = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let entry = QueueEntry::new(
            DropCounter {
                executed: executed.clone(),
                dropped: dropped.clone(),
            },
            None,
        );

        assert!(!entry.is_blocking());
        entry.run();
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_sent_after_drop() {
        let executed = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = sync_channel(1);
        let entry = QueueEntry::new(
            DropCounter {
                executed: executed.clone(),
                dropped: dropped.clone(),
            },
            Some(tx),
        );

        assert!(entry.is_blocking());
        entry.run();
        assert!(rx.recv().is_ok());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_payload_size_tracks_capture() {
        let big = [0u8; 64];
        let entry = QueueEntry::new(
            LambdaCommand::new(move || {
                let _ = big.len();
            }),
            None,
        );
        assert!(entry.payload_size() >= 64);
    }
}
