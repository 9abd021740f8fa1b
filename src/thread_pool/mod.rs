//! # Shared Thread Pool
//!
//! This module defines the interface a command queue expects from an externally
//! owned thread pool, plus `TaskPool`, a fixed-size pool implementing it.
//!
//! ## Architecture Overview
//!
//! - `PoolJob`: A reusable unit of work that can be submitted many times
//! - `SharedThreadPool`: Submit a job, report the worker count, report whether
//!   jobs are waiting (so long-running jobs can yield)
//! - `TaskPool`: A pool of named OS threads, each fed by its own channel
//!
//! ## Job Distribution
//! 1. Jobs are submitted via `SharedThreadPool::submit()`
//! 2. The pool picks a worker channel round-robin, skipping workers that
//!    already have `MAX_JOBS_IN_FLIGHT` jobs
//! 3. If every worker is busy, the least loaded channel takes the job
//! 4. Workers run jobs in the order their channel received them
//!
//! ## Example Usage
//! ```rust
//! use std::sync::Arc;
//! use command_queue::{CommandQueue, TaskPool, TaskPoolConfig};
//!
//! let pool = Arc::new(TaskPool::new(&TaskPoolConfig::default()).unwrap());
//! let mut queue = CommandQueue::new();
//! queue.initialize_with_pool(pool, 64, true).unwrap();
//! queue.queue_lambda_command(|| println!("hello from the pool"));
//! ```

use std::{
    fmt, io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

/// A unit of work that a shared pool can run, possibly many times.
pub trait PoolJob: Send + Sync {
    /// Runs the job on a pool thread.
    fn run(self: Arc<Self>);
}

/// The interface a command queue needs from an external thread pool.
pub trait SharedThreadPool: Send + Sync {
    /// Number of threads the pool runs jobs on.
    fn worker_count(&self) -> usize;

    /// Schedules `job` to run on one of the pool's threads.
    fn submit(&self, job: Arc<dyn PoolJob>);

    /// Whether submitted jobs are waiting for a thread, i.e. a running job
    /// should give its thread back soon.
    fn should_yield(&self) -> bool;
}

/// Maximum number of jobs a worker channel takes before the pool looks for a
/// less busy worker.
pub const MAX_JOBS_IN_FLIGHT: usize = 1;

/// Configuration for a [`TaskPool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPoolConfig {
    /// Prefix for worker thread names.
    pub name: String,
    /// Number of worker threads; `0` uses the available parallelism.
    pub workers: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            name: "task-pool".to_string(),
            workers: 0,
        }
    }
}

/// A communication channel between submitters and one pool thread.
struct PoolChannel {
    job_sender: Sender<Arc<dyn PoolJob>>,
    num_jobs_in_flight: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

/// A fixed-size thread pool implementing [`SharedThreadPool`].
///
/// # Implementation Notes
/// - Each worker owns the receiving end of its own channel
/// - A panicking job is logged and does not take its worker down
/// - Dropping the pool closes every channel and joins the workers once they
///   have finished the jobs already sent to them
pub struct TaskPool {
    name: String,
    channels: Vec<PoolChannel>,
    current_channel: AtomicUsize,
    num_jobs_waiting: Arc<AtomicUsize>,
}

impl TaskPool {
    /// Creates a pool and starts its worker threads.
    ///
    /// # Arguments
    /// * `config` - Pool name and size
    ///
    /// # Returns
    /// The running pool, or the error from the first thread that failed to
    /// start. Threads started before the failure are joined before the error
    /// is returned.
    pub fn new(config: &TaskPoolConfig) -> io::Result<Self> {
        let parallelism = thread::available_parallelism().map_or(1, usize::from);
        info!("Available parallelism: {parallelism}");

        let num_workers = if config.workers == 0 {
            parallelism
        } else {
            config.workers
        };

        let num_jobs_waiting = Arc::new(AtomicUsize::new(0));
        let mut channels = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let (job_tx, job_rx) = channel::<Arc<dyn PoolJob>>();
            let num_jobs_in_flight = Arc::new(AtomicUsize::new(0));

            let in_flight = num_jobs_in_flight.clone();
            let waiting = num_jobs_waiting.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || run_jobs(job_rx, &in_flight, &waiting));
            let worker = match spawned {
                Ok(worker) => worker,
                Err(err) => {
                    error!("Task pool '{}' could not start worker {index}: {err}", config.name);
                    join_channels(&config.name, channels);
                    return Err(err);
                }
            };

            channels.push(PoolChannel {
                job_sender: job_tx,
                num_jobs_in_flight,
                worker: Some(worker),
            });
        }

        info!("Task pool '{}' started {num_workers} workers", config.name);

        Ok(Self {
            name: config.name.clone(),
            channels,
            current_channel: AtomicUsize::new(0),
            num_jobs_waiting,
        })
    }

    /// Finds the channel the next job should go to.
    ///
    /// Round-robin from the last used channel, skipping channels that already
    /// have `MAX_JOBS_IN_FLIGHT` jobs. If every channel is full, the least
    /// loaded one is returned.
    fn find_available_channel(&self) -> Option<usize> {
        if self.channels.is_empty() {
            return None;
        }

        let start_channel = self.current_channel.load(Ordering::Relaxed) % self.channels.len();
        let mut current = start_channel;
        loop {
            if self.channels[current]
                .num_jobs_in_flight
                .load(Ordering::Acquire)
                < MAX_JOBS_IN_FLIGHT
            {
                return Some(current);
            }
            current = (current + 1) % self.channels.len();
            if current == start_channel {
                break;
            }
        }

        self.channels
            .iter()
            .enumerate()
            .min_by_key(|(_, channel)| channel.num_jobs_in_flight.load(Ordering::Acquire))
            .map(|(index, _)| index)
    }

    /// Attempts to send a job to a specific worker channel.
    ///
    /// # Returns
    /// - `Ok(())` if the worker accepted the job
    /// - `Err(job)` if the worker is gone, handing the job back
    fn try_send_job(
        &self,
        job: Arc<dyn PoolJob>,
        channel_idx: usize,
    ) -> Result<(), Arc<dyn PoolJob>> {
        let channel = &self.channels[channel_idx];
        channel.num_jobs_in_flight.fetch_add(1, Ordering::AcqRel);
        self.num_jobs_waiting.fetch_add(1, Ordering::AcqRel);

        match channel.job_sender.send(job) {
            Ok(()) => Ok(()),
            Err(err) => {
                channel.num_jobs_in_flight.fetch_sub(1, Ordering::AcqRel);
                self.num_jobs_waiting.fetch_sub(1, Ordering::AcqRel);
                Err(err.0)
            }
        }
    }
}

impl SharedThreadPool for TaskPool {
    fn worker_count(&self) -> usize {
        self.channels.len()
    }

    fn submit(&self, job: Arc<dyn PoolJob>) {
        let Some(first) = self.find_available_channel() else {
            error!("Task pool '{}' has no workers, running job inline", self.name);
            job.run();
            return;
        };

        let mut job = job;
        let count = self.channels.len();
        for offset in 0..count {
            let channel_idx = (first + offset) % count;
            match self.try_send_job(job, channel_idx) {
                Ok(()) => {
                    self.current_channel
                        .store((channel_idx + 1) % count, Ordering::Relaxed);
                    return;
                }
                Err(returned) => job = returned,
            }
        }

        error!(
            "Every worker of task pool '{}' is gone, running job inline",
            self.name
        );
        job.run();
    }

    fn should_yield(&self) -> bool {
        self.num_jobs_waiting.load(Ordering::Acquire) > 0
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.name)
            .field("workers", &self.channels.len())
            .field("waiting", &self.num_jobs_waiting.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        join_channels(&self.name, std::mem::take(&mut self.channels));
        debug!("Task pool '{}' stopped", self.name);
    }
}

/// Closes every channel and joins the threads behind them.
fn join_channels(name: &str, channels: Vec<PoolChannel>) {
    let workers: Vec<_> = channels
        .into_iter()
        .filter_map(|mut channel| channel.worker.take())
        .collect();

    // The senders are gone now; workers exit after their backlog.
    let current = thread::current().id();
    for worker in workers {
        // The last reference can be released by a job on one of our own
        // threads, which then exits on its own.
        if worker.thread().id() == current {
            continue;
        }
        if worker.join().is_err() {
            error!("Task pool '{name}' worker panicked");
        }
    }
}

/// The pool worker loop.
fn run_jobs(
    job_receiver: Receiver<Arc<dyn PoolJob>>,
    num_jobs_in_flight: &AtomicUsize,
    num_jobs_waiting: &AtomicUsize,
) {
    while let Ok(job) = job_receiver.recv() {
        num_jobs_waiting.fetch_sub(1, Ordering::AcqRel);
        if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            error!(
                "Job panicked on {}",
                thread::current().name().unwrap_or("<unnamed>")
            );
        }
        num_jobs_in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc::sync_channel, Mutex};

    struct Record {
        hits: AtomicUsize,
        threads: Mutex<Vec<String>>,
    }

    impl PoolJob for Record {
        fn run(self: Arc<Self>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if let Some(name) = thread::current().name() {
                self.threads.lock().unwrap().push(name.to_string());
            }
        }
    }

    struct Panics;

    impl PoolJob for Panics {
        fn run(self: Arc<Self>) {
            panic!("job failed");
        }
    }

    struct Notify(Mutex<Option<std::sync::mpsc::SyncSender<()>>>);

    impl PoolJob for Notify {
        fn run(self: Arc<Self>) {
            if let Some(tx) = self.0.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    }

    fn pool(workers: usize) -> TaskPool {
        TaskPool::new(&TaskPoolConfig {
            name: "test-pool".to_string(),
            workers,
        })
        .unwrap()
    }

    #[test]
    fn test_worker_count_matches_config() {
        assert_eq!(pool(3).worker_count(), 3);
    }

    #[test]
    fn test_zero_workers_uses_parallelism() {
        let pool = TaskPool::new(&TaskPoolConfig::default()).unwrap();
        assert!(pool.worker_count() >= 1);
    }

    #[test]
    fn test_jobs_run_on_pool_threads() {
        let record = Arc::new(Record {
            hits: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        });

        {
            let pool = pool(2);
            for _ in 0..10 {
                pool.submit(record.clone());
            }
        }

        assert_eq!(record.hits.load(Ordering::SeqCst), 10);
        assert!(record
            .threads
            .lock()
            .unwrap()
            .iter()
            .all(|name| name.starts_with("test-pool-")));
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let pool = pool(1);
        pool.submit(Arc::new(Panics));

        let (tx, rx) = sync_channel(1);
        pool.submit(Arc::new(Notify(Mutex::new(Some(tx)))));
        assert!(rx.recv().is_ok());
    }

    #[test]
    fn test_join_channels_waits_for_started_threads() {
        let record = Arc::new(Record {
            hits: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        });
        let waiting = Arc::new(AtomicUsize::new(0));
        let mut channels = Vec::new();

        for _ in 0..2 {
            let (job_tx, job_rx) = channel::<Arc<dyn PoolJob>>();
            let num_jobs_in_flight = Arc::new(AtomicUsize::new(1));
            let in_flight = num_jobs_in_flight.clone();
            let worker_waiting = waiting.clone();
            let worker = thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(20));
                run_jobs(job_rx, &in_flight, &worker_waiting);
            });

            waiting.fetch_add(1, Ordering::AcqRel);
            job_tx.send(record.clone()).unwrap();
            channels.push(PoolChannel {
                job_sender: job_tx,
                num_jobs_in_flight,
                worker: Some(worker),
            });
        }

        join_channels("partial", channels);
        assert_eq!(record.hits.load(Ordering::SeqCst), 2);
        assert_eq!(waiting.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_should_yield_reports_backlog() {
        let pool = pool(1);
        let (gate_tx, gate_rx) = sync_channel::<()>(0);
        let gate_rx = Mutex::new(Some(gate_rx));

        struct Gate(Mutex<Option<std::sync::mpsc::Receiver<()>>>);
        impl PoolJob for Gate {
            fn run(self: Arc<Self>) {
                if let Some(rx) = self.0.lock().unwrap().take() {
                    let _ = rx.recv();
                }
            }
        }

        pool.submit(Arc::new(Gate(gate_rx)));
        pool.submit(Arc::new(Gate(Mutex::new(None))));
        assert!(pool.should_yield());

        gate_tx.send(()).unwrap();
        drop(pool);
    }
}
