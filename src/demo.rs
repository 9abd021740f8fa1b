//! # Demo Harness
//!
//! Drives command queues the way an engine frame loop would and logs what
//! happened. Three scenarios run back to back:
//!
//! 1. **Frame loop**: a dedicated-worker queue receives simulated render
//!    commands every frame; at the end of each frame the main thread pauses
//!    the workers, flips the shared frame buffers and resumes them
//! 2. **Pool burst**: a queue running on a shared `TaskPool` absorbs a burst of
//!    commands, then a blocking command acts as a fence
//! 3. **Disabled**: a capacity-0 queue runs every command on the caller

use std::{
    hint::black_box,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use log::{error, info};
use web_time::Instant;

use crate::{
    command_queue::{config::CommandQueueConfig, error::InitError, CommandQueue},
    thread_pool::{TaskPool, TaskPoolConfig},
    Command,
};

const FRAME_COUNT: usize = 8;
const COMMANDS_PER_FRAME: usize = 64;
const POOL_BURST: usize = 1000;

/// Double-buffered frame data written by commands and flipped by the main
/// thread while the workers are paused.
#[derive(Default)]
struct FrameBuffers {
    back: Vec<u64>,
    front: Vec<u64>,
}

/// Simulates a render command: burns a random amount of CPU and records its
/// result in the back buffer.
struct DrawCommand {
    id: u64,
    work: u32,
    buffers: Arc<Mutex<FrameBuffers>>,
}

impl Command for DrawCommand {
    fn execute(&mut self) {
        let mut acc = self.id;
        for i in 0..self.work {
            acc = black_box(acc.wrapping_mul(6364136223846793005).wrapping_add(u64::from(i)));
        }
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.back.push(acc);
        }
    }
}

/// Runs every scenario with the given queue configuration.
pub fn run(config: &CommandQueueConfig) {
    if let Err(err) = frame_loop(config) {
        error!("Frame loop scenario failed: {err}");
    }
    if let Err(err) = pool_burst(config.capacity) {
        error!("Pool scenario failed: {err}");
    }
    disabled_queue();
}

fn frame_loop(config: &CommandQueueConfig) -> Result<(), InitError> {
    let mut queue = CommandQueue::named(config.name.clone());
    queue.initialize_with_config(config)?;
    let buffers = Arc::new(Mutex::new(FrameBuffers::default()));

    for frame in 0..FRAME_COUNT {
        let start = Instant::now();
        for i in 0..COMMANDS_PER_FRAME {
            queue.queue_command(DrawCommand {
                id: (frame * COMMANDS_PER_FRAME + i) as u64,
                work: fastrand::u32(1_000..50_000),
                buffers: buffers.clone(),
            });
        }

        // Nothing queued can touch the buffers while they are flipped.
        let paused = queue.paused();
        let drawn = match buffers.lock() {
            Ok(mut buffers) => {
                let buffers = &mut *buffers;
                std::mem::swap(&mut buffers.front, &mut buffers.back);
                buffers.back.clear();
                buffers.front.len()
            }
            Err(_) => 0,
        };
        paused.resume();

        info!(
            "Frame {frame}: {drawn} draws in {:.2?} on {} workers",
            start.elapsed(),
            queue.worker_count()
        );
    }

    let stats = queue.stats();
    info!(
        "Frame loop done: {} queued, {} executed, peak backlog {}",
        stats.queued, stats.executed, stats.peak_pending
    );
    queue.exit_workers();
    Ok(())
}

fn pool_burst(capacity: usize) -> Result<(), InitError> {
    let pool = match TaskPool::new(&TaskPoolConfig::default()) {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            error!("Could not start task pool: {err}");
            return Ok(());
        }
    };

    let mut queue = CommandQueue::named("pool-demo");
    queue.initialize_with_pool(pool, capacity, true)?;

    let counter = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for _ in 0..POOL_BURST {
        let counter = counter.clone();
        let work = fastrand::u32(100..5_000);
        queue.queue_lambda_command(move || {
            let mut acc = 0u32;
            for i in 0..work {
                acc = black_box(acc.wrapping_add(i));
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    // FIFO start order: everything queued before the fence has started, and
    // pausing waits for whatever is still running.
    queue.queue_blocking_lambda_command(|| {});
    queue.pause_workers();
    info!(
        "Pool burst: {} of {POOL_BURST} commands in {:.2?} using at most {} tasks",
        counter.load(Ordering::SeqCst),
        start.elapsed(),
        queue.pool_task_count()
    );
    queue.resume_workers();
    Ok(())
}

fn disabled_queue() {
    let mut queue = CommandQueue::named("disabled-demo");
    if let Err(err) = queue.initialize(0, 4) {
        error!("Could not initialize disabled queue: {err}");
        return;
    }

    let caller = thread::current().id();
    let on_caller = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let on_caller = on_caller.clone();
        queue.queue_lambda_command(move || {
            if thread::current().id() == caller {
                on_caller.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    info!(
        "Disabled queue: {} of 100 commands ran on the caller, {} workers",
        on_caller.load(Ordering::SeqCst),
        queue.worker_count()
    );
}
