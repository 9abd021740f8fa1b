#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Command Queue
//!
//! A cross-thread command queue for real-time engines: the game thread queues
//! units of work and they run on dedicated worker threads, on a shared thread
//! pool, or synchronously when the queue is disabled.
//!
//! ## Key Modules
//!
//! * `command_queue` - The queue facade, commands, workers and pool adapters
//! * `thread_pool` - The shared thread pool interface and a fixed-size pool
//!
//! ## Usage
//!
//! ```rust
//! use command_queue::CommandQueue;
//!
//! let mut queue = CommandQueue::named("render");
//! queue.initialize(1024, 1).unwrap();
//! queue.queue_lambda_command(|| { /* upload a buffer */ });
//! queue.queue_blocking_lambda_command(|| { /* fence */ });
//! ```
//!
//! The `command-queue-demo` binary runs a small frame-loop harness:
//!
//! ```bash
//! RUST_LOG=debug cargo run --release -- queue.json
//! ```

use std::env;

use log::{error, info};

pub mod command_queue;
mod demo;
pub mod thread_pool;

pub use command_queue::{
    command::{Command, LambdaCommand},
    config::{CommandQueueConfig, DEFAULT_CAPACITY},
    error::{ConfigError, InitError},
    thread_pool_task::ThreadPoolTask,
    worker_thread::WorkerThread,
    CommandQueue, PausedWorkers, QueueHandle, QueueStats,
};
pub use thread_pool::{PoolJob, SharedThreadPool, TaskPool, TaskPoolConfig};

/// Runs the demo harness.
///
/// Logs to stdout, filtered by `RUST_LOG` (default `info`). The first command
/// line argument, if present, is a JSON [`CommandQueueConfig`] file.
pub fn run() {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .target(env_logger::Target::Stdout)
        .filter_level(log::LevelFilter::Info)
        .parse_env("RUST_LOG")
        .init();

    info!("Logger initialized");

    let config = match env::args().nth(1) {
        Some(path) => match CommandQueueConfig::from_json_file(&path) {
            Ok(config) => config,
            Err(err) => {
                error!("Could not load queue config from {path}: {err}");
                return;
            }
        },
        None => CommandQueueConfig::default(),
    };

    demo::run(&config);
}
