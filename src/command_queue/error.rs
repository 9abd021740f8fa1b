//! Errors reported by command queue setup.

use std::io;

use thiserror::Error;

/// Reasons a command queue could not be initialized.
#[derive(Debug, Error)]
pub enum InitError {
    /// `initialize*` was called on a queue that is already running.
    #[error("command queue is already initialized")]
    AlreadyInitialized,
    /// The OS refused to start a dedicated worker thread.
    #[error("failed to start worker thread {index}: {source}")]
    WorkerSpawn {
        /// Index of the worker that failed to start.
        index: usize,
        /// Error reported by the OS.
        #[source]
        source: io::Error,
    },
    /// The shared pool has no threads to run tasks on.
    #[error("shared thread pool reports no workers")]
    EmptyPool,
}

/// Reasons a queue configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The file is not a valid configuration.
    #[error("JSON deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}
