//! Serializable settings for a command queue.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Default number of entries reserved in the FIFO.
pub const DEFAULT_CAPACITY: usize = 1024;

/// How a [`CommandQueue`](super::CommandQueue) is set up by
/// `initialize_with_config`.
///
/// # Fields
/// - `name`: Prefix for worker thread names and log lines
/// - `capacity`: `0` disables the queue (commands run on the caller);
///   anything else is reserved up front but does not bound the queue
/// - `workers`: Number of dedicated threads; `0` leaves the queue to be
///   pumped by `execute_queued_commands`
/// - `stack_size`: Optional stack size for worker threads, in bytes
///
/// # Example
/// ```rust
/// use command_queue::CommandQueueConfig;
///
/// let config = CommandQueueConfig::from_json_str(r#"{ "name": "render", "workers": 2 }"#).unwrap();
/// assert_eq!(config.name, "render");
/// assert_eq!(config.capacity, command_queue::DEFAULT_CAPACITY);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandQueueConfig {
    /// Thread and log name prefix.
    pub name: String,
    /// FIFO reservation; `0` disables the queue.
    pub capacity: usize,
    /// Dedicated worker thread count.
    pub workers: usize,
    /// Worker stack size override.
    pub stack_size: Option<usize>,
}

impl Default for CommandQueueConfig {
    fn default() -> Self {
        Self {
            name: "command-queue".to_string(),
            capacity: DEFAULT_CAPACITY,
            workers: 1,
            stack_size: None,
        }
    }
}

impl CommandQueueConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = CommandQueueConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CommandQueueConfig::default());
    }

    #[test]
    fn test_full_config() {
        let config = CommandQueueConfig::from_json_str(
            r#"{ "name": "audio", "capacity": 0, "workers": 4, "stack_size": 65536 }"#,
        )
        .unwrap();
        assert_eq!(config.name, "audio");
        assert_eq!(config.capacity, 0);
        assert_eq!(config.workers, 4);
        assert_eq!(config.stack_size, Some(65536));
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let err = CommandQueueConfig::from_json_str("{ workers: }").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = CommandQueueConfig::from_json_file("/nonexistent/queue.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
