//! # Command Queue Demo Entry Point
//!
//! Calls into the library's `run()` function, which sets up logging and runs
//! the demo scenarios.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release -- [queue-config.json]
//! ```

fn main() {
    command_queue::run();
}
