//! Progress reporting module
//!
//! Renders job status snapshots on the terminal: progress bars on a TTY,
//! periodic one-line reports otherwise.

mod reporter;

pub use reporter::*;
