//! Events flowing from a spawned process to whoever supervises it.
//!
//! A `ProcessHandle` bridges the child's pipes and exit status into a channel
//! of `ProcessEvent`s so the supervisor can select over output and exit in a
//! single loop.

use crate::output::StreamKind;

/// Represents something observed on a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of raw bytes was read from stdout or stderr.
    Output { stream: StreamKind, data: Vec<u8> },
    /// The process exited and its pipes were drained, or the drain timed out.
    Exited { code: i32 },
}
