//! devrack: supervised local services for project preview.
//!
//! A session runs install tasks one after another, then starts every service
//! in parallel and waits until each one prints its readiness pattern. All
//! processes are tracked by an [`orchestrator::Orchestrator`] so that a
//! failure or Ctrl+C tears the whole process tree down.

pub mod config;
pub mod detect;
pub mod env;
pub mod errors;
pub mod events;
pub mod handle;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod process;
pub mod progress;
pub mod readiness;
pub mod service_log;
pub mod supervisor;
