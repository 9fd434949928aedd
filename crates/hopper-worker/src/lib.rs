//! Job execution loop for Hopper queues.
//!
//! A [`Worker`] polls its queues in order, runs each job under a timeout and
//! resolves it through the manager: completed, released with quadratic
//! backoff, or failed once attempts run out. Every iteration also lets the
//! scheduler enqueue due recurring jobs.

mod error;
mod memory;
mod options;
mod result;
mod worker;

pub use error::WorkerError;
pub use memory::MemoryProbe;
pub use options::{DEFAULT_MAX_JOBS, WorkerOptions};
pub use result::JobResult;
pub use worker::{Worker, WorkerExit, WorkerStatus};
