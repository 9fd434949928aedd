//! Hopper queue core.
//!
//! Job records and their state machine, the storage contract and its
//! key-value implementation, job handlers and the [`Manager`] that producers,
//! workers and admin tools talk to.

mod config;
mod context;
mod error;
mod job;
pub mod kv;
mod manager;
pub mod storage;
mod types;

pub use config::{QueueConfig, RetentionConfig, ScheduleConfig, StorageConfig, WorkerDefaults};
pub use context::QueueContext;
pub use error::QueueError;
pub use job::{Job, JobContext, JobError, JobHandler, JobRegistry, JobSpec};
pub use kv::{FileStore, KeyValueStore, MemoryStore};
pub use manager::Manager;
pub use storage::{KvStorage, Storage};
pub use types::{
    ExceptionDetail, JobOptions, JobPatch, JobRecord, JobStatus, LogEntry, LogLevel, MAX_JOB_LOGS,
    QueueStats,
};
