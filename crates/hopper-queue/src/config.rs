//! Queue configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::QueueError;

/// Top-level configuration shared by the manager, scheduler and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue names known up front.
    pub queues: Vec<String>,
    /// Queue used when neither the caller nor the job picks one.
    pub default_queue: String,
    pub worker: WorkerDefaults,
    pub retention: RetentionConfig,
    pub schedule: ScheduleConfig,
    pub storage: StorageConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string(), "high".to_string(), "low".to_string()],
            default_queue: "default".to_string(),
            worker: WorkerDefaults::default(),
            retention: RetentionConfig::default(),
            schedule: ScheduleConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: QueueConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.default_queue.trim().is_empty() {
            return Err(QueueError::InvalidConfig(
                "default_queue must not be empty".to_string(),
            ));
        }
        if self.worker.tries == 0 {
            return Err(QueueError::InvalidConfig(
                "worker.tries must be at least 1".to_string(),
            ));
        }
        if self.storage.prefix.is_empty() {
            return Err(QueueError::InvalidConfig(
                "storage.prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Defaults applied to every worker and every job that does not override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerDefaults {
    /// Job timeout in seconds.
    pub timeout: u64,
    /// Memory limit in megabytes. Zero disables the check.
    pub memory: u64,
    /// Idle sleep between polls, in seconds.
    pub sleep: u64,
    /// Maximum attempts per job.
    pub tries: u32,
    /// Base retry backoff in seconds.
    pub backoff: u64,
    /// Jobs processed before the worker exits for a restart.
    pub max_jobs: u64,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            timeout: 60,
            memory: 128,
            sleep: 5,
            tries: 3,
            backoff: 60,
            max_jobs: 1000,
        }
    }
}

/// Retention windows for the cleanup sweep, in hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub completed: u64,
    pub failed: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed: 24,
            failed: 168,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// IANA zone used by schedules that do not name one.
    pub timezone: String,
    /// Skip a scheduled run while the previous one is still outstanding.
    pub prevent_overlap: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            prevent_overlap: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Prefix for every key written to the backend.
    pub prefix: String,
    /// Directory for the file backend.
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: "queues".to_string(),
            path: None,
        }
    }
}
