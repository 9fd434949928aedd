//! Wiring shared by every command: config, storage, manager and scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::Result;
use tracing::debug;

use hopper_queue::{FileStore, KvStorage, Manager, QueueConfig, QueueContext};
use hopper_scheduler::Scheduler;

use crate::jobs::{ExampleJob, FailingExampleJob};

/// Default data directory: `<platform data dir>/hopper`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hopper")
}

/// Load the config file if one was given, otherwise defaults.
pub fn load_config(path: Option<&Path>) -> Result<QueueConfig> {
    match path {
        Some(path) => QueueConfig::from_json_file(path)
            .map_err(|e| miette::miette!("failed to load config {}: {}", path.display(), e)),
        None => Ok(QueueConfig::default()),
    }
}

pub struct App {
    pub manager: Manager,
    pub scheduler: Arc<Scheduler>,
}

impl App {
    /// Open the file-backed store and register the built-in jobs.
    ///
    /// `data_dir` wins over `storage.path` from the config.
    pub async fn open(config: QueueConfig, data_dir: Option<PathBuf>) -> Result<Self> {
        let dir = data_dir
            .or_else(|| config.storage.path.clone())
            .unwrap_or_else(default_data_dir);
        debug!(path = %dir.display(), "opening job store");

        let store = FileStore::open(&dir)
            .await
            .map_err(|e| miette::miette!("failed to open store at {}: {}", dir.display(), e))?;
        let storage = KvStorage::new(Arc::new(store), config.storage.prefix.clone());

        let context = QueueContext::new(config);
        let manager = Manager::new(Arc::new(storage), context);
        manager.register(Arc::new(ExampleJob));
        manager.register(Arc::new(FailingExampleJob));

        let scheduler = Scheduler::new(manager.clone())
            .await
            .map_err(|e| miette::miette!("failed to load schedules: {}", e))?;

        Ok(Self {
            manager,
            scheduler: Arc::new(scheduler),
        })
    }
}
