//! Job storage over a key-value backend.
//!
//! Key layout, with `p` the configured prefix:
//!
//! | Key | Value |
//! |---|---|
//! | `p.job.{id}` | one [`JobRecord`] |
//! | `p.queue.{name}` | pending index: job ids in insertion order |
//! | `p.scheduled` | the whole schedule table |
//! | `p.index` | every live job/queue key, only for backends without prefix scan |
//! | `p.{flag}` | short-lived flags such as overlap tracking |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::kv::{KeyValueStore, MemoryStore};
use crate::{
    ExceptionDetail, JobPatch, JobRecord, JobStatus, LogEntry, QueueError, QueueStats,
};

/// Storage contract used by the manager and scheduler.
///
/// Every operation on a missing record is a silent no-op, except `pop`, which
/// treats a missing record as a stale index entry and keeps scanning.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a record and append its id to the queue's pending index.
    async fn push(&self, queue: &str, record: JobRecord) -> Result<(), QueueError>;

    /// Take the first available pending record from a queue. The id leaves
    /// the pending index before the record is returned.
    async fn pop(&self, queue: &str) -> Result<Option<JobRecord>, QueueError>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, QueueError>;

    /// Merge a patch into a record and stamp `updated_at`.
    async fn update(&self, id: &str, patch: JobPatch) -> Result<(), QueueError>;

    async fn delete(&self, id: &str) -> Result<(), QueueError>;

    /// Append to the record's bounded log, read and written as one step.
    async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), QueueError>;

    /// Records with `status`, newest `created_at` first.
    async fn get_by_status(
        &self,
        status: JobStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Pending index length per queue.
    async fn queues(&self) -> Result<BTreeMap<String, usize>, QueueError>;

    /// Delete terminal records older than their retention window. Returns the
    /// number deleted.
    async fn clear(&self, completed_hours: u64, failed_hours: u64) -> Result<usize, QueueError>;

    async fn get_scheduled(&self) -> Result<Option<Value>, QueueError>;

    async fn save_scheduled(&self, table: Value) -> Result<(), QueueError>;

    async fn get_flag(&self, name: &str) -> Result<Option<Value>, QueueError>;

    async fn set_flag(
        &self,
        name: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), QueueError>;

    async fn remove_flag(&self, name: &str) -> Result<(), QueueError>;

    /// Transition to running and increment `attempts`. Returns the new
    /// attempt count, or `None` if the record is gone.
    async fn mark_running(&self, id: &str, worker_id: &str) -> Result<Option<u32>, QueueError>;

    async fn mark_completed(&self, id: &str, result: Option<Value>) -> Result<(), QueueError>;

    async fn mark_failed(
        &self,
        id: &str,
        error: String,
        exception: Option<ExceptionDetail>,
    ) -> Result<(), QueueError>;

    /// Back to pending, available after `delay`, and re-added to the queue's
    /// pending index.
    async fn release(&self, id: &str, delay: Duration) -> Result<(), QueueError>;

    /// Remove everything from the backend.
    async fn flush(&self) -> Result<(), QueueError>;
}

/// [`Storage`] implementation over any [`KeyValueStore`].
///
/// Read-modify-write sequences are serialised by an async mutex, which makes
/// dequeue exclusive within one process. Across processes the guarantee is
/// only as strong as the backend.
pub struct KvStorage {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    lock: Mutex<()>,
    uses_index: OnceCell<bool>,
}

impl KvStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            lock: Mutex::new(()),
            uses_index: OnceCell::new(),
        }
    }

    /// Storage over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), "queues")
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}.job.{}", self.prefix, id)
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}.queue.{}", self.prefix, queue)
    }

    fn scheduled_key(&self) -> String {
        format!("{}.scheduled", self.prefix)
    }

    fn index_key(&self) -> String {
        format!("{}.index", self.prefix)
    }

    fn flag_key(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    async fn uses_index(&self) -> Result<bool, QueueError> {
        let uses = self
            .uses_index
            .get_or_try_init(|| async {
                let scan = self.store.scan_prefix(&self.index_key()).await?;
                if scan.is_none() {
                    debug!(prefix = %self.prefix, "backend cannot scan, keeping key index");
                }
                Ok::<_, QueueError>(scan.is_none())
            })
            .await?;
        Ok(*uses)
    }

    async fn read_index(&self) -> Result<Vec<String>, QueueError> {
        match self.store.get(&self.index_key()).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Caller must hold `lock`.
    async fn track(&self, key: &str) -> Result<(), QueueError> {
        if !self.uses_index().await? {
            return Ok(());
        }
        let mut index = self.read_index().await?;
        if !index.iter().any(|k| k == key) {
            index.push(key.to_string());
            self.store
                .set(&self.index_key(), serde_json::to_value(index)?, None)
                .await?;
        }
        Ok(())
    }

    /// Caller must hold `lock`.
    async fn untrack(&self, key: &str) -> Result<(), QueueError> {
        if !self.uses_index().await? {
            return Ok(());
        }
        let mut index = self.read_index().await?;
        let before = index.len();
        index.retain(|k| k != key);
        if index.len() != before {
            self.store
                .set(&self.index_key(), serde_json::to_value(index)?, None)
                .await?;
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        if let Some(keys) = self.store.scan_prefix(prefix).await? {
            return Ok(keys);
        }
        Ok(self
            .read_index()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn read_record(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        match self.store.get(&self.job_key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Caller must hold `lock`.
    async fn write_record(&self, record: &JobRecord) -> Result<(), QueueError> {
        let key = self.job_key(&record.id);
        self.store
            .set(&key, serde_json::to_value(record)?, None)
            .await?;
        self.track(&key).await
    }

    async fn read_queue(&self, queue: &str) -> Result<Vec<String>, QueueError> {
        match self.store.get(&self.queue_key(queue)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Caller must hold `lock`.
    async fn write_queue(&self, queue: &str, ids: &[String]) -> Result<(), QueueError> {
        let key = self.queue_key(queue);
        self.store.set(&key, serde_json::to_value(ids)?, None).await?;
        self.track(&key).await
    }

    /// Caller must hold `lock`.
    async fn add_to_queue(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut ids = self.read_queue(queue).await?;
        if !ids.iter().any(|i| i == id) {
            ids.push(id.to_string());
            self.write_queue(queue, &ids).await?;
        }
        Ok(())
    }

    /// Caller must hold `lock`.
    async fn remove_from_queue(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut ids = self.read_queue(queue).await?;
        let before = ids.len();
        ids.retain(|i| i != id);
        if ids.len() != before {
            self.write_queue(queue, &ids).await?;
        }
        Ok(())
    }

    /// Caller must hold `lock`.
    async fn patch(&self, id: &str, patch: JobPatch) -> Result<Option<JobRecord>, QueueError> {
        let Some(mut record) = self.read_record(id).await? else {
            return Ok(None);
        };
        patch.apply(&mut record, Utc::now());
        self.write_record(&record).await?;
        Ok(Some(record))
    }

    /// Caller must hold `lock`.
    async fn delete_locked(&self, record: &JobRecord) -> Result<(), QueueError> {
        if record.status == JobStatus::Pending {
            self.remove_from_queue(&record.queue, &record.id).await?;
        }
        let key = self.job_key(&record.id);
        self.store.remove(&key).await?;
        self.untrack(&key).await
    }

    async fn all_records(&self) -> Result<Vec<JobRecord>, QueueError> {
        let prefix = format!("{}.job.", self.prefix);
        let mut records = Vec::new();
        for key in self.keys_with_prefix(&prefix).await? {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_value::<JobRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable job record"),
            }
        }
        Ok(records)
    }
}

fn cutoff(now: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl Storage for KvStorage {
    async fn push(&self, queue: &str, record: JobRecord) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        self.write_record(&record).await?;
        self.add_to_queue(queue, &record.id).await
    }

    async fn pop(&self, queue: &str) -> Result<Option<JobRecord>, QueueError> {
        let _guard = self.lock.lock().await;
        let ids = self.read_queue(queue).await?;
        let original_len = ids.len();
        let now = Utc::now();

        let mut kept = Vec::with_capacity(ids.len());
        let mut found = None;
        let mut iter = ids.into_iter();
        for id in iter.by_ref() {
            match self.read_record(&id).await? {
                // deleted behind the index's back
                None => continue,
                Some(record) if record.status.is_terminal() => continue,
                Some(record) if record.is_available(now) => {
                    found = Some(record);
                    break;
                }
                Some(_) => kept.push(id),
            }
        }
        kept.extend(iter);

        if found.is_some() || kept.len() != original_len {
            self.write_queue(queue, &kept).await?;
        }
        Ok(found)
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.read_record(id).await
    }

    async fn update(&self, id: &str, patch: JobPatch) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        self.patch(id, patch).await.map(|_| ())
    }

    async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let Some(mut record) = self.read_record(id).await? else {
            return Ok(());
        };
        record.push_log(entry);
        record.updated_at = Some(Utc::now());
        self.write_record(&record).await
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        if let Some(record) = self.read_record(id).await? {
            self.delete_locked(&record).await?;
        }
        Ok(())
    }

    async fn get_by_status(
        &self,
        status: JobStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        let mut records: Vec<JobRecord> = self
            .all_records()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::empty();
        for record in self.all_records().await? {
            stats.total += 1;
            *stats.by_status.entry(record.status).or_insert(0) += 1;
            *stats.by_queue.entry(record.queue).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn queues(&self) -> Result<BTreeMap<String, usize>, QueueError> {
        let prefix = format!("{}.queue.", self.prefix);
        let mut queues = BTreeMap::new();
        for key in self.keys_with_prefix(&prefix).await? {
            let name = key[prefix.len()..].to_string();
            let count = self.read_queue(&name).await?.len();
            queues.insert(name, count);
        }
        Ok(queues)
    }

    async fn clear(&self, completed_hours: u64, failed_hours: u64) -> Result<usize, QueueError> {
        let now = Utc::now();
        let completed_cutoff = cutoff(now, completed_hours);
        let failed_cutoff = cutoff(now, failed_hours);

        let _guard = self.lock.lock().await;
        let mut cleared = 0;
        for record in self.all_records().await? {
            let expired = match record.status {
                JobStatus::Completed => record.completed_at.is_some_and(|at| at < completed_cutoff),
                JobStatus::Failed => record.failed_at.is_some_and(|at| at < failed_cutoff),
                _ => false,
            };
            if expired {
                self.delete_locked(&record).await?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(cleared, "retention sweep removed jobs");
        }
        Ok(cleared)
    }

    async fn get_scheduled(&self) -> Result<Option<Value>, QueueError> {
        self.store.get(&self.scheduled_key()).await
    }

    async fn save_scheduled(&self, table: Value) -> Result<(), QueueError> {
        self.store.set(&self.scheduled_key(), table, None).await
    }

    async fn get_flag(&self, name: &str) -> Result<Option<Value>, QueueError> {
        self.store.get(&self.flag_key(name)).await
    }

    async fn set_flag(
        &self,
        name: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), QueueError> {
        self.store.set(&self.flag_key(name), value, ttl).await
    }

    async fn remove_flag(&self, name: &str) -> Result<(), QueueError> {
        self.store.remove(&self.flag_key(name)).await
    }

    async fn mark_running(&self, id: &str, worker_id: &str) -> Result<Option<u32>, QueueError> {
        let _guard = self.lock.lock().await;
        let Some(current) = self.read_record(id).await? else {
            return Ok(None);
        };
        let attempts = current.attempts + 1;
        let patch = JobPatch {
            status: Some(JobStatus::Running),
            attempts: Some(attempts),
            started_at: Some(Utc::now()),
            worker_id: Some(Some(worker_id.to_string())),
            ..Default::default()
        };
        Ok(self.patch(id, patch).await?.map(|r| r.attempts))
    }

    async fn mark_completed(&self, id: &str, result: Option<Value>) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            completed_at: Some(Utc::now()),
            result: Some(result),
            progress: Some(100.0),
            ..Default::default()
        };
        self.patch(id, patch).await.map(|_| ())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: String,
        exception: Option<ExceptionDetail>,
    ) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            failed_at: Some(Utc::now()),
            error: Some(Some(error)),
            exception: Some(exception),
            ..Default::default()
        };
        self.patch(id, patch).await.map(|_| ())
    }

    async fn release(&self, id: &str, delay: Duration) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| QueueError::Backend(format!("release delay out of range: {}", e)))?;
        let patch = JobPatch {
            status: Some(JobStatus::Pending),
            available_at: Some(Utc::now() + delay),
            worker_id: Some(None),
            ..Default::default()
        };
        if let Some(record) = self.patch(id, patch).await? {
            self.add_to_queue(&record.queue, id).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        self.store.flush().await
    }
}
