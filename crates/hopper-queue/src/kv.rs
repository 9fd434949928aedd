//! Key-value backends the storage layer is built on.
//!
//! A backend only needs get/set/remove/flush by string key. Backends that can
//! enumerate keys by prefix say so through [`KeyValueStore::scan_prefix`];
//! the rest get an auxiliary key index maintained by the storage layer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::QueueError;

/// Contract for a cache-like persistence backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, QueueError>;

    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), QueueError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), QueueError>;

    /// Remove every key.
    async fn flush(&self) -> Result<(), QueueError>;

    /// List keys starting with `prefix`, or `None` if this backend cannot
    /// enumerate its keys.
    async fn scan_prefix(&self, _prefix: &str) -> Result<Option<Vec<String>>, QueueError> {
        Ok(None)
    }
}

fn expiry_from(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| Utc::now() + ttl)
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    scannable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            scannable: true,
        }
    }

    /// A memory store that refuses to enumerate keys, like most caches.
    pub fn opaque() -> Self {
        Self {
            entries: DashMap::new(),
            scannable: false,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, QueueError> {
        let now = Utc::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), QueueError> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: expiry_from(ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), QueueError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn flush(&self) -> Result<(), QueueError> {
        self.entries.clear();
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Option<Vec<String>>, QueueError> {
        if !self.scannable {
            return Ok(None);
        }
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(Some(keys))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEnvelope {
    value: Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

const FILE_EXT: &str = ".json";

/// Backend storing one JSON file per key in a directory.
///
/// Writes go through a temporary file and a rename, so readers in other
/// processes never see a half-written value.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(path = %dir.display(), "opened file store");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(key), FILE_EXT))
    }
}

/// Percent-encode anything that is not safe in a file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, QueueError> {
        let path = self.file_for(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let envelope: FileEnvelope = match serde_json::from_str(&contents) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key = %key, error = %e, "discarding unreadable entry");
                return Ok(None);
            }
        };

        if envelope.expires_at.is_some_and(|at| at <= Utc::now()) {
            self.remove(key).await?;
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), QueueError> {
        let envelope = FileEnvelope {
            value,
            expires_at: expiry_from(ttl),
        };
        let path = self.file_for(key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", encode_key(key), uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec(&envelope)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), QueueError> {
        match tokio::fs::remove_file(self.file_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self) -> Result<(), QueueError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(FILE_EXT) || name.ends_with(".tmp") {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Keys are listed from file names; expired entries are only dropped
    /// when read.
    async fn scan_prefix(&self, prefix: &str) -> Result<Option<Vec<String>>, QueueError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(FILE_EXT) else {
                continue;
            };
            match decode_key(stem) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                _ => {}
            }
        }
        keys.sort();
        Ok(Some(keys))
    }
}
