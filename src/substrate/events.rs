//! Write-once event store
//!
//! A job publishes durable values under `(job, key)`. Each pair can be written
//! exactly once; readers see either nothing or the complete value.

use crate::error::{IoResultExt, MirrorError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Durable write-once values keyed by job and key
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Publish `value`. Fails with [`MirrorError::AlreadyPublished`] if the
    /// pair already holds a value.
    async fn publish(&self, job: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Read a published value
    async fn read(&self, job: &str, key: &str) -> Result<Option<serde_json::Value>>;
}

/// Event store kept in process memory
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<HashMap<(String, String), serde_json::Value>>,
}

impl MemoryEventStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn publish(&self, job: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        let slot = (job.to_string(), key.to_string());
        if events.contains_key(&slot) {
            return Err(MirrorError::AlreadyPublished {
                job: job.to_string(),
                key: key.to_string(),
            });
        }
        events.insert(slot, value);
        Ok(())
    }

    async fn read(&self, job: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        Ok(events.get(&(job.to_string(), key.to_string())).cloned())
    }
}

/// Event store persisted as `<dir>/<job>/<key>.json`
pub struct FileEventStore {
    dir: PathBuf,
}

impl FileEventStore {
    /// Open a store rooted at `dir`, creating it if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.with_path(&dir)?;
        Ok(Self { dir })
    }

    fn event_path(&self, job: &str, key: &str) -> Option<PathBuf> {
        if !is_safe_segment(job) || !is_safe_segment(key) {
            return None;
        }
        Some(self.dir.join(job).join(format!("{}.json", key)))
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn publish(&self, job: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let path = self
            .event_path(job, key)
            .ok_or_else(|| MirrorError::Journal(format!("invalid event name {}/{}", job, key)))?;
        let parent = self.dir.join(job);
        tokio::fs::create_dir_all(&parent).await.with_path(&parent)?;

        let temp_path = parent.join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&temp_path, &bytes).await.with_path(&temp_path)?;

        // hard_link refuses to replace an existing file, which makes the
        // publish atomic and write-once even across processes.
        let linked = tokio::fs::hard_link(&temp_path, &path).await;
        let _ = tokio::fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(MirrorError::AlreadyPublished {
                job: job.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(MirrorError::io(path, e)),
        }
    }

    async fn read(&self, job: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let path = match self.event_path(job, key) {
            Some(path) => path,
            None => return Ok(None),
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MirrorError::io(path, e)),
        }
    }
}

/// Job ids and keys become path segments
pub(crate) fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
