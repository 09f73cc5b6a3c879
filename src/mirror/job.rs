//! Job data model
//!
//! A job is fixed at creation: the coordinator publishes one
//! [`JobDescriptor`] listing every task with its execution handle, and nothing
//! ever adds, removes or rewrites a task afterwards.

use crate::error::{MirrorError, Result};
use crate::storage::StorageLocation;
use crate::substrate::{EventStore, ExecutionHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event key the task list is published under
pub const TASKS_EVENT: &str = "tasks";

/// Identifier handed back to callers for one bulk-transfer request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Fresh random handle
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap a caller-supplied handle
    pub fn from_string(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Check that the handle can name durable state: non-empty ASCII letters,
    /// digits, `-` and `_`
    pub fn validate(&self) -> Result<()> {
        if crate::substrate::is_safe_segment(&self.0) {
            Ok(())
        } else {
            Err(MirrorError::InvalidJobHandle(self.0.clone()))
        }
    }

    /// Handle as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic execution handle for the task at `index`
    pub fn execution_handle(&self, index: usize) -> ExecutionHandle {
        ExecutionHandle::new(format!("{}-{}", self.0, index))
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One enumerated object, key relative to the listed location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object key
    pub key: String,
    /// Size as reported by the store
    pub size_bytes: u64,
}

impl ObjectRecord {
    /// Create a record
    pub fn new(key: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            key: key.into(),
            size_bytes,
        }
    }
}

/// Arguments of one transfer execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferArgs {
    /// Owning job
    pub job: JobHandle,
    /// Task index within the job
    pub index: usize,
    /// Key relative to both locations
    pub key: String,
    /// Size at enumeration time
    pub size_bytes: u64,
    /// Source location
    pub source: StorageLocation,
    /// Destination location
    pub destination: StorageLocation,
}

/// One task of a published job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    /// 0-based position in source listing order
    pub index: usize,
    /// Key relative to both locations
    pub key: String,
    /// Size at enumeration time
    pub size_bytes: u64,
    /// Handle assigned by the execution substrate
    pub execution: ExecutionHandle,
}

/// The published, immutable description of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job handle
    pub job: JobHandle,
    /// Source location
    pub source: StorageLocation,
    /// Destination location
    pub destination: StorageLocation,
    /// When the job was planned
    pub created_at: DateTime<Utc>,
    /// Tasks in index order
    pub tasks: Vec<TransferTask>,
    /// Keys left out because the destination already had them
    #[serde(default)]
    pub skipped: Vec<String>,
}

impl JobDescriptor {
    /// Total bytes across all tasks
    pub fn total_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.size_bytes).sum()
    }

    /// Publish under [`TASKS_EVENT`]
    pub async fn publish(&self, events: &dyn EventStore) -> Result<()> {
        let value = serde_json::to_value(self)?;
        events.publish(self.job.as_str(), TASKS_EVENT, value).await
    }

    /// Load a published descriptor, `None` if the job has not been published
    pub async fn load(events: &dyn EventStore, job: &JobHandle) -> Result<Option<Self>> {
        match events.read(job.as_str(), TASKS_EVENT).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Load a published descriptor or fail with [`MirrorError::JobNotFound`]
    pub async fn require(events: &dyn EventStore, job: &JobHandle) -> Result<Self> {
        Self::load(events, job)
            .await?
            .ok_or_else(|| MirrorError::JobNotFound(job.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemoryEventStore;

    fn descriptor(job: &JobHandle) -> JobDescriptor {
        JobDescriptor {
            job: job.clone(),
            source: StorageLocation::new("src", "data/"),
            destination: StorageLocation::new("dst", ""),
            created_at: Utc::now(),
            tasks: vec![
                TransferTask {
                    index: 0,
                    key: "b".to_string(),
                    size_bytes: 20,
                    execution: job.execution_handle(0),
                },
                TransferTask {
                    index: 1,
                    key: "c".to_string(),
                    size_bytes: 30,
                    execution: job.execution_handle(1),
                },
            ],
            skipped: vec!["a".to_string()],
        }
    }

    #[test]
    fn test_execution_handles_are_deterministic() {
        let job = JobHandle::from_string("abc");
        assert_eq!(job.execution_handle(7).as_str(), "abc-7");
        assert_eq!(job.execution_handle(7), job.execution_handle(7));
        assert_ne!(JobHandle::new(), JobHandle::new());
    }

    #[test]
    fn test_handle_validation() {
        assert!(JobHandle::new().validate().is_ok());
        assert!(JobHandle::from_string("nightly_2024-01").validate().is_ok());
        for bad in ["", "nightly.2024", "a/b", "..", "job id"] {
            assert!(matches!(
                JobHandle::from_string(bad).validate(),
                Err(MirrorError::InvalidJobHandle(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_publish_and_load() {
        let events = MemoryEventStore::new();
        let job = JobHandle::new();
        assert!(JobDescriptor::load(&events, &job).await.unwrap().is_none());

        let published = descriptor(&job);
        published.publish(&events).await.unwrap();
        assert!(published.publish(&events).await.is_err());

        let loaded = JobDescriptor::require(&events, &job).await.unwrap();
        assert_eq!(loaded.tasks, published.tasks);
        assert_eq!(loaded.skipped, vec!["a"]);
        assert_eq!(loaded.total_bytes(), 50);
    }

    #[tokio::test]
    async fn test_require_unknown_job() {
        let events = MemoryEventStore::new();
        let err = JobDescriptor::require(&events, &JobHandle::from_string("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::JobNotFound(_)));
    }
}
