//! Job coordination
//!
//! Starting a job lists both sides, plans, submits one transfer per candidate
//! to the execution substrate, then publishes the complete task list. Nothing
//! is submitted when listing or planning fails, and the call returns as soon
//! as the task list is published without waiting for any transfer.

use crate::error::{MirrorError, Result};
use crate::mirror::planner::{self, Plan};
use crate::mirror::{Enumerator, JobDescriptor, JobHandle, TransferArgs, TransferTask};
use crate::storage::StorageLocation;
use crate::substrate::{EventStore, ExecutionSubstrate};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A request to mirror one location into another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Source location
    pub source: StorageLocation,
    /// Destination location
    pub destination: StorageLocation,
    /// Copy only these keys (relative to the source)
    #[serde(default)]
    pub explicit_keys: Option<Vec<String>>,
}

/// Starts jobs
#[derive(Clone)]
pub struct JobCoordinator {
    enumerator: Enumerator,
    substrate: Arc<dyn ExecutionSubstrate>,
    events: Arc<dyn EventStore>,
}

impl JobCoordinator {
    /// Create a coordinator
    pub fn new(enumerator: Enumerator, substrate: Arc<dyn ExecutionSubstrate>, events: Arc<dyn EventStore>) -> Self {
        Self {
            enumerator,
            substrate,
            events,
        }
    }

    /// List both locations and plan, without submitting anything
    pub async fn plan(&self, request: &TransferRequest) -> Result<Plan> {
        let (source, destination) = tokio::try_join!(
            self.enumerator.list_source(&request.source),
            self.enumerator.list_destination(&request.destination),
        )?;
        planner::plan(&source, &destination, request.explicit_keys.as_deref())
    }

    /// Start a new job
    pub async fn start(&self, request: TransferRequest) -> Result<JobHandle> {
        self.start_with_handle(JobHandle::new(), request).await
    }

    /// Start a job under a caller-chosen handle.
    ///
    /// The handle is checked before anything is listed or submitted. If the
    /// job was already published this returns immediately. If an
    /// earlier start died between submitting tasks and publishing, the same
    /// execution handles are derived again and the substrate ignores the
    /// duplicates.
    pub async fn start_with_handle(&self, job: JobHandle, request: TransferRequest) -> Result<JobHandle> {
        job.validate()?;

        if let Some(existing) = JobDescriptor::load(self.events.as_ref(), &job).await? {
            tracing::info!(job = %job, tasks = existing.tasks.len(), "job already published");
            return Ok(job);
        }

        let plan = self.plan(&request).await?;

        tracing::info!(
            job = %job,
            tasks = plan.candidates.len(),
            skipped = plan.skipped.len(),
            bytes = plan.total_bytes(),
            source = %request.source,
            destination = %request.destination,
            "starting transfer of {} files",
            plan.candidates.len()
        );

        let mut tasks = Vec::with_capacity(plan.candidates.len());
        for candidate in plan.candidates {
            let args = TransferArgs {
                job: job.clone(),
                index: candidate.index,
                key: candidate.key.clone(),
                size_bytes: candidate.size_bytes,
                source: request.source.clone(),
                destination: request.destination.clone(),
            };
            let execution = self
                .substrate
                .enqueue(job.execution_handle(candidate.index), args)
                .await?;
            tasks.push(TransferTask {
                index: candidate.index,
                key: candidate.key,
                size_bytes: candidate.size_bytes,
                execution,
            });
        }

        let descriptor = JobDescriptor {
            job: job.clone(),
            source: request.source,
            destination: request.destination,
            created_at: Utc::now(),
            tasks,
            skipped: plan.skipped,
        };

        match descriptor.publish(self.events.as_ref()).await {
            Ok(()) => {}
            // A concurrent start of the same job won; its task list is equivalent.
            Err(MirrorError::AlreadyPublished { .. }) => {
                tracing::debug!(job = %job, "job published concurrently");
            }
            Err(e) => return Err(e),
        }

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::mirror::{StatusAggregator, TaskState};
    use crate::storage::{CopyOptions, MemoryStore, ObjectStore};
    use crate::substrate::{ExecutionJournal, MemoryEventStore, QueueConfig, WorkQueue};
    use crate::mirror::TransferUnit;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: WorkQueue,
        coordinator: JobCoordinator,
        status: StatusAggregator,
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..Default::default()
        }
    }

    async fn harness(store: Arc<MemoryStore>, start_workers: bool) -> Harness {
        let objects: Arc<dyn ObjectStore> = store.clone();
        let queue = WorkQueue::new(QueueConfig::default(), Arc::new(ExecutionJournal::in_memory()));
        if start_workers {
            let unit = TransferUnit::new(objects.clone(), CopyOptions::default(), retry());
            queue.start(Arc::new(unit)).await.unwrap();
        }
        let events: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let substrate: Arc<dyn ExecutionSubstrate> = Arc::new(queue.clone());
        Harness {
            coordinator: JobCoordinator::new(Enumerator::new(objects, retry()), substrate.clone(), events.clone()),
            status: StatusAggregator::new(substrate, events),
            store,
            queue,
        }
    }

    fn request(explicit: Option<&[&str]>) -> TransferRequest {
        TransferRequest {
            source: StorageLocation::new("src", ""),
            destination: StorageLocation::new("dst", ""),
            explicit_keys: explicit.map(|keys| keys.iter().map(|k| k.to_string()).collect()),
        }
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "a", vec![1u8; 10]);
        store.put_object("src", "b", vec![2u8; 20]);
        store.put_object("src", "c", vec![3u8; 30]);
        store.put_object("dst", "a", vec![1u8; 10]);
        store
    }

    #[tokio::test]
    async fn test_start_submits_missing_keys_in_index_order() {
        let h = harness(seeded_store(), false).await;
        let job = h.coordinator.start(request(None)).await.unwrap();

        let status = h.status.status(&job).await.unwrap();
        let keys: Vec<_> = status.filewise.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(status.filewise[0].index, 0);
        assert_eq!(status.filewise[1].index, 1);
        assert_eq!(status.pending, 2);
        assert_eq!(status.skipped, vec!["a"]);
        assert_eq!(h.queue.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_explicit_key_enqueues_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "a", vec![0u8; 1]);
        store.put_object("src", "b", vec![0u8; 1]);
        let h = harness(store, false).await;

        let err = h.coordinator.start(request(Some(&["a", "z"]))).await.unwrap_err();
        assert!(matches!(err, MirrorError::KeysNotFound { ref keys } if keys == &["z"]));
        assert!(h.queue.journal().is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_enqueues_nothing() {
        let store = seeded_store();
        store.fail_next_lists(100);
        let h = harness(store, false).await;

        let err = h.coordinator.start(request(None)).await.unwrap_err();
        assert!(matches!(err, MirrorError::ListingFailed { .. }));
        assert!(h.queue.journal().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_publishes_complete_job() {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket("src");
        let h = harness(store, false).await;

        let job = h.coordinator.start(request(None)).await.unwrap();
        let status = h.status.status(&job).await.unwrap();
        assert_eq!(status.total, 0);
        assert_eq!(status.transferred, 0);
        assert!(status.complete);
    }

    #[tokio::test]
    async fn test_rerun_transfers_nothing() {
        let h = harness(seeded_store(), true).await;

        let first = h.coordinator.start(request(None)).await.unwrap();
        let status = h
            .status
            .wait_for_completion(&first, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(status.transferred, 2);
        assert_eq!(status.bytes_transferred, 50);
        assert!(status.filewise.iter().all(|f| f.status == TaskState::Succeeded));
        assert_eq!(h.store.get_object("dst", "c"), Some(vec![3u8; 30]));

        let copies = h.store.copy_calls();
        let second = h.coordinator.start(request(None)).await.unwrap();
        let status = h.status.status(&second).await.unwrap();
        assert_eq!(status.total, 0);
        assert_eq!(status.bytes_transferred, 0);
        assert_eq!(status.skipped, vec!["a", "b", "c"]);
        assert_eq!(h.store.copy_calls(), copies);

        h.queue.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn test_start_with_existing_handle_is_idempotent() {
        let h = harness(seeded_store(), false).await;
        let job = JobHandle::from_string("fixed");

        h.coordinator.start_with_handle(job.clone(), request(None)).await.unwrap();
        h.coordinator.start_with_handle(job.clone(), request(None)).await.unwrap();

        assert_eq!(h.queue.journal().len(), 2);
        assert_eq!(h.status.status(&job).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let h = harness(seeded_store(), false).await;
        let err = h.status.status(&JobHandle::from_string("nope")).await.unwrap_err();
        assert!(matches!(err, MirrorError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_task_does_not_fail_job() {
        let store = seeded_store();
        store.crash_next_copies(&crate::storage::ObjectRef::new("src", "c"), 10);
        let h = harness(store, true).await;

        let job = h.coordinator.start(request(None)).await.unwrap();
        let status = h
            .status
            .wait_for_completion(&job, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.transferred, 1);
        assert_eq!(status.errored, 1);
        assert_eq!(status.errors[0].key, "c");
        assert!(status.errors[0].error.contains("simulated crash"));

        h.queue.shutdown_and_join().await;
    }
}
