//! Job cancellation

use crate::error::Result;
use crate::mirror::{JobDescriptor, JobHandle};
use crate::substrate::{EventStore, ExecutionStatus, ExecutionSubstrate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a cancellation request touched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReport {
    /// Tasks that were still queued and will never run
    pub cancelled: usize,
    /// Running tasks asked to stop
    pub signalled: usize,
    /// Tasks already terminal, left untouched
    pub already_finished: usize,
}

/// Cancels every unfinished task of a job
#[derive(Clone)]
pub struct CancellationController {
    substrate: Arc<dyn ExecutionSubstrate>,
    events: Arc<dyn EventStore>,
}

impl CancellationController {
    /// Create a controller
    pub fn new(substrate: Arc<dyn ExecutionSubstrate>, events: Arc<dyn EventStore>) -> Self {
        Self { substrate, events }
    }

    /// Request cancellation of every task not yet terminal.
    ///
    /// Finished tasks are never touched, and a running task that completes
    /// before it notices the request stays successful.
    pub async fn cancel(&self, job: &JobHandle) -> Result<CancelReport> {
        let descriptor = JobDescriptor::require(self.events.as_ref(), job).await?;
        let mut report = CancelReport::default();

        for task in &descriptor.tasks {
            let current = self.substrate.get_status(&task.execution).await?;
            if current.map(|r| r.status.is_terminal()).unwrap_or(false) {
                report.already_finished += 1;
                continue;
            }

            match self.substrate.cancel(&task.execution).await? {
                Some(ExecutionStatus::Cancelled) => report.cancelled += 1,
                Some(ExecutionStatus::Running) => report.signalled += 1,
                Some(_) => report.already_finished += 1,
                None => {
                    tracing::warn!(job = %job, execution = %task.execution, "no execution record for task");
                }
            }
        }

        tracing::info!(
            job = %job,
            cancelled = report.cancelled,
            signalled = report.signalled,
            already_finished = report.already_finished,
            "cancellation requested"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::MirrorError;
    use crate::mirror::{
        Enumerator, JobCoordinator, StatusAggregator, TaskState, TransferRequest, TransferUnit,
    };
    use crate::storage::{CopyOptions, MemoryStore, ObjectRef, ObjectStore, StorageLocation};
    use crate::substrate::{ExecutionJournal, MemoryEventStore, QueueConfig, WorkQueue};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: WorkQueue,
        coordinator: JobCoordinator,
        status: StatusAggregator,
        cancel: CancellationController,
    }

    async fn harness(config: QueueConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "a", vec![1u8; 10]);
        store.put_object("src", "b", vec![2u8; 20]);
        store.put_object("src", "c", vec![3u8; 30]);
        store.create_bucket("dst");

        let retry = RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..Default::default()
        };
        let objects: Arc<dyn ObjectStore> = store.clone();
        let queue = WorkQueue::new(config, Arc::new(ExecutionJournal::in_memory()));
        queue
            .start(Arc::new(TransferUnit::new(objects.clone(), CopyOptions::default(), retry)))
            .await
            .unwrap();

        let events: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let substrate: Arc<dyn ExecutionSubstrate> = Arc::new(queue.clone());
        Harness {
            coordinator: JobCoordinator::new(Enumerator::new(objects, retry), substrate.clone(), events.clone()),
            status: StatusAggregator::new(substrate.clone(), events.clone()),
            cancel: CancellationController::new(substrate, events),
            store,
            queue,
        }
    }

    fn request() -> TransferRequest {
        TransferRequest {
            source: StorageLocation::new("src", ""),
            destination: StorageLocation::new("dst", ""),
            explicit_keys: None,
        }
    }

    async fn wait_until<F>(h: &Harness, job: &JobHandle, mut done: F)
    where
        F: FnMut(&crate::mirror::JobStatus) -> bool,
    {
        for _ in 0..500 {
            if done(&h.status.status(job).await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never reached for job {}", job);
    }

    #[tokio::test]
    async fn test_cancel_after_two_of_three_succeed() {
        let h = harness(QueueConfig::default()).await;
        let held = ObjectRef::new("src", "c");
        h.store.hold(&held);

        let job = h.coordinator.start(request()).await.unwrap();
        wait_until(&h, &job, |s| s.transferred == 2 && s.running == 1).await;

        let report = h.cancel.cancel(&job).await.unwrap();
        assert_eq!(report.already_finished, 2);
        assert_eq!(report.signalled, 1);
        h.store.release(&held);

        let status = h
            .status
            .wait_for_completion(&job, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(status.transferred, 2);
        assert_eq!(status.cancelled, 1);
        assert_eq!(status.errored, 1);
        assert_eq!(status.filewise[2].status, TaskState::Cancelled);
        assert_eq!(status.filewise[2].error.as_deref(), Some("Transfer cancelled"));
        assert!(h.store.get_object("dst", "c").is_none());

        h.queue.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_tasks_never_run() {
        // One slot, held by the first task, so the rest stay queued.
        let h = harness(QueueConfig {
            name: "transfer_queue".to_string(),
            global_concurrency: 1,
            worker_concurrency: 1,
        })
        .await;
        let held = ObjectRef::new("src", "a");
        h.store.hold(&held);

        let job = h.coordinator.start(request()).await.unwrap();
        wait_until(&h, &job, |s| s.running == 1).await;

        let report = h.cancel.cancel(&job).await.unwrap();
        assert_eq!(report.signalled, 1);
        assert_eq!(report.cancelled, 2);
        h.store.release(&held);

        let status = h
            .status
            .wait_for_completion(&job, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(status.transferred, 0);
        assert_eq!(status.cancelled, 3);
        assert_eq!(h.store.copy_calls(), 1);

        h.queue.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn test_cancel_finished_job_changes_nothing() {
        let h = harness(QueueConfig::default()).await;
        let job = h.coordinator.start(request()).await.unwrap();
        let before = h
            .status
            .wait_for_completion(&job, Duration::from_millis(10))
            .await
            .unwrap();

        let report = h.cancel.cancel(&job).await.unwrap();
        assert_eq!(report.already_finished, 3);
        let after = h.status.status(&job).await.unwrap();
        assert_eq!(after.transferred, before.transferred);
        assert_eq!(after.transferred, 3);

        h.queue.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let h = harness(QueueConfig::default()).await;
        let err = h.cancel.cancel(&JobHandle::from_string("nope")).await.unwrap_err();
        assert!(matches!(err, MirrorError::JobNotFound(_)));
        h.queue.shutdown_and_join().await;
    }
}
