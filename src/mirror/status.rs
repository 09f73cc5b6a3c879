//! Job status
//!
//! Status is never stored. Each query loads the published task list and asks
//! the execution substrate about every task's execution handle, then folds the
//! answers into counts, per-file detail and throughput.

use crate::error::Result;
use crate::mirror::{JobDescriptor, JobHandle, TransferTask};
use crate::storage::StorageLocation;
use crate::substrate::{EventStore, ExecutionRecord, ExecutionStatus, ExecutionSubstrate};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of one task as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for a worker
    Pending,
    /// Copying
    Running,
    /// Copied
    Succeeded,
    /// Gave up after exhausting retries
    Failed,
    /// Cancelled before completing
    Cancelled,
}

impl TaskState {
    /// Whether the task will never change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl From<ExecutionStatus> for TaskState {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Enqueued => Self::Pending,
            ExecutionStatus::Running => Self::Running,
            ExecutionStatus::Success => Self::Succeeded,
            ExecutionStatus::Error => Self::Failed,
            ExecutionStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// Per-task detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    /// Task index
    pub index: usize,
    /// Object key
    pub key: String,
    /// Object size
    pub size_bytes: u64,
    /// Current state
    pub status: TaskState,
    /// Execution handle
    pub execution: String,
    /// When the latest run started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Error text for failed or cancelled tasks
    pub error: Option<String>,
}

/// Error entry for a task that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Object key
    pub key: String,
    /// Error text
    pub error: String,
}

/// Aggregate view of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job handle
    pub job: JobHandle,
    /// Source location
    pub source: StorageLocation,
    /// Destination location
    pub destination: StorageLocation,
    /// When the job was planned
    pub created_at: DateTime<Utc>,
    /// Number of tasks
    pub total: usize,
    /// Tasks copied
    pub transferred: usize,
    /// Tasks that failed or were cancelled
    pub errored: usize,
    /// Tasks cancelled (also counted in `errored`)
    pub cancelled: usize,
    /// Tasks waiting for a worker
    pub pending: usize,
    /// Tasks copying right now
    pub running: usize,
    /// Every task is terminal
    pub complete: bool,
    /// Bytes across all tasks
    pub bytes_total: u64,
    /// Bytes of copied tasks
    pub bytes_transferred: u64,
    /// Earliest task start
    pub started_at: Option<DateTime<Utc>>,
    /// Latest task end, once the job is complete
    pub ended_at: Option<DateTime<Utc>>,
    /// Bytes per second across copied tasks
    pub throughput_bytes_per_sec: f64,
    /// Failed and cancelled tasks
    pub errors: Vec<TaskError>,
    /// Keys skipped because the destination already had them
    pub skipped: Vec<String>,
    /// Per-task detail in index order
    pub filewise: Vec<FileStatus>,
}

impl JobStatus {
    /// Build the status of `descriptor` from the execution records of its
    /// tasks (`records[i]` belongs to `descriptor.tasks[i]`)
    pub fn from_records(descriptor: &JobDescriptor, records: &[Option<ExecutionRecord>]) -> Self {
        let filewise: Vec<FileStatus> = descriptor
            .tasks
            .iter()
            .zip(records.iter())
            .map(|(task, record)| file_status(task, record.as_ref()))
            .collect();

        let count = |state: TaskState| filewise.iter().filter(|f| f.status == state).count();
        let transferred = count(TaskState::Succeeded);
        let failed = count(TaskState::Failed);
        let cancelled = count(TaskState::Cancelled);
        let complete = filewise.iter().all(|f| f.status.is_terminal());

        let errors = filewise
            .iter()
            .filter(|f| matches!(f.status, TaskState::Failed | TaskState::Cancelled))
            .map(|f| TaskError {
                key: f.key.clone(),
                error: f.error.clone().unwrap_or_default(),
            })
            .collect();

        Self {
            job: descriptor.job.clone(),
            source: descriptor.source.clone(),
            destination: descriptor.destination.clone(),
            created_at: descriptor.created_at,
            total: filewise.len(),
            transferred,
            errored: failed + cancelled,
            cancelled,
            pending: count(TaskState::Pending),
            running: count(TaskState::Running),
            complete,
            bytes_total: descriptor.total_bytes(),
            bytes_transferred: filewise
                .iter()
                .filter(|f| f.status == TaskState::Succeeded)
                .map(|f| f.size_bytes)
                .sum(),
            started_at: filewise.iter().filter_map(|f| f.started_at).min(),
            ended_at: if complete {
                filewise.iter().filter_map(|f| f.ended_at).max()
            } else {
                None
            },
            throughput_bytes_per_sec: throughput(&filewise),
            errors,
            skipped: descriptor.skipped.clone(),
            filewise,
        }
    }

    /// Whether any task failed or was cancelled
    pub fn has_errors(&self) -> bool {
        self.errored > 0
    }
}

fn file_status(task: &TransferTask, record: Option<&ExecutionRecord>) -> FileStatus {
    FileStatus {
        index: task.index,
        key: task.key.clone(),
        size_bytes: task.size_bytes,
        status: record.map(|r| r.status.into()).unwrap_or(TaskState::Pending),
        execution: task.execution.to_string(),
        started_at: record.and_then(|r| r.started_at),
        ended_at: record.and_then(|r| r.ended_at),
        error: record.and_then(|r| r.error.clone()),
    }
}

/// Bytes per second over succeeded tasks: their total size divided by the
/// span from the earliest start to the latest end.
///
/// Zero when fewer than two tasks succeeded or the span is not positive.
pub fn throughput(files: &[FileStatus]) -> f64 {
    let succeeded: Vec<&FileStatus> = files
        .iter()
        .filter(|f| f.status == TaskState::Succeeded)
        .filter(|f| f.started_at.is_some() && f.ended_at.is_some())
        .collect();
    if succeeded.len() < 2 {
        return 0.0;
    }

    let first_start = succeeded.iter().filter_map(|f| f.started_at).min();
    let last_end = succeeded.iter().filter_map(|f| f.ended_at).max();
    let (first_start, last_end) = match (first_start, last_end) {
        (Some(start), Some(end)) => (start, end),
        _ => return 0.0,
    };

    let seconds = (last_end - first_start)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    if seconds <= 0.0 {
        return 0.0;
    }

    let bytes: u64 = succeeded.iter().map(|f| f.size_bytes).sum();
    bytes as f64 / seconds
}

/// Answers status queries for published jobs
#[derive(Clone)]
pub struct StatusAggregator {
    substrate: Arc<dyn ExecutionSubstrate>,
    events: Arc<dyn EventStore>,
}

impl StatusAggregator {
    /// Create an aggregator
    pub fn new(substrate: Arc<dyn ExecutionSubstrate>, events: Arc<dyn EventStore>) -> Self {
        Self { substrate, events }
    }

    /// Current status, [`MirrorError::JobNotFound`](crate::error::MirrorError::JobNotFound)
    /// if the job was never published
    pub async fn status(&self, job: &JobHandle) -> Result<JobStatus> {
        let descriptor = JobDescriptor::require(self.events.as_ref(), job).await?;
        let records = try_join_all(
            descriptor
                .tasks
                .iter()
                .map(|task| self.substrate.get_status(&task.execution)),
        )
        .await?;
        Ok(JobStatus::from_records(&descriptor, &records))
    }

    /// Poll until every task is terminal, handing each snapshot to `on_update`
    pub async fn watch<F>(&self, job: &JobHandle, poll_interval: Duration, mut on_update: F) -> Result<JobStatus>
    where
        F: FnMut(&JobStatus),
    {
        loop {
            let status = self.status(job).await?;
            on_update(&status);
            if status.complete {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Poll until every task is terminal
    pub async fn wait_for_completion(&self, job: &JobHandle, poll_interval: Duration) -> Result<JobStatus> {
        self.watch(job, poll_interval, |_| {}).await
    }
}
