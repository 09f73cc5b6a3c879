//! Execution substrate
//!
//! The mirror core hands units of work to a persistent queue and later asks
//! that queue what happened to them. This module defines that boundary and a
//! local implementation of it:
//!
//! - [`ExecutionSubstrate`]: enqueue / status / cancel by execution handle
//! - [`TaskRunner`]: the unit of work the queue executes
//! - [`EventStore`]: write-once durable values keyed by job
//! - [`WorkQueue`]: bounded queue with a global and a per-worker limit
//! - [`ExecutionJournal`]: durable execution records, replayed on restart

mod events;
mod journal;
mod queue;

pub use events::*;
pub use journal::*;
pub use queue::*;

use crate::error::Result;
use crate::mirror::TransferArgs;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Opaque reference to one unit of work accepted by the substrate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    /// Wrap an existing handle string
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Handle as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Accepted, waiting for a worker slot
    Enqueued,
    /// Picked up by a worker
    Running,
    /// Finished successfully
    Success,
    /// Finished with an error after exhausting retries
    Error,
    /// Cancelled before completing
    Cancelled,
}

impl ExecutionStatus {
    /// Whether the execution will never change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// Everything the substrate knows about one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution handle
    pub handle: ExecutionHandle,
    /// Queue that owns the execution
    pub queue: String,
    /// Arguments handed to the runner
    pub args: TransferArgs,
    /// Current status
    pub status: ExecutionStatus,
    /// Worker that last picked the execution up, as `host-pid/wN`
    pub executor: Option<String>,
    /// When the execution was accepted
    pub enqueued_at: DateTime<Utc>,
    /// When the latest run started
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Bytes reported by a successful run
    pub output_bytes: Option<u64>,
    /// Error text for failed or cancelled executions
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Fresh record in the `Enqueued` state
    pub fn enqueued(handle: ExecutionHandle, queue: impl Into<String>, args: TransferArgs) -> Self {
        Self {
            handle,
            queue: queue.into(),
            args,
            status: ExecutionStatus::Enqueued,
            executor: None,
            enqueued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            output_bytes: None,
            error: None,
        }
    }
}

/// Durable queue provider consumed by the job coordinator
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Submit work under `handle`. Submitting a handle that already exists
    /// returns it without scheduling a second execution.
    async fn enqueue(&self, handle: ExecutionHandle, args: TransferArgs) -> Result<ExecutionHandle>;

    /// Current record for `handle`, `None` if unknown
    async fn get_status(&self, handle: &ExecutionHandle) -> Result<Option<ExecutionRecord>>;

    /// Request cancellation. Returns the status observed after the request,
    /// `None` if the handle is unknown. Terminal executions are left untouched.
    async fn cancel(&self, handle: &ExecutionHandle) -> Result<Option<ExecutionStatus>>;
}

/// Unit of work executed by a [`WorkQueue`]
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run once to completion. Implementations observe `cancel` at safe
    /// points and return [`MirrorError::Cancelled`](crate::error::MirrorError::Cancelled)
    /// when they stop early. Returns the number of bytes moved.
    async fn run(&self, args: &TransferArgs, cancel: &CancellationToken) -> Result<u64>;
}
