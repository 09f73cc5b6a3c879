//! Bounded work queue
//!
//! Executions are dispatched to `ceil(global / worker)` worker loops. Each
//! loop owns a local semaphore of `worker_concurrency` permits and all loops
//! share one of `global_concurrency` permits; a loop only dequeues once it
//! holds one of each, so neither limit is ever exceeded. Every state change
//! goes through the [`ExecutionJournal`], and on start the queue re-dispatches
//! whatever the journal shows as unfinished.

use crate::error::{MirrorError, Result};
use crate::mirror::TransferArgs;
use crate::substrate::{
    ExecutionHandle, ExecutionJournal, ExecutionRecord, ExecutionStatus, ExecutionSubstrate, TaskRunner,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error text recorded for cancelled executions
pub const CANCELLED_MESSAGE: &str = "Transfer cancelled";

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name recorded on every execution
    pub name: String,
    /// Maximum executions running across all workers
    pub global_concurrency: usize,
    /// Maximum executions running on one worker
    pub worker_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "transfer_queue".to_string(),
            global_concurrency: 18,
            worker_concurrency: 3,
        }
    }
}

impl QueueConfig {
    /// Number of worker loops needed to reach the global limit
    pub fn worker_count(&self) -> usize {
        let global = self.global_concurrency.max(1);
        let worker = self.worker_concurrency.max(1);
        (global + worker - 1) / worker
    }
}

/// Queue statistics
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Executions accepted
    pub enqueued: AtomicU64,
    /// Executions finished successfully
    pub succeeded: AtomicU64,
    /// Executions finished with an error
    pub failed: AtomicU64,
    /// Executions cancelled
    pub cancelled: AtomicU64,
    /// Executions currently running
    pub in_flight: AtomicUsize,
    /// Highest number of executions seen running at once
    pub peak_in_flight: AtomicUsize,
    /// Bytes reported by successful executions
    pub bytes: AtomicU64,
}

struct Shared {
    config: QueueConfig,
    journal: Arc<ExecutionJournal>,
    sender: mpsc::UnboundedSender<ExecutionHandle>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<ExecutionHandle>>,
    global: Arc<Semaphore>,
    running: Mutex<HashMap<ExecutionHandle, CancellationToken>>,
    shutdown: CancellationToken,
    executor_id: String,
    stats: QueueStats,
}

/// Journal-backed work queue implementing [`ExecutionSubstrate`]
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WorkQueue {
    /// Create a queue over `journal`. Nothing runs until [`start`](Self::start).
    pub fn new(config: QueueConfig, journal: Arc<ExecutionJournal>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let executor_id = format!(
            "{}-{}",
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "local".to_string()),
            std::process::id()
        );

        Self {
            shared: Arc::new(Shared {
                global: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
                config,
                journal,
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                running: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                executor_id,
                stats: QueueStats::default(),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Queue statistics
    pub fn stats(&self) -> &QueueStats {
        &self.shared.stats
    }

    /// Journal backing the queue
    pub fn journal(&self) -> &Arc<ExecutionJournal> {
        &self.shared.journal
    }

    /// Recover unfinished executions and spawn the worker loops.
    ///
    /// Returns the number of recovered executions.
    pub async fn start(&self, runner: Arc<dyn TaskRunner>) -> Result<usize> {
        let recovered = self.recover().await?;

        let count = self.shared.config.worker_count();
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return Err(MirrorError::Journal(format!(
                "queue {} already started",
                self.shared.config.name
            )));
        }
        for worker_id in 0..count {
            let shared = Arc::clone(&self.shared);
            let runner = Arc::clone(&runner);
            workers.push(tokio::spawn(worker_loop(shared, runner, worker_id)));
        }

        tracing::info!(
            queue = %self.shared.config.name,
            workers = count,
            global_concurrency = self.shared.config.global_concurrency,
            worker_concurrency = self.shared.config.worker_concurrency,
            recovered,
            "work queue started"
        );
        Ok(recovered)
    }

    /// Stop dequeuing. Running executions are left to finish; anything not
    /// finished stays unfinished in the journal and is recovered on next start.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Stop dequeuing and wait for the worker loops to exit
    pub async fn shutdown_and_join(&self) {
        self.shutdown();
        let workers: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn recover(&self) -> Result<usize> {
        let unfinished = self.shared.journal.unfinished();
        let mut recovered = 0;

        for record in unfinished {
            let reset = self
                .shared
                .journal
                .update(&record.handle, |r| {
                    if r.status == ExecutionStatus::Running {
                        r.status = ExecutionStatus::Enqueued;
                        r.started_at = None;
                        true
                    } else {
                        false
                    }
                })
                .await?;

            if let Some((record, _)) = reset {
                if record.status == ExecutionStatus::Enqueued {
                    tracing::info!(handle = %record.handle, key = %record.args.key, "re-dispatching unfinished execution");
                    self.dispatch(record.handle)?;
                    recovered += 1;
                }
            }
        }

        Ok(recovered)
    }

    fn dispatch(&self, handle: ExecutionHandle) -> Result<()> {
        self.shared
            .sender
            .send(handle)
            .map_err(|e| MirrorError::Journal(format!("queue closed, dropped {}", e.0)))
    }
}

#[async_trait]
impl ExecutionSubstrate for WorkQueue {
    async fn enqueue(&self, handle: ExecutionHandle, args: TransferArgs) -> Result<ExecutionHandle> {
        let record = ExecutionRecord::enqueued(handle.clone(), self.shared.config.name.clone(), args);
        if self.shared.journal.insert_if_absent(record).await? {
            self.shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            self.dispatch(handle.clone())?;
        } else {
            tracing::debug!(handle = %handle, "execution already enqueued");
        }
        Ok(handle)
    }

    async fn get_status(&self, handle: &ExecutionHandle) -> Result<Option<ExecutionRecord>> {
        Ok(self.shared.journal.get(handle))
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<Option<ExecutionStatus>> {
        let updated = self
            .shared
            .journal
            .update(handle, |r| {
                if r.status == ExecutionStatus::Enqueued {
                    r.status = ExecutionStatus::Cancelled;
                    r.ended_at = Some(Utc::now());
                    r.error = Some(CANCELLED_MESSAGE.to_string());
                    true
                } else {
                    false
                }
            })
            .await?;

        let (record, changed) = match updated {
            Some(updated) => updated,
            None => return Ok(None),
        };

        if changed {
            self.shared.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::info!(handle = %handle, "cancelled queued execution");
        } else if record.status == ExecutionStatus::Running {
            let running = self.shared.running.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(token) = running.get(handle) {
                token.cancel();
                tracing::info!(handle = %handle, "cancellation requested for running execution");
            }
        }

        Ok(Some(record.status))
    }
}

async fn worker_loop(shared: Arc<Shared>, runner: Arc<dyn TaskRunner>, worker_id: usize) {
    let local = Arc::new(Semaphore::new(shared.config.worker_concurrency.max(1)));
    tracing::debug!(worker_id, "worker started");

    loop {
        let local_permit = tokio::select! {
            permit = Arc::clone(&local).acquire_owned() => permit,
            _ = shared.shutdown.cancelled() => break,
        };
        let global_permit = tokio::select! {
            permit = Arc::clone(&shared.global).acquire_owned() => permit,
            _ = shared.shutdown.cancelled() => break,
        };
        let (local_permit, global_permit) = match (local_permit, global_permit) {
            (Ok(local), Ok(global)) => (local, global),
            _ => break,
        };

        let next = tokio::select! {
            handle = async { shared.receiver.lock().await.recv().await } => handle,
            _ = shared.shutdown.cancelled() => break,
        };
        let handle = match next {
            Some(handle) => handle,
            None => break,
        };

        let shared = Arc::clone(&shared);
        let runner = Arc::clone(&runner);
        tokio::spawn(execute(shared, runner, handle, worker_id, [local_permit, global_permit]));
    }

    tracing::debug!(worker_id, "worker stopped");
}

async fn execute(
    shared: Arc<Shared>,
    runner: Arc<dyn TaskRunner>,
    handle: ExecutionHandle,
    worker_id: usize,
    _permits: [OwnedSemaphorePermit; 2],
) {
    let token = CancellationToken::new();
    {
        // Registered before the record turns Running so a concurrent cancel
        // always finds the token once it observes Running.
        let mut running = shared.running.lock().unwrap_or_else(|e| e.into_inner());
        running.insert(handle.clone(), token.clone());
    }

    let executor = format!("{}/w{}", shared.executor_id, worker_id);
    let started = shared
        .journal
        .update(&handle, |r| {
            if r.status == ExecutionStatus::Enqueued {
                r.status = ExecutionStatus::Running;
                r.started_at = Some(Utc::now());
                r.executor = Some(executor);
                true
            } else {
                false
            }
        })
        .await;

    let args = match started {
        Ok(Some((record, true))) => record.args,
        Ok(_) => {
            // Cancelled while queued, or already finished by an earlier run.
            unregister(&shared, &handle);
            return;
        }
        Err(e) => {
            tracing::error!(handle = %handle, "failed to mark execution running: {}", e);
            unregister(&shared, &handle);
            return;
        }
    };

    let in_flight = shared.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    shared.stats.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);

    let outcome = AssertUnwindSafe(runner.run(&args, &token))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(MirrorError::storage(format!("execution {} panicked", handle))));

    shared.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    unregister(&shared, &handle);

    let (status, output_bytes, error) = match outcome {
        Ok(bytes) => {
            shared.stats.succeeded.fetch_add(1, Ordering::Relaxed);
            shared.stats.bytes.fetch_add(bytes, Ordering::Relaxed);
            (ExecutionStatus::Success, Some(bytes), None)
        }
        Err(MirrorError::Cancelled) => {
            shared.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            (ExecutionStatus::Cancelled, None, Some(CANCELLED_MESSAGE.to_string()))
        }
        Err(e) => {
            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
            (ExecutionStatus::Error, None, Some(e.to_string()))
        }
    };

    let finished = shared
        .journal
        .update(&handle, |r| {
            if r.status != ExecutionStatus::Running {
                return false;
            }
            r.status = status;
            r.ended_at = Some(Utc::now());
            r.output_bytes = output_bytes;
            r.error = error;
            true
        })
        .await;

    match finished {
        Ok(_) => tracing::debug!(handle = %handle, status = ?status, "execution finished"),
        Err(e) => tracing::error!(handle = %handle, "failed to record execution result: {}", e),
    }
}

fn unregister(shared: &Shared, handle: &ExecutionHandle) {
    let mut running = shared.running.lock().unwrap_or_else(|e| e.into_inner());
    running.remove(handle);
}
