//! Transfer unit
//!
//! Copies exactly one object with a bounded number of attempts. Every attempt
//! rewrites the destination object in full, so running it again after a crash
//! or a failed attempt always ends with a complete, correct copy.

use crate::config::RetryPolicy;
use crate::error::{MirrorError, Result};
use crate::mirror::TransferArgs;
use crate::storage::{CopyOptions, ObjectStore};
use crate::substrate::TaskRunner;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of a successful transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Bytes written to the destination
    pub bytes: u64,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Wall time across all attempts
    pub elapsed: Duration,
}

/// Copies one object between two locations
#[derive(Clone)]
pub struct TransferUnit {
    store: Arc<dyn ObjectStore>,
    options: CopyOptions,
    retry: RetryPolicy,
}

impl TransferUnit {
    /// Create a transfer unit
    pub fn new(store: Arc<dyn ObjectStore>, options: CopyOptions, retry: RetryPolicy) -> Self {
        Self {
            store,
            options,
            retry,
        }
    }

    /// Copy `args.key` from source to destination.
    ///
    /// Cancellation is observed before each attempt, during backoff and while
    /// a copy is in flight; a copy that completes in the same poll as the
    /// cancellation wins. Errors that retrying cannot fix (missing object or
    /// bucket) end the transfer immediately.
    pub async fn transfer(&self, args: &TransferArgs, cancel: &CancellationToken) -> Result<TransferReceipt> {
        let source = args.source.object(&args.key);
        let destination = args.destination.object(&args.key);
        let attempts = self.retry.transfer_attempts.max(1);
        let start = Instant::now();

        tracing::info!(job = %args.job, index = args.index, key = %args.key, size = args.size_bytes, "transfer started");

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                result = self.store.copy_object(&source, &destination, &self.options) => result,
                _ = cancel.cancelled() => {
                    tracing::info!(job = %args.job, key = %args.key, attempt, "transfer cancelled in flight");
                    return Err(MirrorError::Cancelled);
                }
            };

            let error = match outcome {
                Ok(bytes) => {
                    let elapsed = start.elapsed();
                    tracing::info!(
                        job = %args.job,
                        index = args.index,
                        key = %args.key,
                        bytes,
                        attempt,
                        elapsed = %humantime::format_duration(truncate_millis(elapsed)),
                        "transfer finished"
                    );
                    return Ok(TransferReceipt {
                        bytes,
                        attempts: attempt,
                        elapsed,
                    });
                }
                Err(e) => e,
            };

            let retryable = error.is_recoverable() && attempt < attempts;
            if !retryable {
                tracing::error!(job = %args.job, key = %args.key, attempt, "transfer failed: {}", error);
                return Err(MirrorError::TransferFailed {
                    key: args.key.clone(),
                    attempts: attempt,
                    message: error.to_string(),
                });
            }

            let delay = self.retry.backoff(attempt);
            tracing::warn!(
                job = %args.job,
                key = %args.key,
                attempt,
                "transfer failed (attempt {}/{}): {}. Retrying in {:?}",
                attempt,
                attempts,
                error,
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
            }
        }

        // The loop always returns; attempts is at least 1.
        Err(MirrorError::TransferFailed {
            key: args.key.clone(),
            attempts,
            message: "no attempts made".to_string(),
        })
    }
}

fn truncate_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

#[async_trait]
impl TaskRunner for TransferUnit {
    async fn run(&self, args: &TransferArgs, cancel: &CancellationToken) -> Result<u64> {
        self.transfer(args, cancel).await.map(|receipt| receipt.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::JobHandle;
    use crate::storage::{MemoryStore, ObjectRef, StorageLocation};

    fn args(key: &str, size: u64) -> TransferArgs {
        TransferArgs {
            job: JobHandle::from_string("job"),
            index: 0,
            key: key.to_string(),
            size_bytes: size,
            source: StorageLocation::new("src", "in/"),
            destination: StorageLocation::new("dst", "out/"),
        }
    }

    fn unit(store: Arc<MemoryStore>) -> TransferUnit {
        TransferUnit::new(
            store,
            CopyOptions {
                max_parallel_parts: 4,
                part_size: 16,
            },
            RetryPolicy {
                base_delay_ms: 1,
                max_delay_ms: 2,
                ..Default::default()
            },
        )
    }

    fn payload() -> Vec<u8> {
        (0..200u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_copies_under_destination_prefix() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "in/obj", payload());
        store.create_bucket("dst");

        let receipt = unit(store.clone())
            .transfer(&args("obj", 200), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.bytes, 200);
        assert_eq!(receipt.attempts, 1);
        assert_eq!(store.get_object("dst", "out/obj"), Some(payload()));
        assert_eq!(store.get_object("src", "in/obj"), Some(payload()));
    }

    #[tokio::test]
    async fn test_retry_after_crash_is_byte_identical() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "in/obj", payload());
        store.create_bucket("dst");
        store.crash_next_copies(&ObjectRef::new("src", "in/obj"), 2);

        let receipt = unit(store.clone())
            .transfer(&args("obj", 200), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.attempts, 3);
        assert_eq!(store.get_object("dst", "out/obj"), Some(payload()));
    }

    #[tokio::test]
    async fn test_reinvoking_after_failed_unit_repairs_destination() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "in/obj", payload());
        store.create_bucket("dst");
        store.crash_next_copies(&ObjectRef::new("src", "in/obj"), 3);

        let unit = unit(store.clone());
        let err = unit
            .transfer(&args("obj", 200), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::TransferFailed { attempts: 3, .. }));
        assert_ne!(store.get_object("dst", "out/obj"), Some(payload()));

        unit.transfer(&args("obj", 200), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.get_object("dst", "out/obj"), Some(payload()));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket("src");
        store.create_bucket("dst");

        let err = unit(store.clone())
            .transfer(&args("gone", 1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::TransferFailed { attempts: 1, .. }));
        assert_eq!(store.copy_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "in/obj", payload());
        store.create_bucket("dst");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = unit(store.clone()).transfer(&args("obj", 200), &cancel).await.unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
        assert_eq!(store.copy_calls(), 0);
        assert!(store.get_object("dst", "out/obj").is_none());
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "in/obj", payload());
        store.create_bucket("dst");
        store.hold(&ObjectRef::new("src", "in/obj"));

        let cancel = CancellationToken::new();
        let unit = unit(store.clone());
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { unit.transfer(&args("obj", 200), &cancel).await })
        };

        while store.copy_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
        assert!(store.get_object("dst", "out/obj").is_none());
    }
}
