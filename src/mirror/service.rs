//! Wiring of the mirror components from configuration
//!
//! Every component receives its store, substrate and event store at
//! construction; this is the one place that decides which implementations
//! are used.

use crate::config::{BackendConfig, MirrorConfig};
use crate::error::{MirrorError, Result};
use crate::mirror::{CancellationController, Enumerator, JobCoordinator, StatusAggregator, TransferUnit};
use crate::storage::{LocalStore, ObjectStore};
use crate::substrate::{
    EventStore, ExecutionJournal, ExecutionSubstrate, FileEventStore, MemoryEventStore, WorkQueue,
};
use std::sync::Arc;

/// Name of the transfer queue
pub const TRANSFER_QUEUE: &str = "transfer_queue";

/// All mirror components sharing one store, queue and event store
#[derive(Clone)]
pub struct MirrorService {
    config: MirrorConfig,
    store: Arc<dyn ObjectStore>,
    queue: WorkQueue,
    coordinator: JobCoordinator,
    status: StatusAggregator,
    cancellation: CancellationController,
}

impl MirrorService {
    /// Build the store named by the configuration and wire everything to it
    pub async fn open(config: MirrorConfig) -> Result<Self> {
        let store = build_store(&config.backend).await?;
        Self::with_store(config, store).await
    }

    /// Wire everything to an existing store
    pub async fn with_store(config: MirrorConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let journal = match config.executions_dir() {
            Some(dir) => ExecutionJournal::open(dir).await?,
            None => ExecutionJournal::in_memory(),
        };
        let events: Arc<dyn EventStore> = match config.events_dir() {
            Some(dir) => Arc::new(FileEventStore::open(dir).await?),
            None => Arc::new(MemoryEventStore::new()),
        };

        let queue = WorkQueue::new(config.limits.queue_config(TRANSFER_QUEUE), Arc::new(journal));
        let substrate: Arc<dyn ExecutionSubstrate> = Arc::new(queue.clone());
        let enumerator = Enumerator::new(Arc::clone(&store), config.retry);

        tracing::debug!(
            backend = store.name(),
            durable = queue.journal().is_durable(),
            "mirror service assembled"
        );

        Ok(Self {
            coordinator: JobCoordinator::new(enumerator, Arc::clone(&substrate), Arc::clone(&events)),
            status: StatusAggregator::new(Arc::clone(&substrate), Arc::clone(&events)),
            cancellation: CancellationController::new(substrate, events),
            config,
            store,
            queue,
        })
    }

    /// Start the transfer workers, re-dispatching unfinished executions.
    ///
    /// Returns the number of recovered executions.
    pub async fn start_workers(&self) -> Result<usize> {
        let unit = TransferUnit::new(
            Arc::clone(&self.store),
            self.config.limits.copy_options(),
            self.config.retry,
        );
        self.queue.start(Arc::new(unit)).await
    }

    /// Stop taking new work and wait for the worker loops to exit
    pub async fn shutdown(&self) {
        self.queue.shutdown_and_join().await;
    }

    /// Active configuration
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Object store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Work queue
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Job coordinator
    pub fn coordinator(&self) -> &JobCoordinator {
        &self.coordinator
    }

    /// Status aggregator
    pub fn status(&self) -> &StatusAggregator {
        &self.status
    }

    /// Cancellation controller
    pub fn cancellation(&self) -> &CancellationController {
        &self.cancellation
    }
}

async fn build_store(backend: &BackendConfig) -> Result<Arc<dyn ObjectStore>> {
    match backend {
        BackendConfig::Local { root } => {
            if !root.is_dir() {
                return Err(MirrorError::config(format!(
                    "local root {} is not a directory",
                    root.display()
                )));
            }
            Ok(Arc::new(LocalStore::new(root.clone())))
        }
        #[cfg(feature = "native_s3")]
        BackendConfig::S3 {
            region,
            endpoint_url,
            force_path_style,
            access_key_id,
            secret_access_key,
        } => {
            let store = crate::storage::S3Store::new(crate::storage::NativeS3Config {
                region: region.clone(),
                endpoint_url: endpoint_url.clone(),
                force_path_style: *force_path_style,
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                ..Default::default()
            })
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "native_s3"))]
        BackendConfig::S3 { .. } => Err(MirrorError::config(
            "the s3 backend requires building with the native_s3 feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{JobHandle, TransferRequest};
    use crate::storage::StorageLocation;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(root: &std::path::Path, bucket: &str, key: &str, data: &[u8]) {
        let path = root.join(bucket).join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn config(data: &TempDir, state: Option<&TempDir>) -> MirrorConfig {
        let mut config = MirrorConfig::default();
        config.backend = BackendConfig::Local {
            root: data.path().to_path_buf(),
        };
        config.state_dir = state.map(|s| s.path().to_path_buf());
        config.retry.base_delay_ms = 1;
        config
    }

    fn request() -> TransferRequest {
        TransferRequest {
            source: StorageLocation::parse("src/data/").unwrap(),
            destination: StorageLocation::parse("s3://dst/mirror/").unwrap(),
            explicit_keys: None,
        }
    }

    #[tokio::test]
    async fn test_local_mirror_end_to_end() {
        let data = TempDir::new().unwrap();
        write(data.path(), "src", "data/one.bin", &[1u8; 1000]);
        write(data.path(), "src", "data/nested/two.bin", &[2u8; 5000]);
        std::fs::create_dir_all(data.path().join("dst")).unwrap();

        let service = MirrorService::open(config(&data, None)).await.unwrap();
        service.start_workers().await.unwrap();

        let job = service.coordinator().start(request()).await.unwrap();
        let status = service
            .status()
            .wait_for_completion(&job, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(status.transferred, 2);
        assert_eq!(status.bytes_transferred, 6000);
        assert_eq!(
            std::fs::read(data.path().join("dst/mirror/nested/two.bin")).unwrap(),
            vec![2u8; 5000]
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_survives_restart() {
        let data = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        write(data.path(), "src", "data/one.bin", &[1u8; 10]);
        std::fs::create_dir_all(data.path().join("dst")).unwrap();

        // Plan and submit without workers, as if the process died right after.
        let job = {
            let service = MirrorService::open(config(&data, Some(&state))).await.unwrap();
            service.coordinator().start(request()).await.unwrap()
        };

        let service = MirrorService::open(config(&data, Some(&state))).await.unwrap();
        assert_eq!(service.start_workers().await.unwrap(), 1);
        let status = service
            .status()
            .wait_for_completion(&job, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(status.transferred, 1);
        assert!(data.path().join("dst/mirror/one.bin").exists());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unstorable_job_handle_enqueues_nothing() {
        let data = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        write(data.path(), "src", "data/one.bin", &[1u8; 10]);
        std::fs::create_dir_all(data.path().join("dst")).unwrap();

        let service = MirrorService::open(config(&data, Some(&state))).await.unwrap();
        let job = JobHandle::from_string("nightly.2024");
        let err = service
            .coordinator()
            .start_with_handle(job.clone(), request())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidJobHandle(_)));
        assert!(service.queue().journal().is_empty());

        // Nothing is left behind for the next start to pick up.
        let reopened = MirrorService::open(config(&data, Some(&state))).await.unwrap();
        assert_eq!(reopened.queue().journal().len(), 0);
        assert!(matches!(
            reopened.status().status(&job).await.unwrap_err(),
            MirrorError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_local_root_is_config_error() {
        let mut config = MirrorConfig::default();
        config.backend = BackendConfig::Local {
            root: "/definitely/not/here".into(),
        };
        config.state_dir = None;
        let err = MirrorService::open(config).await.err().unwrap();
        assert!(matches!(err, MirrorError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_unknown_job_status() {
        let data = TempDir::new().unwrap();
        let service = MirrorService::open(config(&data, None)).await.unwrap();
        let err = service
            .status()
            .status(&JobHandle::from_string("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::JobNotFound(_)));
    }
}
