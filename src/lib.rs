//! # s3mirror - Reliable Bulk Object Mirroring
//!
//! s3mirror copies every object under a source location (bucket plus prefix)
//! to a destination location. A job is planned once, split into one task per
//! object, and executed on a bounded work queue whose state survives
//! restarts. Objects the destination already holds are skipped, so
//! re-running a job only copies what is missing.
//!
//! ## Features
//!
//! - **Diff Planning**: Only keys absent from the destination are copied
//! - **Bounded Concurrency**: Global and per-worker limits on running transfers
//! - **Part-Parallel Copies**: Large objects copied as parallel ranges
//! - **Retries**: Listing and transfer retry budgets with exponential backoff
//! - **Durable Jobs**: Execution journal and published task lists on disk
//! - **Status and Cancellation**: Per-file state, throughput, cancel any time
//! - **HTTP API**: `start_transfer`, `transfer_status`, `cancel`, `health`
//!
//! ## Quick Start
//!
//! ```no_run
//! use s3mirror::config::{BackendConfig, MirrorConfig};
//! use s3mirror::mirror::{MirrorService, TransferRequest};
//! use s3mirror::storage::StorageLocation;
//! use std::time::Duration;
//!
//! # async fn example() -> s3mirror::Result<()> {
//! let config = MirrorConfig {
//!     backend: BackendConfig::Local { root: "/data".into() },
//!     ..Default::default()
//! };
//! let service = MirrorService::open(config).await?;
//! service.start_workers().await?;
//!
//! let job = service
//!     .coordinator()
//!     .start(TransferRequest {
//!         source: StorageLocation::parse("genomics/20x/")?,
//!         destination: StorageLocation::parse("backup/20x/")?,
//!         explicit_keys: None,
//!     })
//!     .await?;
//!
//! let status = service
//!     .status()
//!     .wait_for_completion(&job, Duration::from_secs(1))
//!     .await?;
//! println!("Copied {} of {} objects", status.transferred, status.total);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod error;
pub mod mirror;
pub mod progress;
pub mod storage;
pub mod substrate;

// Re-export commonly used types
pub use config::MirrorConfig;
pub use error::{MirrorError, Result};
pub use mirror::{JobHandle, JobStatus, MirrorService, TransferRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use s3mirror::prelude::*;
    //! ```

    pub use crate::config::{BackendConfig, ConcurrencyLimits, MirrorConfig, RetryPolicy};
    pub use crate::error::{MirrorError, Result};
    pub use crate::mirror::{
        CancelReport, JobHandle, JobStatus, MirrorService, TaskState, TransferRequest,
    };
    pub use crate::progress::ProgressReporter;
    pub use crate::storage::{LocalStore, MemoryStore, ObjectStore, StorageLocation};
    pub use crate::substrate::{ExecutionStatus, ExecutionSubstrate, WorkQueue};
}
