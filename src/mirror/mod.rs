//! Bulk object mirroring
//!
//! Leaf-first:
//!
//! - [`Enumerator`]: paginated listing with a whole-listing retry budget
//! - [`plan`]: which source keys to copy
//! - [`TransferUnit`]: copies one object, retryable and idempotent
//! - [`JobCoordinator`]: lists, plans, fans tasks out, publishes the task list
//! - [`StatusAggregator`]: status derived from execution records on demand
//! - [`CancellationController`]: cancels unfinished tasks of a job

mod cancel;
mod coordinator;
mod enumerator;
mod job;
pub mod planner;
mod service;
mod status;
mod transfer;

pub use cancel::*;
pub use coordinator::*;
pub use enumerator::*;
pub use job::*;
pub use planner::{plan, Plan, TransferCandidate};
pub use service::*;
pub use status::*;
pub use transfer::*;
