//! Transfer HTTP API
//!
//! Thin JSON surface over [`crate::mirror::MirrorService`]. Every endpoint
//! returns promptly; copying happens on the work queue.
//!
//! ## API Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/start_transfer` | POST | Plan a mirror job and enqueue its tasks |
//! | `/transfer_status/{job_handle}` | GET | Aggregate and per-file status |
//! | `/cancel/{job_handle}` | POST | Cancel unfinished tasks of a job |
//! | `/health` | GET | Liveness, backend and queue occupancy |
//!
//! Errors are JSON bodies with `code`, `message` and optional `details`.
//! Missing `src_keys` and malformed bodies are 400, unknown jobs 404 and
//! source listing failures 502.

mod server;
mod handlers;
mod models;

pub use server::*;
pub use handlers::*;
pub use models::*;
