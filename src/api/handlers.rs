//! API Request Handlers
//!
//! One handler per endpoint. Handlers only translate between the wire models
//! and the mirror service; errors are mapped to HTTP responses by the server.

use crate::api::models::*;
use crate::error::Result;
use crate::mirror::{JobHandle, JobStatus, MirrorService};
use chrono::Utc;
use std::sync::atomic::Ordering;

/// Application state shared across handlers
pub struct AppState {
    /// Mirror components
    pub service: MirrorService,
    /// Server start time
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(service: MirrorService) -> Self {
        Self {
            service,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Handler for POST /start_transfer
pub async fn handle_start_transfer(state: &AppState, request: StartTransferRequest) -> Result<StartTransferResponse> {
    let request = request.into_transfer_request()?;
    let job_handle = state.service.coordinator().start(request).await?;
    Ok(StartTransferResponse { job_handle })
}

/// Handler for GET /transfer_status/{job_handle}
pub async fn handle_transfer_status(state: &AppState, job_handle: &str) -> Result<JobStatus> {
    state
        .service
        .status()
        .status(&JobHandle::from_string(job_handle))
        .await
}

/// Handler for POST /cancel/{job_handle}
pub async fn handle_cancel(state: &AppState, job_handle: &str) -> Result<CancelResponse> {
    let job = JobHandle::from_string(job_handle);
    let report = state.service.cancellation().cancel(&job).await?;
    Ok(CancelResponse::new(job, report))
}

/// Handler for GET /health
pub fn handle_health(state: &AppState) -> HealthResponse {
    let queue = state.service.queue();
    HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        backend: state.service.store().name().to_string(),
        durable: queue.journal().is_durable(),
        in_flight: queue.stats().in_flight.load(Ordering::Relaxed),
        timestamp: Utc::now(),
    }
}
