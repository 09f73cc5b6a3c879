//! API Data Models
//!
//! Request and response bodies of the HTTP endpoints.

use crate::error::MirrorError;
use crate::mirror::{CancelReport, JobHandle, TransferRequest};
use crate::storage::StorageLocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST /start_transfer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTransferRequest {
    /// Source bucket
    pub src_bucket: String,
    /// Source prefix
    #[serde(default)]
    pub src_prefix: String,
    /// Copy only these keys; omit or null to copy everything under the prefix
    #[serde(default)]
    pub src_keys: Option<Vec<String>>,
    /// Destination bucket
    pub dst_bucket: String,
    /// Destination prefix
    #[serde(default)]
    pub dst_prefix: String,
}

impl StartTransferRequest {
    /// Convert to a core transfer request
    pub fn into_transfer_request(self) -> Result<TransferRequest, MirrorError> {
        if self.src_bucket.trim().is_empty() {
            return Err(MirrorError::InvalidLocation("src_bucket is empty".to_string()));
        }
        if self.dst_bucket.trim().is_empty() {
            return Err(MirrorError::InvalidLocation("dst_bucket is empty".to_string()));
        }
        Ok(TransferRequest {
            source: StorageLocation::new(self.src_bucket, self.src_prefix),
            destination: StorageLocation::new(self.dst_bucket, self.dst_prefix),
            explicit_keys: self.src_keys,
        })
    }
}

/// Response of `POST /start_transfer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTransferResponse {
    /// Handle to poll status with
    pub job_handle: JobHandle,
}

/// Response of `POST /cancel/{job_handle}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Cancelled job
    pub job_handle: JobHandle,
    /// Queued tasks cancelled outright
    pub cancelled: usize,
    /// Running tasks asked to stop
    pub signalled: usize,
    /// Tasks that had already finished
    pub already_finished: usize,
}

impl CancelResponse {
    /// Build from a cancellation report
    pub fn new(job_handle: JobHandle, report: CancelReport) -> Self {
        Self {
            job_handle,
            cancelled: report.cancelled,
            signalled: report.signalled,
            already_finished: report.already_finished,
        }
    }
}

/// Response of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "ok" when the server answers
    pub status: String,
    /// Crate version
    pub version: String,
    /// Server uptime
    pub uptime_seconds: u64,
    /// Storage backend name
    pub backend: String,
    /// Whether job state survives a restart
    pub durable: bool,
    /// Transfers currently running
    pub in_flight: usize,
    /// Response time
    pub timestamp: DateTime<Utc>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code
    pub code: String,
    /// Error message
    pub message: String,
    /// Additional details
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// 404 body
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: "NOT_FOUND".to_string(),
            message: message.into(),
            details: None,
        }
    }

    /// 400 body
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
            details: None,
        }
    }

    /// 500 body
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
            details: None,
        }
    }
}

impl From<&MirrorError> for ApiError {
    fn from(err: &MirrorError) -> Self {
        let details = match err {
            MirrorError::KeysNotFound { keys } => Some(serde_json::json!({ "missing_keys": keys })),
            MirrorError::ListingFailed { location, attempts, .. } => {
                Some(serde_json::json!({ "location": location, "attempts": attempts }))
            }
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

/// HTTP status for an error surfaced by a handler
pub fn status_for(err: &MirrorError) -> u16 {
    match err {
        MirrorError::KeysNotFound { .. }
        | MirrorError::InvalidLocation(_)
        | MirrorError::InvalidJobHandle(_) => 400,
        MirrorError::JobNotFound(_) => 404,
        MirrorError::ListingFailed { .. } => 502,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: StartTransferRequest =
            serde_json::from_str(r#"{"src_bucket": "genomics", "dst_bucket": "backup"}"#).unwrap();
        let request = request.into_transfer_request().unwrap();
        assert_eq!(request.source, StorageLocation::new("genomics", ""));
        assert!(request.explicit_keys.is_none());
    }

    #[test]
    fn test_request_with_keys() {
        let request: StartTransferRequest = serde_json::from_str(
            r#"{"src_bucket": "s", "src_prefix": "20x/", "src_keys": ["a", "b"], "dst_bucket": "d", "dst_prefix": "m/"}"#,
        )
        .unwrap();
        let request = request.into_transfer_request().unwrap();
        assert_eq!(request.destination, StorageLocation::new("d", "m/"));
        assert_eq!(request.explicit_keys.unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let request: StartTransferRequest =
            serde_json::from_str(r#"{"src_bucket": "", "dst_bucket": "d"}"#).unwrap();
        assert!(request.into_transfer_request().is_err());
    }

    #[test]
    fn test_error_mapping() {
        let err = MirrorError::KeysNotFound {
            keys: vec!["z".to_string()],
        };
        assert_eq!(status_for(&err), 400);
        let body = ApiError::from(&err);
        assert_eq!(body.code, "KEYS_NOT_FOUND");
        assert_eq!(body.details.unwrap()["missing_keys"][0], "z");

        assert_eq!(status_for(&MirrorError::JobNotFound("x".into())), 404);
        assert_eq!(status_for(&MirrorError::InvalidJobHandle("a.b".into())), 400);
        assert_eq!(
            status_for(&MirrorError::ListingFailed {
                location: "s3://b/".into(),
                attempts: 3,
                message: "boom".into()
            }),
            502
        );
        assert_eq!(status_for(&MirrorError::Journal("x".into())), 500);
    }
}
