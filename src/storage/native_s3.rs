//! Native AWS S3 SDK integration
//!
//! Server-side object copies over connection-pooled HTTP requests. Supports
//! S3-compatible endpoints (MinIO, Wasabi, etc.). Objects no larger than one
//! part use a single `CopyObject`; larger ones use a multipart upload whose
//! parts are `UploadPartCopy` calls, at most `max_parallel_parts` in flight.

use crate::error::{MirrorError, Result};
use crate::storage::{part_ranges, ByteRange, CopyOptions, ListPage, ObjectRef, ObjectStore, StorageLocation, StoredObject};
use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

/// Configuration for the native S3 client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeS3Config {
    /// AWS region (e.g., "us-east-1")
    pub region: String,
    /// Custom endpoint URL for S3-compatible services (MinIO, Wasabi)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for some S3-compatible services)
    pub force_path_style: bool,
    /// Access key ID (optional, falls back to AWS credential chain)
    pub access_key_id: Option<String>,
    /// Secret access key (optional, falls back to AWS credential chain)
    pub secret_access_key: Option<String>,
    /// SDK-level retry attempts per request
    pub max_attempts: u32,
}

impl Default for NativeS3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            max_attempts: 5,
        }
    }
}

/// S3 object store backed by the AWS SDK
#[derive(Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    /// Create a new S3 store from configuration.
    pub async fn new(config: NativeS3Config) -> Result<Self> {
        let mut aws_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .retry_config(
                aws_config::retry::RetryConfig::standard().with_max_attempts(config.max_attempts),
            );

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        if let (Some(ref key_id), Some(ref secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let creds = aws_credential_types::Credentials::new(
                key_id,
                secret,
                None, // session token
                None, // expiry
                "s3mirror-static",
            );
            aws_config_builder = aws_config_builder.credentials_provider(creds);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config.build()),
        })
    }

    async fn object_size(&self, object: &ObjectRef) -> Result<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| match e {
                SdkError::ServiceError(ref service) if matches!(service.err(), HeadObjectError::NotFound(_)) => {
                    MirrorError::ObjectNotFound(object.to_string())
                }
                other => MirrorError::storage(format!("S3 head_object failed: {}", other)),
            })?;

        let length = head.content_length().unwrap_or_default();
        u64::try_from(length)
            .map_err(|_| MirrorError::storage(format!("negative content length for {}", object)))
    }

    async fn atomic_copy(&self, source: &ObjectRef, destination: &ObjectRef) -> Result<()> {
        self.client
            .copy_object()
            .copy_source(copy_source(source))
            .bucket(&destination.bucket)
            .key(&destination.key)
            .send()
            .await
            .map_err(|e| MirrorError::storage(format!("S3 copy_object failed: {}", e)))?;
        Ok(())
    }

    async fn multipart_copy(
        &self,
        source: &ObjectRef,
        destination: &ObjectRef,
        size: u64,
        options: &CopyOptions,
    ) -> Result<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .send()
            .await
            .map_err(|e| {
                MirrorError::storage(format!("S3 create_multipart_upload failed: {}", e))
            })?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| MirrorError::storage("Missing upload_id"))?
            .to_string();

        let parts = stream::iter(part_ranges(size, options.part_size).into_iter().map(Ok::<_, MirrorError>))
            .map_ok(|range| self.upload_part_copy(source, destination, &upload_id, range))
            .try_buffer_unordered(options.max_parallel_parts.max(1))
            .try_collect::<Vec<CompletedPart>>()
            .await;

        let mut parts = match parts {
            Ok(parts) => parts,
            Err(e) => {
                self.abort(destination, &upload_id).await;
                return Err(e);
            }
        };
        parts.sort_by_key(|part| part.part_number);

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
        {
            self.abort(destination, &upload_id).await;
            return Err(MirrorError::storage(format!(
                "S3 complete_multipart_upload failed: {}",
                e
            )));
        }

        Ok(())
    }

    async fn upload_part_copy(
        &self,
        source: &ObjectRef,
        destination: &ObjectRef,
        upload_id: &str,
        range: ByteRange,
    ) -> Result<CompletedPart> {
        let part_number = i32::try_from(range.part_number)
            .map_err(|_| MirrorError::storage("part number out of range"))?;

        let response = self
            .client
            .upload_part_copy()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .part_number(part_number)
            .upload_id(upload_id)
            .copy_source(copy_source(source))
            .copy_source_range(range.as_header())
            .send()
            .await
            .map_err(|e| MirrorError::storage(format!("S3 upload_part_copy failed: {}", e)))?;

        let etag = response
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .ok_or_else(|| MirrorError::storage("Missing copy part result"))?;

        Ok(CompletedPart::builder()
            .e_tag(etag)
            .part_number(part_number)
            .build())
    }

    async fn abort(&self, destination: &ObjectRef, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(destination = %destination, upload_id, "failed to abort multipart upload: {}", e);
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn list_objects(
        &self,
        location: &StorageLocation,
        continuation_token: Option<&str>,
    ) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&location.bucket)
            .prefix(&location.prefix)
            .set_continuation_token(continuation_token.map(str::to_string))
            .send()
            .await
            .map_err(|e| match e {
                SdkError::ServiceError(ref service) if matches!(service.err(), ListObjectsV2Error::NoSuchBucket(_)) => {
                    MirrorError::LocationNotFound(location.bucket.clone())
                }
                other => MirrorError::storage(format!("S3 list_objects_v2 failed: {}", other)),
            })?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?.to_string();
                let size = u64::try_from(object.size().unwrap_or_default()).unwrap_or_default();
                Some(StoredObject { key, size })
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn copy_object(
        &self,
        source: &ObjectRef,
        destination: &ObjectRef,
        options: &CopyOptions,
    ) -> Result<u64> {
        let size = self.object_size(source).await?;

        if size <= options.part_size {
            tracing::debug!(source = %source, size, "using atomic copy");
            self.atomic_copy(source, destination).await?;
        } else {
            tracing::debug!(source = %source, size, part_size = options.part_size, "using multipart copy");
            self.multipart_copy(source, destination, size, options).await?;
        }

        Ok(size)
    }
}

/// `CopySource` header value for an object; key segments are
/// percent-encoded, `/` separators are kept
fn copy_source(object: &ObjectRef) -> String {
    let key = object
        .key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", object.bucket, key)
}
