//! Object storage module
//!
//! Defines the storage client boundary used by the mirror: paged listing of a
//! location and a single-object copy that may internally split into parallel
//! ranged parts. Backends:
//!
//! - [`MemoryStore`]: in-process buckets, used for tests and dry runs
//! - [`LocalStore`]: buckets are directories under a root path
//! - `S3Store`: AWS S3 and S3-compatible services (feature `native_s3`)

mod local;
mod memory;
#[cfg(feature = "native_s3")]
mod native_s3;

pub use local::*;
pub use memory::*;
#[cfg(feature = "native_s3")]
pub use native_s3::*;

use crate::error::{MirrorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum multipart part size accepted by S3 (except for the last part).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// An addressable root within an object store: a bucket plus key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Bucket name (directory name for the local backend)
    pub bucket: String,
    /// Key prefix, empty for the bucket root
    #[serde(default)]
    pub prefix: String,
}

impl StorageLocation {
    /// Create a location from bucket and prefix
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Parse `bucket`, `bucket/prefix/` or `s3://bucket/prefix/`
    pub fn parse(location: &str) -> Result<Self> {
        let trimmed = location.trim();
        let without_scheme = trimmed.strip_prefix("s3://").unwrap_or(trimmed);

        let (bucket, prefix) = without_scheme
            .split_once('/')
            .unwrap_or((without_scheme, ""));

        if bucket.is_empty() {
            return Err(MirrorError::InvalidLocation(location.to_string()));
        }

        Ok(Self::new(bucket, prefix))
    }

    /// Full reference for a key relative to this location
    pub fn object(&self, relative_key: &str) -> ObjectRef {
        ObjectRef {
            bucket: self.bucket.clone(),
            key: format!("{}{}", self.prefix, relative_key),
        }
    }

    /// Strip this location's prefix from a full key
    pub fn relative_key<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        full_key.strip_prefix(self.prefix.as_str())
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}

/// A single object: bucket plus full key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Bucket name
    pub bucket: String,
    /// Full object key, prefix included
    pub key: String,
}

impl ObjectRef {
    /// Create an object reference
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Object as returned by a listing call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Full object key
    pub key: String,
    /// Size in bytes as reported by the provider
    pub size: u64,
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in this page
    pub objects: Vec<StoredObject>,
    /// Continuation token for the next page, `None` on the last page
    pub next_token: Option<String>,
}

/// Per-object copy tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOptions {
    /// Maximum ranged parts copied concurrently for one object
    pub max_parallel_parts: usize,
    /// Size of each ranged part in bytes
    pub part_size: u64,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            max_parallel_parts: 100,
            part_size: 16 * 1024 * 1024,
        }
    }
}

/// Inclusive byte range of one copy part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// 1-based part number
    pub part_number: u32,
    /// First byte (inclusive)
    pub start: u64,
    /// Last byte (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Ranges are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// HTTP range header form, e.g. `bytes=0-1023`
    pub fn as_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Split an object of `size` bytes into consecutive parts of `part_size`
pub fn part_ranges(size: u64, part_size: u64) -> Vec<ByteRange> {
    if size == 0 {
        return Vec::new();
    }
    let part_size = part_size.max(1);
    let count = size.div_ceil(part_size);

    (0..count)
        .map(|i| ByteRange {
            part_number: (i + 1) as u32,
            start: i * part_size,
            end: ((i + 1) * part_size).min(size) - 1,
        })
        .collect()
}

/// Storage client used by the enumerator and the transfer unit
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// List one page of objects under `location`
    async fn list_objects(
        &self,
        location: &StorageLocation,
        continuation_token: Option<&str>,
    ) -> Result<ListPage>;

    /// Copy one object, overwriting the destination in full.
    ///
    /// Returns the number of bytes copied.
    async fn copy_object(
        &self,
        source: &ObjectRef,
        destination: &ObjectRef,
        options: &CopyOptions,
    ) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let loc = StorageLocation::parse("s3://genomics/google-brain/fastq/").unwrap();
        assert_eq!(loc.bucket, "genomics");
        assert_eq!(loc.prefix, "google-brain/fastq/");

        let loc = StorageLocation::parse("archive").unwrap();
        assert_eq!(loc.bucket, "archive");
        assert_eq!(loc.prefix, "");

        assert!(StorageLocation::parse("s3://").is_err());
        assert!(StorageLocation::parse("/leading").is_err());
    }

    #[test]
    fn test_object_and_relative_key() {
        let loc = StorageLocation::new("dst", "transferred_files/");
        let obj = loc.object("20x/HG001.R1.fastq.gz");
        assert_eq!(obj.key, "transferred_files/20x/HG001.R1.fastq.gz");
        assert_eq!(loc.relative_key(&obj.key), Some("20x/HG001.R1.fastq.gz"));
        assert_eq!(loc.relative_key("other/x"), None);
    }

    #[test]
    fn test_part_ranges() {
        assert!(part_ranges(0, 10).is_empty());

        let ranges = part_ranges(25, 10);
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[0].start, ranges[0].end), (0, 9));
        assert_eq!((ranges[2].start, ranges[2].end), (20, 24));
        assert_eq!(ranges[2].len(), 5);
        assert_eq!(ranges[1].as_header(), "bytes=10-19");

        let exact = part_ranges(20, 10);
        assert_eq!(exact.len(), 2);
        assert_eq!(exact[1].end, 19);
    }
}
