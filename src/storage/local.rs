//! Local filesystem object store
//!
//! Each bucket is a directory under the store root and object keys are
//! `/`-separated relative paths. Copies are split into ranged parts that are
//! written concurrently into a hidden temp file next to the destination, which
//! is renamed over the destination only once every part has landed. A crash
//! mid-copy therefore never leaves a half-written object under the real key.

use crate::error::{IoResultExt, MirrorError, Result};
use crate::storage::{part_ranges, ByteRange, CopyOptions, ListPage, ObjectRef, ObjectStore, StorageLocation, StoredObject};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use walkdir::WalkDir;

/// Prefix of temp files created while a copy is in flight
const TEMP_PREFIX: &str = ".s3mirror-";

/// Default number of objects per listing page
const DEFAULT_PAGE_SIZE: usize = 1000;

/// One directory walk served page by page
type Scan = Arc<Vec<StoredObject>>;

/// Filesystem-backed object store
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    page_size: usize,
    /// Walk of an in-progress listing, keyed by bucket and prefix. A listing
    /// walks the bucket on its first page; later pages slice the same walk.
    scans: Arc<Mutex<HashMap<(String, String), Scan>>>,
    walks: Arc<AtomicUsize>,
}

impl LocalStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
            scans: Arc::new(Mutex::new(HashMap::new())),
            walks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the listing page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.contains('/') || bucket.contains('\\') || bucket == ".." || bucket == "." {
            return Err(MirrorError::InvalidLocation(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    /// Resolve an object to a path, rejecting keys that escape the bucket
    pub fn object_path(&self, object: &ObjectRef) -> Result<PathBuf> {
        let relative = Path::new(&object.key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if object.key.is_empty() || escapes {
            return Err(MirrorError::InvalidLocation(object.to_string()));
        }
        Ok(self.bucket_dir(&object.bucket)?.join(relative))
    }

    fn cached_scan(&self, key: &(String, String)) -> Option<Scan> {
        let scans = self.scans.lock().ok()?;
        scans.get(key).cloned()
    }

    fn store_scan(&self, key: (String, String), scan: Scan) {
        if let Ok(mut scans) = self.scans.lock() {
            scans.insert(key, scan);
        }
    }

    /// Forget a finished walk unless a newer listing replaced it
    fn drop_scan(&self, key: &(String, String), scan: &Scan) {
        if let Ok(mut scans) = self.scans.lock() {
            if scans.get(key).is_some_and(|current| Arc::ptr_eq(current, scan)) {
                scans.remove(key);
            }
        }
    }

    fn scan_bucket(dir: &Path, prefix: &str) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();

        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.map_err(|e| MirrorError::storage(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(TEMP_PREFIX)
            {
                continue;
            }

            let relative = match entry.path().strip_prefix(dir) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if !key.starts_with(prefix) {
                continue;
            }

            let size = entry
                .metadata()
                .map_err(|e| MirrorError::storage(e.to_string()))?
                .len();
            objects.push(StoredObject { key, size });
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn list_objects(
        &self,
        location: &StorageLocation,
        continuation_token: Option<&str>,
    ) -> Result<ListPage> {
        let dir = self.bucket_dir(&location.bucket)?;
        if !tokio::fs::try_exists(&dir).await.with_path(&dir)? {
            return Err(MirrorError::LocationNotFound(location.bucket.clone()));
        }

        let scan_key = (location.bucket.clone(), location.prefix.clone());
        let cached = match continuation_token {
            Some(_) => self.cached_scan(&scan_key),
            None => None,
        };
        let all = match cached {
            Some(all) => all,
            None => {
                let prefix = location.prefix.clone();
                self.walks.fetch_add(1, Ordering::Relaxed);
                let all: Scan = Arc::new(
                    tokio::task::spawn_blocking(move || Self::scan_bucket(&dir, &prefix))
                        .await
                        .map_err(|e| MirrorError::storage(format!("listing task failed: {}", e)))??,
                );
                self.store_scan(scan_key.clone(), Arc::clone(&all));
                all
            }
        };

        let start = match continuation_token {
            Some(token) => all.partition_point(|o| o.key.as_str() <= token),
            None => 0,
        };
        let end = (start + self.page_size).min(all.len());
        let objects = all[start..end].to_vec();
        let next_token = if end < all.len() {
            objects.last().map(|o| o.key.clone())
        } else {
            self.drop_scan(&scan_key, &all);
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
        let src_path = self.object_path(source)?;
        let dst_path = self.object_path(destination)?;

        let dst_bucket = self.bucket_dir(&destination.bucket)?;
        if !tokio::fs::try_exists(&dst_bucket).await.with_path(&dst_bucket)? {
            return Err(MirrorError::LocationNotFound(destination.bucket.clone()));
        }

        let size = match tokio::fs::metadata(&src_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MirrorError::ObjectNotFound(source.to_string()));
            }
            Err(e) => return Err(MirrorError::io(&src_path, e)),
        };

        let parent = dst_path
            .parent()
            .ok_or_else(|| MirrorError::InvalidLocation(destination.to_string()))?;
        tokio::fs::create_dir_all(parent).await.with_path(parent)?;

        let file_name = dst_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = parent.join(format!(
            "{}{}.{}.part",
            TEMP_PREFIX,
            file_name,
            uuid::Uuid::new_v4().simple()
        ));

        // Removed on any early exit, including a dropped (cancelled) future.
        let mut guard = TempFileGuard::new(temp_path.clone());

        copy_into_temp(&src_path, &temp_path, size, options).await?;
        tokio::fs::rename(&temp_path, &dst_path)
            .await
            .with_path(&dst_path)?;
        guard.disarm();

        tracing::debug!(source = %source, destination = %destination, bytes = size, "local copy complete");
        Ok(size)
    }
}

struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn copy_into_temp(src: &Path, temp: &Path, size: u64, options: &CopyOptions) -> Result<()> {
    let file = tokio::fs::File::create(temp).await.with_path(temp)?;
    file.set_len(size).await.with_path(temp)?;

    stream::iter(part_ranges(size, options.part_size).into_iter().map(Ok::<_, MirrorError>))
        .map_ok(|range| copy_range(src, temp, range))
        .try_buffer_unordered(options.max_parallel_parts.max(1))
        .try_collect::<Vec<()>>()
        .await?;

    file.sync_all().await.with_path(temp)?;
    Ok(())
}

async fn copy_range(src: &Path, temp: &Path, range: ByteRange) -> Result<()> {
    let mut reader = tokio::fs::File::open(src).await.with_path(src)?;
    reader
        .seek(std::io::SeekFrom::Start(range.start))
        .await
        .with_path(src)?;

    let mut writer = tokio::fs::OpenOptions::new()
        .write(true)
        .open(temp)
        .await
        .with_path(temp)?;
    writer
        .seek(std::io::SeekFrom::Start(range.start))
        .await
        .with_path(temp)?;

    // Streams through tokio's fixed-size copy buffer.
    let copied = tokio::io::copy(&mut (&mut reader).take(range.len()), &mut writer)
        .await
        .with_path(temp)?;
    if copied != range.len() {
        return Err(MirrorError::storage(format!(
            "{} shrank during copy: bytes {}-{} short by {}",
            src.display(),
            range.start,
            range.end,
            range.len() - copied
        )));
    }
    writer.flush().await.with_path(temp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, bucket: &str, key: &str, data: &[u8]) {
        let path = root.join(bucket).join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn test_list_pages_and_prefix() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src", "data/a.bin", b"aa");
        write(dir.path(), "src", "data/nested/b.bin", b"bbb");
        write(dir.path(), "src", "data/c.bin", b"c");
        write(dir.path(), "src", "skip/d.bin", b"d");

        let store = LocalStore::new(dir.path()).with_page_size(2);
        let loc = StorageLocation::new("src", "data/");

        let first = store.list_objects(&loc, None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        let second = store
            .list_objects(&loc, first.next_token.as_deref())
            .await
            .unwrap();
        assert!(second.next_token.is_none());

        let mut keys: Vec<_> = first.objects.iter().chain(second.objects.iter()).map(|o| o.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["data/a.bin", "data/c.bin", "data/nested/b.bin"]);
    }

    #[tokio::test]
    async fn test_full_listing_walks_bucket_once() {
        let dir = TempDir::new().unwrap();
        for i in 0..25 {
            write(dir.path(), "src", &format!("data/{:02}.bin", i), b"x");
        }

        let store = LocalStore::new(dir.path()).with_page_size(4);
        let loc = StorageLocation::new("src", "data/");
        let mut token: Option<String> = None;
        let mut keys = Vec::new();
        loop {
            let page = store.list_objects(&loc, token.as_deref()).await.unwrap();
            keys.extend(page.objects.into_iter().map(|o| o.key));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        assert_eq!(keys.len(), 25);
        assert_eq!(keys[24], "data/24.bin");
        assert_eq!(store.walks.load(Ordering::Relaxed), 1);
        assert!(store.scans.lock().unwrap().is_empty());

        // A new listing starts from a fresh walk.
        store.list_objects(&loc, None).await.unwrap();
        assert_eq!(store.walks.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_large_part_is_streamed_intact() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        write(dir.path(), "src", "big.bin", &data);
        std::fs::create_dir_all(dir.path().join("dst")).unwrap();

        let store = LocalStore::new(dir.path());
        let options = CopyOptions {
            max_parallel_parts: 2,
            part_size: 200_000,
        };
        store
            .copy_object(&ObjectRef::new("src", "big.bin"), &ObjectRef::new("dst", "big.bin"), &options)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("dst/big.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_short_source_range_is_an_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src", "short.bin", &[1u8; 100]);
        let temp = dir.path().join("temp.part");
        std::fs::write(&temp, [0u8; 500]).unwrap();

        let err = copy_range(
            &dir.path().join("src/short.bin"),
            &temp,
            ByteRange { part_number: 1, start: 0, end: 499 },
        )
        .await
        .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_missing_bucket_is_location_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let err = store
            .list_objects(&StorageLocation::new("absent", ""), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::LocationNotFound(_)));
    }

    #[tokio::test]
    async fn test_ranged_copy_overwrites_partial_destination() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        write(dir.path(), "src", "obj.bin", &data);
        // Leftover from an interrupted run
        write(dir.path(), "dst", "out/obj.bin", &data[..123]);

        let store = LocalStore::new(dir.path());
        let options = CopyOptions {
            max_parallel_parts: 4,
            part_size: 1000,
        };
        let copied = store
            .copy_object(
                &ObjectRef::new("src", "obj.bin"),
                &ObjectRef::new("dst", "out/obj.bin"),
                &options,
            )
            .await
            .unwrap();

        assert_eq!(copied, data.len() as u64);
        let written = std::fs::read(dir.path().join("dst/out/obj.bin")).unwrap();
        assert_eq!(written, data);

        let listing = store
            .list_objects(&StorageLocation::new("dst", ""), None)
            .await
            .unwrap();
        assert_eq!(listing.objects.len(), 1);
    }

    #[tokio::test]
    async fn test_copy_empty_object() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src", "empty", b"");
        std::fs::create_dir_all(dir.path().join("dst")).unwrap();

        let store = LocalStore::new(dir.path());
        let copied = store
            .copy_object(
                &ObjectRef::new("src", "empty"),
                &ObjectRef::new("dst", "empty"),
                &CopyOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(copied, 0);
        assert!(dir.path().join("dst/empty").exists());
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let store = LocalStore::new("/tmp/root");
        assert!(store.object_path(&ObjectRef::new("b", "../etc/passwd")).is_err());
        assert!(store.object_path(&ObjectRef::new("b", "/abs")).is_err());
        assert!(store.object_path(&ObjectRef::new("../b", "k")).is_err());
        assert!(store.object_path(&ObjectRef::new("b", "ok/key")).is_ok());
    }
}
