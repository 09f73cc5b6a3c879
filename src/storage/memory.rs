//! In-memory object store
//!
//! Buckets are ordered maps of key to bytes. Listing honours a configurable
//! page size so pagination is exercised, and a handful of fault hooks let
//! callers simulate flaky listings, crashes in the middle of a copy, and slow
//! copies that stay in flight until released.

use crate::error::{MirrorError, Result};
use crate::storage::{part_ranges, CopyOptions, ListPage, ObjectRef, ObjectStore, StorageLocation, StoredObject};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Semaphore;

/// Default number of objects per listing page
const DEFAULT_PAGE_SIZE: usize = 1000;

/// In-memory object store
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    page_size: usize,
    list_failures: AtomicU32,
    copy_crashes: Mutex<HashMap<ObjectRef, u32>>,
    holds: Mutex<HashMap<ObjectRef, Arc<Semaphore>>>,
    list_calls: AtomicU64,
    copy_calls: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            list_failures: AtomicU32::new(0),
            copy_crashes: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            list_calls: AtomicU64::new(0),
            copy_calls: AtomicU64::new(0),
        }
    }

    /// Set the listing page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Create an empty bucket (no-op if it exists)
    pub fn create_bucket(&self, bucket: &str) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets.entry(bucket.to_string()).or_default();
    }

    /// Store an object, creating the bucket if needed
    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    /// Read an object's bytes
    pub fn get_object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.get(bucket).and_then(|b| b.get(key)).cloned()
    }

    /// Make the next `count` listing calls fail
    pub fn fail_next_lists(&self, count: u32) {
        self.list_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` copies of `source` write a truncated destination
    /// object and then fail, as if the process died mid-copy
    pub fn crash_next_copies(&self, source: &ObjectRef, count: u32) {
        let mut crashes = self.copy_crashes.lock().unwrap_or_else(|e| e.into_inner());
        crashes.insert(source.clone(), count);
    }

    /// Keep copies of `source` in flight until [`release`](Self::release)
    pub fn hold(&self, source: &ObjectRef) {
        let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
        holds
            .entry(source.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Let held copies of `source` proceed
    pub fn release(&self, source: &ObjectRef) {
        let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(gate) = holds.remove(source) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Number of listing calls served
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    /// Number of copy calls served
    pub fn copy_calls(&self) -> u64 {
        self.copy_calls.load(Ordering::Relaxed)
    }

    fn take_crash(&self, source: &ObjectRef) -> bool {
        let mut crashes = self.copy_crashes.lock().unwrap_or_else(|e| e.into_inner());
        match crashes.get_mut(source) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn gate(&self, source: &ObjectRef) -> Option<Arc<Semaphore>> {
        let holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
        holds.get(source).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_objects(
        &self,
        location: &StorageLocation,
        continuation_token: Option<&str>,
    ) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);

        let failing = self
            .list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MirrorError::storage(format!(
                "simulated listing failure for {}",
                location
            )));
        }

        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .get(&location.bucket)
            .ok_or_else(|| MirrorError::LocationNotFound(location.bucket.clone()))?;

        let mut objects = Vec::with_capacity(self.page_size);
        let mut next_token = None;

        let lower = match continuation_token {
            Some(token) => Bound::Excluded(token),
            None => Bound::Unbounded,
        };
        for (key, data) in bucket
            .range::<str, _>((lower, Bound::Unbounded))
            .filter(|(key, _)| key.starts_with(location.prefix.as_str()))
        {
            if objects.len() == self.page_size {
                next_token = objects.last().map(|o: &StoredObject| o.key.clone());
                break;
            }
            objects.push(StoredObject {
                key: key.clone(),
                size: data.len() as u64,
            });
        }

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
        self.copy_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(gate) = self.gate(source) {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| MirrorError::storage(format!("hold closed: {}", e)))?;
        }

        let data = {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            let bucket = buckets
                .get(&source.bucket)
                .ok_or_else(|| MirrorError::LocationNotFound(source.bucket.clone()))?;
            if !buckets.contains_key(&destination.bucket) {
                return Err(MirrorError::LocationNotFound(destination.bucket.clone()));
            }
            bucket
                .get(&source.key)
                .cloned()
                .ok_or_else(|| MirrorError::ObjectNotFound(source.to_string()))?
        };

        let mut assembled = Vec::with_capacity(data.len());
        let crash = self.take_crash(source);
        for range in part_ranges(data.len() as u64, options.part_size) {
            assembled.extend_from_slice(&data[range.start as usize..=range.end as usize]);
            if crash {
                // Leave whatever was written so far under the real key.
                assembled.truncate(assembled.len().min(data.len() / 2));
                self.put_object(&destination.bucket, &destination.key, assembled);
                return Err(MirrorError::storage(format!(
                    "simulated crash while copying {}",
                    source
                )));
            }
        }

        let len = assembled.len() as u64;
        self.put_object(&destination.bucket, &destination.key, assembled);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paged_listing_with_prefix() {
        let store = MemoryStore::new().with_page_size(2);
        for key in ["data/a", "data/b", "data/c", "other/d", "data/e"] {
            store.put_object("src", key, vec![1u8; 3]);
        }
        let loc = StorageLocation::new("src", "data/");

        let first = store.list_objects(&loc, None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        let token = first.next_token.clone().unwrap();

        let second = store.list_objects(&loc, Some(&token)).await.unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["data/c", "data/e"]);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_missing_bucket() {
        let store = MemoryStore::new();
        let err = store
            .list_objects(&StorageLocation::new("nope", ""), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::LocationNotFound(_)));
    }

    #[tokio::test]
    async fn test_crash_leaves_partial_object() {
        let store = MemoryStore::new();
        store.put_object("src", "big", (0..100u8).collect::<Vec<_>>());
        store.create_bucket("dst");

        let src = ObjectRef::new("src", "big");
        let dst = ObjectRef::new("dst", "big");
        let options = CopyOptions {
            max_parallel_parts: 4,
            part_size: 10,
        };

        store.crash_next_copies(&src, 1);
        assert!(store.copy_object(&src, &dst, &options).await.is_err());
        let partial = store.get_object("dst", "big").unwrap();
        assert!(partial.len() < 100);

        let copied = store.copy_object(&src, &dst, &options).await.unwrap();
        assert_eq!(copied, 100);
        assert_eq!(store.get_object("dst", "big"), store.get_object("src", "big"));
        assert_eq!(store.copy_calls(), 2);
    }

    #[tokio::test]
    async fn test_list_failures_are_consumed() {
        let store = MemoryStore::new();
        store.create_bucket("src");
        store.fail_next_lists(1);
        let loc = StorageLocation::new("src", "");
        assert!(store.list_objects(&loc, None).await.is_err());
        assert!(store.list_objects(&loc, None).await.is_ok());
    }
}
