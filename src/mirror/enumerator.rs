//! Paginated listing of a storage location

use crate::config::RetryPolicy;
use crate::error::{MirrorError, Result};
use crate::mirror::ObjectRecord;
use crate::storage::{ObjectStore, StorageLocation};
use std::sync::Arc;

/// Lists every object under a location
#[derive(Clone)]
pub struct Enumerator {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl Enumerator {
    /// Create an enumerator over `store`
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Every object under `location`, in listing order, with keys relative to
    /// the location prefix.
    ///
    /// A failed page restarts the whole listing. A missing bucket is returned
    /// as [`MirrorError::LocationNotFound`] without retrying; any other failure
    /// that outlasts the attempt budget becomes [`MirrorError::ListingFailed`].
    pub async fn list(&self, location: &StorageLocation) -> Result<Vec<ObjectRecord>> {
        let attempts = self.retry.list_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.list_once(location).await {
                Ok(records) => {
                    tracing::debug!(location = %location, objects = records.len(), attempt, "listing complete");
                    return Ok(records);
                }
                Err(MirrorError::LocationNotFound(bucket)) => {
                    return Err(MirrorError::LocationNotFound(bucket));
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        let delay = self.retry.backoff(attempt);
                        tracing::warn!(
                            location = %location,
                            attempt,
                            "listing failed (attempt {}/{}): {}. Retrying in {:?}",
                            attempt,
                            attempts,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(MirrorError::ListingFailed {
            location: location.to_string(),
            attempts,
            message: last_error,
        })
    }

    /// Listing of a source location. A missing bucket is fatal.
    pub async fn list_source(&self, location: &StorageLocation) -> Result<Vec<ObjectRecord>> {
        self.list(location).await.map_err(|e| match e {
            MirrorError::LocationNotFound(bucket) => MirrorError::ListingFailed {
                location: location.to_string(),
                attempts: 1,
                message: format!("Location not found: {}", bucket),
            },
            other => other,
        })
    }

    /// Listing of a destination location. A missing bucket is an empty listing.
    pub async fn list_destination(&self, location: &StorageLocation) -> Result<Vec<ObjectRecord>> {
        match self.list(location).await {
            Err(MirrorError::LocationNotFound(_)) => {
                tracing::info!(location = %location, "destination not found, treating as empty");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn list_once(&self, location: &StorageLocation) -> Result<Vec<ObjectRecord>> {
        let mut records = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self.store.list_objects(location, token.as_deref()).await?;
            for object in page.objects {
                // Stores filter by prefix; anything outside it is ignored.
                if let Some(relative) = location.relative_key(&object.key) {
                    if !relative.is_empty() {
                        records.push(ObjectRecord::new(relative, object.size));
                    }
                }
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..Default::default()
        }
    }

    fn enumerator(store: Arc<MemoryStore>) -> Enumerator {
        Enumerator::new(store, fast_retry())
    }

    #[tokio::test]
    async fn test_accumulates_all_pages() {
        let store = Arc::new(MemoryStore::new().with_page_size(3));
        for i in 0..10 {
            store.put_object("src", &format!("data/{:02}", i), vec![0u8; i]);
        }
        store.put_object("src", "other/x", b"x".to_vec());

        let records = enumerator(store.clone())
            .list(&StorageLocation::new("src", "data/"))
            .await
            .unwrap();

        assert_eq!(records.len(), 10);
        assert_eq!(records[0], ObjectRecord::new("00", 0));
        assert_eq!(records[9], ObjectRecord::new("09", 9));
        assert_eq!(store.list_calls(), 4);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "a", b"a".to_vec());
        store.fail_next_lists(2);

        let records = enumerator(store)
            .list(&StorageLocation::new("src", ""))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_listing_failed() {
        let store = Arc::new(MemoryStore::new());
        store.put_object("src", "a", b"a".to_vec());
        store.fail_next_lists(3);

        let err = enumerator(store.clone())
            .list(&StorageLocation::new("src", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::ListingFailed { attempts: 3, .. }));
        assert_eq!(store.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_missing_destination_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let enumerator = enumerator(store);
        let location = StorageLocation::new("nowhere", "");

        assert!(enumerator.list_destination(&location).await.unwrap().is_empty());
        let err = enumerator.list_source(&location).await.unwrap_err();
        assert!(matches!(err, MirrorError::ListingFailed { .. }));
    }
}
