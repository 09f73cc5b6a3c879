//! Execution journal
//!
//! Holds one [`ExecutionRecord`] per execution handle. With a state directory
//! every change is written to `<dir>/<handle>.json` (temp file + rename), so
//! a restarted process can see which executions never reached a terminal
//! state and run them again.

use crate::error::{IoResultExt, MirrorError, Result};
use crate::substrate::{ExecutionHandle, ExecutionRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Store of execution records
pub struct ExecutionJournal {
    records: RwLock<HashMap<ExecutionHandle, ExecutionRecord>>,
    dir: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl ExecutionJournal {
    /// Journal that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dir: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open (or create) a journal persisted under `dir`, loading existing records
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.with_path(&dir)?;

        let mut records = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await.with_path(&dir)?;
        while let Some(entry) = entries.next_entry().await.with_path(&dir)? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }

            let bytes = tokio::fs::read(&path).await.with_path(&path)?;
            match serde_json::from_slice::<ExecutionRecord>(&bytes) {
                Ok(record) => {
                    records.insert(record.handle.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable journal record: {}", e);
                }
            }
        }

        tracing::debug!(dir = %dir.display(), records = records.len(), "execution journal opened");

        Ok(Self {
            records: RwLock::new(records),
            dir: Some(dir),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Whether records survive a restart
    pub fn is_durable(&self) -> bool {
        self.dir.is_some()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    /// Whether the journal has no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one record
    pub fn get(&self, handle: &ExecutionHandle) -> Option<ExecutionRecord> {
        self.read_records().get(handle).cloned()
    }

    /// Insert `record` unless its handle is already journaled.
    ///
    /// Returns `true` if the record was inserted.
    pub async fn insert_if_absent(&self, record: ExecutionRecord) -> Result<bool> {
        let handle = record.handle.clone();
        {
            let mut records = self.write_records();
            if records.contains_key(&handle) {
                return Ok(false);
            }
            records.insert(handle.clone(), record);
        }
        self.persist(&handle).await?;
        Ok(true)
    }

    /// Apply `change` to a record. The closure returns whether it modified the
    /// record; modified records are persisted.
    ///
    /// Returns the record after the change and whether it changed, or `None`
    /// for an unknown handle.
    pub async fn update<F>(&self, handle: &ExecutionHandle, change: F) -> Result<Option<(ExecutionRecord, bool)>>
    where
        F: FnOnce(&mut ExecutionRecord) -> bool,
    {
        let (snapshot, changed) = {
            let mut records = self.write_records();
            let record = match records.get_mut(handle) {
                Some(record) => record,
                None => return Ok(None),
            };
            let changed = change(record);
            (record.clone(), changed)
        };

        if changed {
            self.persist(handle).await?;
        }
        Ok(Some((snapshot, changed)))
    }

    /// Records that have not reached a terminal state, oldest first
    pub fn unfinished(&self) -> Vec<ExecutionRecord> {
        let mut pending: Vec<_> = self
            .read_records()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.args.index.cmp(&b.args.index))
        });
        pending
    }

    async fn persist(&self, handle: &ExecutionHandle) -> Result<()> {
        let dir = match &self.dir {
            Some(dir) => dir,
            None => return Ok(()),
        };

        // Serialize writers and always write the latest snapshot so the file
        // never ends up older than the in-memory record.
        let _guard = self.persist_lock.lock().await;
        let record = self
            .get(handle)
            .ok_or_else(|| MirrorError::Journal(format!("record {} vanished", handle)))?;

        let path = dir.join(format!("{}.json", file_stem(handle)));
        let temp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(&record)?;

        tokio::fs::write(&temp_path, &bytes).await.with_path(&temp_path)?;
        tokio::fs::rename(&temp_path, &path).await.with_path(&path)?;
        Ok(())
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ExecutionHandle, ExecutionRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_records(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ExecutionHandle, ExecutionRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Filesystem-safe name for a handle
fn file_stem(handle: &ExecutionHandle) -> String {
    handle
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
