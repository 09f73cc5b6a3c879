//! Diff planning
//!
//! Decides which source objects a job copies: optionally restricted to an
//! explicit key list, minus everything the destination already holds, with
//! indices assigned in source-listing order.

use crate::error::{MirrorError, Result};
use crate::mirror::ObjectRecord;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// An object selected for transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCandidate {
    /// 0-based index in source-listing order
    pub index: usize,
    /// Key relative to both locations
    pub key: String,
    /// Source size
    pub size_bytes: u64,
}

/// Outcome of planning
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Objects to copy, in index order
    pub candidates: Vec<TransferCandidate>,
    /// Keys left out because the destination already has them
    pub skipped: Vec<String>,
}

impl Plan {
    /// Whether there is nothing to copy
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Bytes the plan would copy
    pub fn total_bytes(&self) -> u64 {
        self.candidates.iter().map(|c| c.size_bytes).sum()
    }
}

/// Compute the transfer plan.
///
/// With `explicit_keys`, every requested key must exist in `source` or the
/// whole plan fails with [`MirrorError::KeysNotFound`] naming the missing keys
/// in request order. Duplicate keys (in the listing or the request) are
/// planned once.
pub fn plan(
    source: &[ObjectRecord],
    destination: &[ObjectRecord],
    explicit_keys: Option<&[String]>,
) -> Result<Plan> {
    let selected: Vec<&ObjectRecord> = match explicit_keys {
        Some(keys) => {
            let by_key: HashMap<&str, &ObjectRecord> =
                source.iter().map(|r| (r.key.as_str(), r)).collect();

            let mut seen = HashSet::new();
            let mut missing = Vec::new();
            for key in keys {
                if !by_key.contains_key(key.as_str()) && seen.insert(key.as_str()) {
                    missing.push(key.clone());
                }
            }
            if !missing.is_empty() {
                return Err(MirrorError::KeysNotFound { keys: missing });
            }

            let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
            source
                .iter()
                .filter(|r| wanted.contains(r.key.as_str()))
                .collect()
        }
        None => source.iter().collect(),
    };

    let existing: HashSet<&str> = destination.iter().map(|r| r.key.as_str()).collect();
    let mut planned = HashSet::new();
    let mut result = Plan::default();

    for record in selected {
        if !planned.insert(record.key.as_str()) {
            continue;
        }
        if existing.contains(record.key.as_str()) {
            tracing::info!(key = %record.key, "Skipping {}: already present in the destination path", record.key);
            result.skipped.push(record.key.clone());
            continue;
        }
        result.candidates.push(TransferCandidate {
            index: result.candidates.len(),
            key: record.key.clone(),
            size_bytes: record.size_bytes,
        });
    }

    Ok(result)
}
