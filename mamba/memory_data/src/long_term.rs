use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::short_term::MemoryEntry;

/// Errors emitted by the long-term storage subsystem.
#[derive(Debug, Error)]
pub enum MemoryStorageError {
    /// Filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The blocking persistence task did not complete.
    #[error("persistence task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Append-only, type-partitioned history with a positional index per type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LongTermMemory {
    entries: IndexMap<String, Vec<MemoryEntry>>,
    index: IndexMap<String, Vec<usize>>,
}

impl LongTermMemory {
    /// Restores a store from a persisted snapshot, rebuilding any index that does not
    /// match its entry list.
    #[must_use]
    pub fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        let mut memory = Self {
            entries: snapshot.long_term,
            index: snapshot.index,
        };
        let stale: Vec<String> = memory
            .entries
            .iter()
            .filter(|(kind, list)| {
                memory
                    .index
                    .get(*kind)
                    .map_or(true, |offsets| !offsets.iter().copied().eq(0..list.len()))
            })
            .map(|(kind, _)| kind.clone())
            .collect();
        for kind in stale {
            tracing::warn!(memory_type = %kind, "memory.index_rebuilt");
            memory.reindex(&kind);
        }
        memory
            .index
            .retain(|kind, _| memory.entries.contains_key(kind));
        memory
    }

    /// Appends an entry under its type and records its offset.
    pub fn append(&mut self, entry: MemoryEntry) {
        let kind = entry.entry_type.clone();
        let list = self.entries.entry(kind.clone()).or_default();
        list.push(entry);
        let offset = list.len() - 1;
        self.index.entry(kind).or_default().push(offset);
    }

    /// Whether the type has ever been stored (and not cleared).
    #[must_use]
    pub fn contains_type(&self, entry_type: &str) -> bool {
        self.entries.contains_key(entry_type)
    }

    /// Last `limit` entries of a type, oldest first.
    #[must_use]
    pub fn recent(&self, entry_type: &str, limit: usize) -> Option<Vec<MemoryEntry>> {
        self.entries.get(entry_type).map(|list| {
            let skip = list.len().saturating_sub(limit);
            list[skip..].to_vec()
        })
    }

    /// Removes entries of `entry_type` captured at or before `cutoff`; returns how many.
    pub fn forget_older_than(&mut self, entry_type: &str, cutoff: DateTime<Utc>) -> usize {
        let Some(list) = self.entries.get_mut(entry_type) else {
            return 0;
        };
        let before = list.len();
        list.retain(|entry| entry.timestamp > cutoff);
        let removed = before - list.len();
        if removed > 0 {
            self.reindex(entry_type);
        }
        removed
    }

    /// Offsets recorded for a type.
    #[must_use]
    pub fn offsets(&self, entry_type: &str) -> Option<&[usize]> {
        self.index.get(entry_type).map(Vec::as_slice)
    }

    /// Known types in first-stored order.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Total entries across every type.
    #[must_use]
    pub fn total(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Serializable copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            long_term: self.entries.clone(),
            index: self.index.clone(),
            last_saved: Utc::now(),
        }
    }

    fn reindex(&mut self, entry_type: &str) {
        let len = self.entries.get(entry_type).map_or(0, Vec::len);
        self.index.insert(entry_type.to_owned(), (0..len).collect());
    }
}

/// On-disk document: `{ long_term, index, last_saved }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Entries grouped by type.
    #[serde(default)]
    pub long_term: IndexMap<String, Vec<MemoryEntry>>,
    /// Offsets into each type's list.
    #[serde(default)]
    pub index: IndexMap<String, Vec<usize>>,
    /// When the snapshot was taken.
    #[serde(default = "Utc::now")]
    pub last_saved: DateTime<Utc>,
}

/// Writes the snapshot as pretty JSON next to `path`, then renames it into place so a
/// crash mid-write never leaves a truncated file.
pub fn write_snapshot(path: &Path, snapshot: &MemorySnapshot) -> Result<(), MemoryStorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_vec_pretty(snapshot)?;
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a snapshot; `Ok(None)` when the file does not exist.
pub fn read_snapshot(path: &Path) -> Result<Option<MemorySnapshot>, MemoryStorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
