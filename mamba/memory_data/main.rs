//! Memory store combining the short-term buffer and the persisted long-term history.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::Telemetry;
use shared_logging::LogLevel;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::{
    long_term::{read_snapshot, write_snapshot, LongTermMemory, MemorySnapshot, MemoryStorageError},
    short_term::{MemoryEntry, ShortTermMemory},
};

/// Recall query answered from the most recent short-term entries of any type.
pub const RECENT_CONTEXT: &str = "recent_context";

/// Store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Persisted JSON document.
    pub path: PathBuf,
    /// Short-term buffer capacity.
    pub max_short_term: usize,
    /// A background persist is triggered every this many stores (0 disables it).
    pub persist_every: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("memory_data.json"),
            max_short_term: 100,
            persist_every: 10,
        }
    }
}

impl MemoryConfig {
    /// Default settings persisting to `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Read-only summary of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Entries currently in the short-term buffer.
    pub short_term_count: usize,
    /// Long-term types in first-stored order.
    pub long_term_types: Vec<String>,
    /// Long-term entries across all types.
    pub total_memories: usize,
    /// Persisted document path.
    pub memory_file: PathBuf,
    /// Whether that document exists.
    pub file_exists: bool,
}

#[derive(Debug)]
struct MemoryState {
    short_term: ShortTermMemory,
    long_term: LongTermMemory,
    stores: u64,
    generation: u64,
}

#[derive(Debug)]
struct StoreInner {
    config: MemoryConfig,
    state: Mutex<MemoryState>,
    /// Generation of the newest snapshot written to disk.
    written: Mutex<u64>,
    telemetry: RwLock<Option<Telemetry>>,
}

impl StoreInner {
    fn write(&self, generation: u64, snapshot: &MemorySnapshot) -> Result<bool, MemoryStorageError> {
        let mut written = self.written.lock();
        if generation < *written {
            return Ok(false);
        }
        write_snapshot(&self.config.path, snapshot)?;
        *written = generation;
        Ok(true)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = self.telemetry.read().as_ref() {
            let _ = tel.log(level, message, metadata);
        }
    }
}

/// Two-tier memory. Cloning yields another handle to the same store.
///
/// Every mutation holds one lock over the buffer, the long-term map and the index, so
/// concurrent `store` calls never interleave. Persistence works on a snapshot taken under
/// that lock and runs on a blocking thread; the in-memory state stays authoritative.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Opens a store, loading the persisted document if present. A missing or unreadable
    /// document yields an empty store.
    #[must_use]
    pub fn open(config: MemoryConfig) -> Self {
        let long_term = match read_snapshot(&config.path) {
            Ok(Some(snapshot)) => {
                let memory = LongTermMemory::from_snapshot(snapshot);
                debug!(path = %config.path.display(), entries = memory.total(), "memory.loaded");
                memory
            }
            Ok(None) => LongTermMemory::default(),
            Err(err) => {
                warn!(path = %config.path.display(), error = %err, "memory.load_failed");
                LongTermMemory::default()
            }
        };
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(MemoryState {
                    short_term: ShortTermMemory::new(config.max_short_term),
                    long_term,
                    stores: 0,
                    generation: 0,
                }),
                config,
                written: Mutex::new(0),
                telemetry: RwLock::new(None),
            }),
        }
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(self, telemetry: Telemetry) -> Self {
        *self.inner.telemetry.write() = Some(telemetry);
        self
    }

    /// Settings of this store.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    /// Persisted document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Records `data` under `entry_type` in both tiers.
    ///
    /// Every `persist_every`-th call schedules a persist on the current tokio runtime
    /// without waiting for it; outside a runtime the document is written inline.
    pub fn store(&self, entry_type: impl Into<String>, data: Value) -> MemoryEntry {
        let entry_type = entry_type.into();
        let (entry, due) = {
            let mut state = self.inner.state.lock();
            // stamped under the lock so each type's history stays timestamp-ordered
            let entry = MemoryEntry::new(entry_type, data);
            state.short_term.push(entry.clone());
            state.long_term.append(entry.clone());
            state.stores += 1;
            state.generation += 1;
            let every = self.inner.config.persist_every as u64;
            (entry, every > 0 && state.stores % every == 0)
        };
        if due {
            self.persist_in_background();
        }
        entry
    }

    /// Looks up memories:
    /// 1. short-term entries of type `query`, if any;
    /// 2. otherwise the long-term list of type `query`, if known;
    /// 3. otherwise, for [`RECENT_CONTEXT`], the latest short-term entries of any type;
    /// 4. otherwise `None`.
    ///
    /// At most `limit` entries are returned, oldest first.
    #[must_use]
    pub fn recall(&self, query: &str, limit: usize) -> Option<Vec<MemoryEntry>> {
        let state = self.inner.state.lock();
        if state.short_term.contains_type(query) {
            return Some(state.short_term.recent_of_type(query, limit));
        }
        if let Some(entries) = state.long_term.recent(query, limit) {
            return Some(entries);
        }
        if query == RECENT_CONTEXT && !state.short_term.is_empty() {
            return Some(state.short_term.recent(limit));
        }
        None
    }

    /// Drops long-term entries of `entry_type` older than `older_than_days`, persists, and
    /// returns how many were removed. The short-term buffer is left alone.
    ///
    /// A type emptied this way stays known, so once the short-term buffer holds none of
    /// it, [`recall`](Self::recall) returns `Some(vec![])` rather than `None`. Check for
    /// an empty list before treating a recall as a hit.
    pub async fn forget(&self, entry_type: &str, older_than_days: u32) -> usize {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.long_term.forget_older_than(entry_type, cutoff);
            state.generation += 1;
            removed
        };
        self.inner.log(
            LogLevel::Info,
            "memory.forgotten",
            json!({ "type": entry_type, "removed": removed, "older_than_days": older_than_days }),
        );
        self.persist_logged().await;
        removed
    }

    /// Writes `{ long_term, index, last_saved }` to disk.
    pub async fn persist(&self) -> Result<(), MemoryStorageError> {
        let (generation, snapshot) = self.snapshot();
        let inner = Arc::clone(&self.inner);
        let entries = snapshot.long_term.values().map(Vec::len).sum::<usize>();
        let written =
            tokio::task::spawn_blocking(move || inner.write(generation, &snapshot)).await??;
        if written {
            self.inner.log(
                LogLevel::Debug,
                "memory.persisted",
                json!({ "entries": entries, "path": self.path().display().to_string() }),
            );
        }
        Ok(())
    }

    /// Empties every tier and persists the empty state.
    pub async fn clear(&self) {
        {
            let mut state = self.inner.state.lock();
            state.short_term.clear();
            state.long_term.clear();
            state.generation += 1;
        }
        self.inner.log(LogLevel::Warn, "memory.cleared", json!({}));
        self.persist_logged().await;
    }

    /// Summary counters.
    #[must_use]
    pub fn statistics(&self) -> MemoryStats {
        let state = self.inner.state.lock();
        MemoryStats {
            short_term_count: state.short_term.len(),
            long_term_types: state.long_term.types(),
            total_memories: state.long_term.total(),
            memory_file: self.inner.config.path.clone(),
            file_exists: self.inner.config.path.exists(),
        }
    }

    /// Short-term entries, oldest first.
    #[must_use]
    pub fn short_term_snapshot(&self) -> Vec<MemoryEntry> {
        self.inner.state.lock().short_term.snapshot()
    }

    /// Offsets recorded in the index for a type.
    #[must_use]
    pub fn index_offsets(&self, entry_type: &str) -> Option<Vec<usize>> {
        self.inner
            .state
            .lock()
            .long_term
            .offsets(entry_type)
            .map(<[usize]>::to_vec)
    }

    fn snapshot(&self) -> (u64, MemorySnapshot) {
        let state = self.inner.state.lock();
        (state.generation, state.long_term.snapshot())
    }

    async fn persist_logged(&self) {
        if let Err(err) = self.persist().await {
            self.report_failure(&err);
        }
    }

    fn persist_in_background(&self) {
        if let Ok(handle) = Handle::try_current() {
            let store = self.clone();
            handle.spawn(async move { store.persist_logged().await });
        } else {
            let (generation, snapshot) = self.snapshot();
            if let Err(err) = self.inner.write(generation, &snapshot) {
                self.report_failure(&err);
            }
        }
    }

    fn report_failure(&self, err: &MemoryStorageError) {
        warn!(path = %self.path().display(), error = %err, "memory.persist_failed");
        self.inner.log(
            LogLevel::Error,
            "memory.persist_failed",
            json!({ "path": self.path().display().to_string(), "error": err.to_string() }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &Path, max_short_term: usize) -> MemoryConfig {
        MemoryConfig {
            path: dir.join("memory.json"),
            max_short_term,
            persist_every: 0,
        }
    }

    #[test]
    fn store_then_recall_returns_latest_last() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(config_in(dir.path(), 10));
        store.store("perception", json!({ "value": 1 }));
        let entry = store.store("perception", json!({ "value": 2 }));
        let recalled = store.recall("perception", 10).unwrap();
        assert_eq!(recalled.last(), Some(&entry));
        assert_eq!(recalled.len(), 2);
    }

    #[test]
    fn short_term_never_exceeds_capacity() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(config_in(dir.path(), 10));
        for i in 1..=11 {
            store.store("x", json!(i));
        }
        let buffer = store.short_term_snapshot();
        assert_eq!(buffer.len(), 10);
        let values: Vec<_> = buffer.into_iter().map(|e| e.data).collect();
        assert_eq!(values, (2..=11).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(store.statistics().total_memories, 11);
        assert_eq!(store.index_offsets("x").unwrap(), (0..11).collect::<Vec<_>>());
    }

    #[test]
    fn recall_falls_back_to_long_term_then_recent_context() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(config_in(dir.path(), 2));
        assert!(store.recall(RECENT_CONTEXT, 5).is_none());
        store.store("old", json!("o"));
        store.store("new", json!(1));
        store.store("new", json!(2));

        let old = store.recall("old", 5).unwrap();
        assert_eq!(old[0].data, json!("o"));

        let context = store.recall(RECENT_CONTEXT, 5).unwrap();
        assert_eq!(context.len(), 2);
        assert!(context.iter().all(|e| e.entry_type == "new"));

        assert!(store.recall("never_stored", 5).is_none());
    }

    #[tokio::test]
    async fn persist_round_trips_into_fresh_store() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path(), 4);
        let store = MemoryStore::open(config.clone());
        store.store("perception", json!({ "sensor": "temp", "value": 21.5 }));
        store.store("action", json!({ "action": "process" }));
        store.store("perception", json!({ "sensor": "temp", "value": 22.0 }));
        store.persist().await.unwrap();

        let reopened = MemoryStore::open(config);
        for kind in ["perception", "action"] {
            assert_eq!(reopened.recall(kind, 10), store.recall(kind, 10));
        }
        assert_eq!(reopened.index_offsets("perception").unwrap(), vec![0, 1]);
        assert!(reopened.short_term_snapshot().is_empty());
        let stats = reopened.statistics();
        assert_eq!(stats.long_term_types, vec!["perception", "action"]);
        assert!(stats.file_exists);
    }

    #[tokio::test]
    async fn forget_with_zero_days_removes_every_entry_of_type() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(config_in(dir.path(), 10));
        for i in 0..3 {
            store.store("perception", json!(i));
        }
        store.store("action", json!("keep"));
        assert_eq!(store.forget("perception", 0).await, 3);
        assert_eq!(store.forget("perception", 30).await, 0);
        // the short-term tier still answers for the type
        assert_eq!(store.recall("perception", 10).unwrap().len(), 3);
        assert_eq!(store.statistics().total_memories, 1);

        let reopened = MemoryStore::open(store.config().clone());
        assert_eq!(reopened.recall("perception", 10), Some(Vec::new()));
        assert_eq!(reopened.recall("action", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_empties_all_tiers_and_disk() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(config_in(dir.path(), 10));
        store.store("x", json!(1));
        store.clear().await;
        assert!(store.recall("x", 10).is_none());
        assert!(store.recall(RECENT_CONTEXT, 10).is_none());
        let reopened = MemoryStore::open(store.config().clone());
        assert_eq!(reopened.statistics().total_memories, 0);
    }

    #[tokio::test]
    async fn every_tenth_store_persists_in_background() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(MemoryConfig {
            persist_every: 10,
            ..config_in(dir.path(), 100)
        });
        for i in 0..9 {
            store.store("x", json!(i));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!store.path().exists());
        store.store("x", json!(9));
        for _ in 0..100 {
            if store.path().exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let reopened = MemoryStore::open(store.config().clone());
        assert_eq!(reopened.statistics().total_memories, 10);
    }

    #[test]
    fn background_persist_runs_inline_without_runtime() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(MemoryConfig {
            persist_every: 2,
            ..config_in(dir.path(), 8)
        });
        store.store("x", json!(1));
        assert!(!store.path().exists());
        store.store("x", json!(2));
        assert!(store.path().exists());
    }

    #[test]
    fn corrupt_document_opens_empty() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path(), 4);
        std::fs::write(&config.path, b"{ not json").unwrap();
        let store = MemoryStore::open(config);
        assert_eq!(store.statistics().total_memories, 0);
        store.store("x", json!(1));
        assert_eq!(store.recall("x", 1).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stores_are_serialized() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(config_in(dir.path(), 1000));
        let mut tasks = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..2000 {
                    store.store("shared", json!({ "worker": worker, "i": i }));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.statistics().total_memories, 16_000);
        assert_eq!(
            store.index_offsets("shared").unwrap(),
            (0..16_000).collect::<Vec<_>>()
        );

        let buffered = store.recall("shared", 1000).unwrap();
        assert!(buffered.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        store.persist().await.unwrap();
        let snapshot = crate::long_term::read_snapshot(store.path())
            .unwrap()
            .unwrap();
        let history = &snapshot.long_term["shared"];
        assert_eq!(history.len(), 16_000);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn emptied_type_recalls_as_empty_list() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(config_in(dir.path(), 1));
        store.store("note", json!("old"));
        store.store("other", json!("pushes note out of short-term"));
        assert_eq!(store.forget("note", 0).await, 1);
        assert_eq!(store.recall("note", 10), Some(Vec::new()));
        assert_eq!(store.recall("never_seen", 10), None);
    }
}
