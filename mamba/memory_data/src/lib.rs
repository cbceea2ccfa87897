#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Two-tier memory for the cognitive runtime: a bounded short-term buffer and an
//! append-only, type-partitioned long-term history persisted as JSON.

/// Long-term history, index, and on-disk snapshot format.
pub mod long_term;
/// Short-term ring buffer and the entry type.
pub mod short_term;

/// Store combining both tiers.
#[path = "../main.rs"]
pub mod store;

pub use long_term::{LongTermMemory, MemorySnapshot, MemoryStorageError};
pub use short_term::{MemoryEntry, ShortTermMemory};
pub use store::{MemoryConfig, MemoryStats, MemoryStore, RECENT_CONTEXT};
