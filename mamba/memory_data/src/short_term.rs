use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Single memory entry, stored in both tiers at once. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Category used for recall (`perception`, `action`, ...).
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Stored payload.
    pub data: serde_json::Value,
    /// Capture time.
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(entry_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            entry_type: entry_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Accepts RFC 3339 timestamps and offset-less ISO timestamps (read as UTC).
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f").map(|ts| ts.and_utc())
            })
            .map_err(D::Error::custom)
    }
}

/// Fixed-capacity FIFO of recent entries; the oldest entry is evicted on overflow.
#[derive(Debug, Clone)]
pub struct ShortTermMemory {
    capacity: usize,
    entries: VecDeque<MemoryEntry>,
}

impl ShortTermMemory {
    /// Creates a buffer holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry, returning the evicted one when the buffer was full.
    pub fn push(&mut self, entry: MemoryEntry) -> Option<MemoryEntry> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Last `limit` entries of the given type, oldest first.
    #[must_use]
    pub fn recent_of_type(&self, entry_type: &str, limit: usize) -> Vec<MemoryEntry> {
        let mut matches: Vec<MemoryEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|entry| entry.entry_type == entry_type)
            .take(limit)
            .cloned()
            .collect();
        matches.reverse();
        matches
    }

    /// Whether any entry has the given type.
    #[must_use]
    pub fn contains_type(&self, entry_type: &str) -> bool {
        self.entries.iter().any(|entry| entry.entry_type == entry_type)
    }

    /// Last `limit` entries regardless of type, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<MemoryEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Snapshot of all entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MemoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ShortTermMemory {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eleven_pushes_into_ten_slots_evict_the_first() {
        let mut memory = ShortTermMemory::new(10);
        for i in 1..=11 {
            let evicted = memory.push(MemoryEntry::new("x", json!(i)));
            assert_eq!(evicted.is_some(), i == 11);
        }
        assert_eq!(memory.len(), 10);
        let values: Vec<_> = memory.snapshot().into_iter().map(|e| e.data).collect();
        let expected: Vec<_> = (2..=11).map(|i| json!(i)).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn recent_of_type_keeps_chronological_order() {
        let mut memory = ShortTermMemory::new(8);
        for (kind, value) in [("a", 1), ("b", 2), ("a", 3), ("a", 4)] {
            memory.push(MemoryEntry::new(kind, json!(value)));
        }
        let values: Vec<_> = memory
            .recent_of_type("a", 2)
            .into_iter()
            .map(|e| e.data)
            .collect();
        assert_eq!(values, vec![json!(3), json!(4)]);
        assert!(memory.contains_type("b"));
        assert!(!memory.contains_type("c"));
        assert_eq!(memory.recent(3).len(), 3);
        assert_eq!(memory.recent(0).len(), 0);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut memory = ShortTermMemory::new(0);
        memory.push(MemoryEntry::new("x", json!(1)));
        memory.push(MemoryEntry::new("x", json!(2)));
        assert_eq!(memory.capacity(), 1);
        assert_eq!(memory.snapshot()[0].data, json!(2));
    }

    #[test]
    fn entries_accept_offsetless_timestamps() {
        let entry: MemoryEntry = serde_json::from_value(json!({
            "type": "perception",
            "data": { "value": 21.5 },
            "timestamp": "2025-01-05T10:15:30.123456"
        }))
        .unwrap();
        assert_eq!(entry.timestamp.to_rfc3339(), "2025-01-05T10:15:30.123456+00:00");
        let entry: MemoryEntry = serde_json::from_value(json!({
            "type": "action",
            "data": null,
            "timestamp": "2025-01-05T10:15:30Z"
        }))
        .unwrap();
        assert_eq!(entry.entry_type, "action");
    }
}
