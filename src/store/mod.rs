//! The in-memory entry store.
//!
//! An id-to-entry map hydrated from the WAL on open. The store itself is
//! not durable — the WAL is — so its only jobs are fast lookup and faithful
//! replay: applying the recovered record stream in order must reconstruct
//! exactly the map that existed at shutdown, with tombstones erasing the
//! inserts they follow.

use crate::metadata::Metadata;
use crate::wal::{WalOp, WalRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A stored vector with its metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    /// Unique, non-empty id.
    pub id: String,
    /// The vector. Length equals the collection dimension.
    pub vector: Vec<f32>,
    /// Arbitrary metadata.
    pub metadata: Metadata,
}

impl VectorEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(id: &str, vector: Vec<f32>, metadata: Metadata) -> Self {
        Self {
            id: id.to_string(),
            vector,
            metadata,
        }
    }

    /// Approximate heap footprint, used by memory accounting.
    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        let meta_bytes: usize = self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + value_bytes(v))
            .sum();
        self.id.len() + self.vector.len() * 4 + meta_bytes
    }
}

fn value_bytes(value: &crate::metadata::Value) -> usize {
    use crate::metadata::Value;
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) | Value::Timestamp(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_bytes).sum::<usize>() + 8,
    }
}

/// id -> entry map backed by the WAL.
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: HashMap<String, VectorEntry>,
    heap_bytes: usize,
}

impl EntryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store by replaying recovered WAL records in order.
    #[must_use]
    pub fn from_wal(records: &[WalRecord]) -> Self {
        let mut store = Self::new();
        for record in records {
            store.apply(record);
        }
        store
    }

    /// Applies one WAL record to the in-memory state.
    pub fn apply(&mut self, record: &WalRecord) {
        match record.op {
            WalOp::Insert => {
                let entry = VectorEntry::new(
                    &record.id,
                    record.vector.clone().unwrap_or_default(),
                    record.metadata.clone().unwrap_or_default(),
                );
                self.put(entry);
            }
            WalOp::Update => {
                if let Some(existing) = self.entries.get_mut(&record.id) {
                    self.heap_bytes -= existing.heap_bytes();
                    if let Some(vector) = &record.vector {
                        existing.vector.clone_from(vector);
                    }
                    if let Some(metadata) = &record.metadata {
                        // Shallow merge: incoming keys overwrite, unseen keys
                        // survive.
                        for (k, v) in metadata {
                            existing.metadata.insert(k.clone(), v.clone());
                        }
                    }
                    self.heap_bytes += existing.heap_bytes();
                }
            }
            WalOp::Delete => {
                self.remove(&record.id);
            }
        }
    }

    /// Inserts or replaces an entry.
    pub fn put(&mut self, entry: VectorEntry) {
        if let Some(old) = self.entries.remove(&entry.id) {
            self.heap_bytes -= old.heap_bytes();
        }
        self.heap_bytes += entry.heap_bytes();
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Looks up an entry by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&VectorEntry> {
        self.entries.get(id)
    }

    /// Removes an entry, returning it if present.
    pub fn remove(&mut self, id: &str) -> Option<VectorEntry> {
        let removed = self.entries.remove(id);
        if let Some(entry) = &removed {
            self.heap_bytes -= entry.heap_bytes();
        }
        removed
    }

    /// True when an entry with `id` exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &VectorEntry> {
        self.entries.values()
    }

    /// Approximate heap footprint of all entries.
    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes
    }
}
