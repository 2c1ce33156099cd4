//! Brute-force index.
//!
//! A linear scan over every stored vector. Exact by construction, and the
//! fastest option below ~10k entries, where graph traversal overhead exceeds
//! the cost of just looking at everything.

use super::container;
use super::{validate_query, IndexError, IndexKind, Neighbor, SearchOptions, VectorIndex};
use crate::metric::DistanceMetric;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const MAGIC: [u8; 4] = *b"VBFL";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FlatEntry {
    id: String,
    vector: Vec<f32>,
    /// Insertion sequence, the distance tie-break.
    seq: u64,
}

#[derive(Serialize, Deserialize)]
struct FlatBody {
    dimension: usize,
    metric: DistanceMetric,
    entries: Vec<FlatEntry>,
    next_seq: u64,
}

/// Exact nearest-neighbor index over a flat array.
pub struct FlatIndex {
    dimension: usize,
    metric: DistanceMetric,
    entries: Vec<FlatEntry>,
    by_id: HashMap<String, usize>,
    next_seq: u64,
    dirty: bool,
    closed: bool,
}

impl FlatIndex {
    /// Creates an empty flat index.
    #[must_use]
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            entries: Vec::new(),
            by_id: HashMap::new(),
            next_seq: 0,
            dirty: false,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<(), IndexError> {
        if self.closed {
            Err(IndexError::Closed)
        } else {
            Ok(())
        }
    }

    fn reindex(&mut self) {
        self.by_id = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        self.check_open()?;
        if id.is_empty() {
            return Err(IndexError::InvalidConfig("id must be non-empty".into()));
        }
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if self.by_id.contains_key(id) {
            return Err(IndexError::DuplicateId { id: id.to_string() });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(id.to_string(), self.entries.len());
        self.entries.push(FlatEntry {
            id: id.to_string(),
            vector: vector.to_vec(),
            seq,
        });
        self.dirty = true;
        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        _options: &SearchOptions,
    ) -> Result<Vec<Neighbor>, IndexError> {
        self.check_open()?;
        validate_query(query, k, self.dimension)?;

        let mut scored: Vec<(f32, u64, &FlatEntry)> = self
            .entries
            .iter()
            .map(|e| (self.metric.distance(query, &e.vector), e.seq, e))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, _, e)| Neighbor {
                id: e.id.clone(),
                distance,
            })
            .collect())
    }

    fn delete(&mut self, id: &str) -> Result<(), IndexError> {
        self.check_open()?;
        let pos = *self
            .by_id
            .get(id)
            .ok_or_else(|| IndexError::NotFound { id: id.to_string() })?;
        self.entries.remove(pos);
        self.reindex();
        self.dirty = true;
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn memory_usage(&self) -> usize {
        let entries: usize = self
            .entries
            .iter()
            .map(|e| e.id.len() + e.vector.capacity() * 4 + 8)
            .sum();
        let ids: usize = self.by_id.keys().map(|k| k.len() + 8).sum();
        std::mem::size_of::<Self>() + entries + ids
    }

    fn save(&mut self, path: &Path) -> Result<(), IndexError> {
        self.check_open()?;
        let body = FlatBody {
            dimension: self.dimension,
            metric: self.metric,
            entries: self.entries.clone(),
            next_seq: self.next_seq,
        };
        let bytes =
            postcard::to_allocvec(&body).map_err(|e| IndexError::Corruption(e.to_string()))?;
        container::write_atomic(
            path,
            MAGIC,
            self.dimension,
            metric_code(self.metric),
            self.entries.len() as u64,
            &bytes,
        )?;
        self.dirty = false;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<(), IndexError> {
        self.check_open()?;
        let (header, bytes) = container::read_verified(path, MAGIC)?;
        let body: FlatBody = postcard::from_bytes(&bytes)
            .map_err(|e| IndexError::Corruption(format!("undecodable body: {e}")))?;
        if body.entries.len() as u64 != header.count {
            return Err(IndexError::Corruption(format!(
                "entry count mismatch: header {}, body {}",
                header.count,
                body.entries.len()
            )));
        }
        self.dimension = body.dimension;
        self.metric = body.metric;
        self.entries = body.entries;
        self.next_seq = body.next_seq;
        self.reindex();
        self.dirty = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IndexError> {
        self.closed = true;
        self.entries.clear();
        self.by_id.clear();
        Ok(())
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

fn metric_code(metric: DistanceMetric) -> u32 {
    match metric {
        DistanceMetric::L2 => 0,
        DistanceMetric::InnerProduct => 1,
        DistanceMetric::Cosine => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> FlatIndex {
        let mut index = FlatIndex::new(2, DistanceMetric::L2);
        for i in 0..n {
            index
                .insert(&format!("n{i}"), &[i as f32, 0.0])
                .expect("insert");
        }
        index
    }

    #[test]
    fn test_exact_nearest() {
        let index = filled(100);
        let hits = index
            .search(&[40.2, 0.0], 3, &SearchOptions::default())
            .expect("search");
        assert_eq!(hits[0].id, "n40");
        assert_eq!(hits[1].id, "n41");
        assert_eq!(hits[2].id, "n39");
    }

    #[test]
    fn test_tiebreak_is_insertion_order() {
        let mut index = FlatIndex::new(2, DistanceMetric::L2);
        index.insert("b-first", &[1.0, 1.0]).expect("insert");
        index.insert("a-second", &[1.0, 1.0]).expect("insert");
        let hits = index
            .search(&[1.0, 1.0], 2, &SearchOptions::default())
            .expect("search");
        assert_eq!(hits[0].id, "b-first");
        assert_eq!(hits[1].id, "a-second");
    }

    #[test]
    fn test_delete_then_search() {
        let mut index = filled(10);
        index.delete("n3").expect("delete");
        assert_eq!(index.len(), 9);
        let hits = index
            .search(&[3.0, 0.0], 1, &SearchOptions::default())
            .expect("search");
        assert_ne!(hits[0].id, "n3");
        assert!(matches!(
            index.delete("n3"),
            Err(IndexError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut index = filled(3);
        assert!(matches!(
            index.insert("n1", &[9.0, 9.0]),
            Err(IndexError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flat.vbfl");

        let mut index = filled(50);
        index.delete("n7").expect("delete");
        index.save(&path).expect("save");

        let mut reopened = FlatIndex::new(2, DistanceMetric::L2);
        reopened.load(&path).expect("load");
        assert_eq!(reopened.len(), 49);

        let before = index
            .search(&[20.0, 0.0], 5, &SearchOptions::default())
            .expect("search");
        let after = reopened
            .search(&[20.0, 0.0], 5, &SearchOptions::default())
            .expect("search");
        assert_eq!(before, after);
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flat.vbfl");
        let mut index = filled(5);
        index.save(&path).expect("save");

        let data = std::fs::read(&path).expect("read");
        std::fs::write(&path, &data[..data.len() - 4]).expect("truncate");

        let mut reopened = FlatIndex::new(2, DistanceMetric::L2);
        assert!(matches!(
            reopened.load(&path),
            Err(IndexError::Corruption(_))
        ));
    }
}
