//! Two-phase insertion and the neighbor-selection heuristic.

use super::graph::{HnswIndex, Node, NodeId};
use super::search::Candidate;
use crate::index::IndexError;
use crate::quant::Quantizer as _;

impl HnswIndex {
    pub(crate) fn insert_impl(&mut self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        if id.is_empty() {
            return Err(IndexError::InvalidConfig("id must be non-empty".into()));
        }
        if vector.len() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        if self.by_id.contains_key(id) {
            return Err(IndexError::DuplicateId { id: id.to_string() });
        }
        if self.nodes.len() >= (u32::MAX as usize) - 1 {
            return Err(IndexError::InvalidConfig("node capacity exceeded".into()));
        }

        let level = self.random_level();

        let (stored, code) = match &self.quantizer {
            Some(q) if q.is_trained() => (Vec::new(), Some(q.compress(vector)?)),
            _ => (vector.to_vec(), None),
        };

        #[allow(clippy::cast_possible_truncation)]
        let new_node = self.nodes.len() as NodeId;
        self.nodes.push(Node {
            id: id.to_string(),
            vector: stored,
            code,
            level,
            links: vec![Vec::new(); level as usize + 1],
        });
        self.deleted.push(false);
        self.by_id.insert(id.to_string(), new_node);
        self.dirty = true;

        let Some(entry) = self.entry_point else {
            // First node becomes the entry point outright.
            self.entry_point = Some(new_node);
            self.max_level = level;
            return Ok(());
        };

        // Phase 1: greedy descent from the top layer down to level+1,
        // carrying the single closest node.
        let mut ep = entry;
        if self.max_level > level {
            for lc in (level + 1..=self.max_level).rev() {
                ep = self.greedy_closest(vector, ep, lc);
            }
        }

        // Phase 2: on each layer the new node occupies, collect candidates
        // with a construction-width beam, pick neighbors heuristically, and
        // connect in both directions.
        let top = level.min(self.max_level);
        for lc in (0..=top).rev() {
            let candidates = self.search_layer(vector, &[ep], self.config.ef_construction, lc);
            let next_ep = candidates.first().map(|c| c.node);

            let m_max = self.config.max_links(lc);
            let mut selected = self.select_neighbors(&candidates, m_max);
            // A neighbor below this layer can't hold the reverse edge, and a
            // one-way link would break symmetry at rest.
            selected.retain(|&n| (lc as usize) < self.nodes[n as usize].links.len());

            self.nodes[new_node as usize].links[lc as usize].clone_from(&selected);
            for &neighbor in &selected {
                self.connect_back(neighbor, new_node, lc);
            }

            if let Some(next) = next_ep {
                ep = next;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(new_node);
        }

        Ok(())
    }

    /// The classical selection heuristic.
    ///
    /// Walk candidates in ascending distance; keep one only if it is closer
    /// to the new node than to every neighbor already kept. Prefers a spread
    /// of directions over a tight clump.
    fn select_neighbors(&self, candidates: &[Candidate], m_max: usize) -> Vec<NodeId> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(m_max);
        for &candidate in candidates {
            if selected.len() >= m_max {
                break;
            }
            let dominated = selected
                .iter()
                .any(|kept| self.dist_between(candidate.node, kept.node) < candidate.distance);
            if !dominated {
                selected.push(candidate);
            }
        }
        selected.into_iter().map(|c| c.node).collect()
    }

    /// Adds the reverse edge `neighbor -> new_node`, pruning with the same
    /// heuristic if the neighbor's list overflows its layer cap.
    ///
    /// Any edge dropped here (including possibly the fresh one) has its
    /// mirror removed too, so links stay symmetric between live nodes.
    /// Tombstoned targets are scrubbed from the list while it is rewritten.
    fn connect_back(&mut self, neighbor: NodeId, new_node: NodeId, level: u8) {
        let lvl = level as usize;
        if lvl >= self.nodes[neighbor as usize].links.len() {
            // Neighbor doesn't reach this layer; nothing to wire.
            return;
        }

        let old = self.nodes[neighbor as usize].links[lvl].clone();
        let mut links: Vec<NodeId> = old
            .iter()
            .copied()
            .filter(|&n| !self.is_deleted(n))
            .collect();
        if !links.contains(&new_node) {
            links.push(new_node);
        }

        let m_max = self.config.max_links(level);
        let kept = if links.len() > m_max {
            self.prune_links(neighbor, &links, m_max)
        } else {
            links
        };

        for &dropped in old.iter().chain(std::iter::once(&new_node)) {
            if dropped == neighbor || kept.contains(&dropped) || self.is_deleted(dropped) {
                continue;
            }
            self.remove_link(dropped, neighbor, level);
        }

        self.nodes[neighbor as usize].links[lvl] = kept;
    }

    /// Re-selects `m_max` links for `target` from `links` via the heuristic.
    fn prune_links(&self, target: NodeId, links: &[NodeId], m_max: usize) -> Vec<NodeId> {
        let mut candidates: Vec<Candidate> = links
            .iter()
            .map(|&n| Candidate {
                distance: self.dist_between(target, n),
                node: n,
            })
            .collect();
        candidates.sort_unstable();
        self.select_neighbors(&candidates, m_max)
    }

    fn remove_link(&mut self, from: NodeId, to: NodeId, level: u8) {
        let lvl = level as usize;
        let node = &mut self.nodes[from as usize];
        if lvl < node.links.len() {
            node.links[lvl].retain(|&n| n != to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::HnswConfig;
    use crate::index::{SearchOptions, VectorIndex};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn filled_index(n: usize, dim: usize) -> HnswIndex {
        let mut rng = ChaCha8Rng::seed_from_u64(1234);
        let mut index = HnswIndex::new(HnswConfig::new(dim).with_m(8)).expect("new");
        for i in 0..n {
            let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            index.insert(&format!("n{i}"), &v).expect("insert");
        }
        index
    }

    /// Every link count must respect the per-layer cap.
    fn assert_degree_bounds(index: &HnswIndex) {
        for node in &index.nodes {
            for (lvl, links) in node.links.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let cap = index.config.max_links(lvl as u8);
                assert!(
                    links.len() <= cap,
                    "node {} level {lvl}: {} links exceeds cap {cap}",
                    node.id,
                    links.len()
                );
            }
        }
    }

    /// Every live-live edge must have its mirror.
    fn assert_symmetric(index: &HnswIndex) {
        for (slot, node) in index.nodes.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let this = slot as NodeId;
            if index.is_deleted(this) {
                continue;
            }
            for (lvl, links) in node.links.iter().enumerate() {
                for &other in links {
                    if index.is_deleted(other) {
                        continue;
                    }
                    #[allow(clippy::cast_possible_truncation)]
                    let back = index.links(other, lvl as u8);
                    assert!(
                        back.contains(&this),
                        "missing mirror edge {} -> {} at level {lvl}",
                        other,
                        this
                    );
                }
            }
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut index = HnswIndex::new(HnswConfig::new(2)).expect("new");
        index.insert("a", &[0.0, 0.0]).expect("insert");
        assert!(matches!(
            index.insert("a", &[1.0, 1.0]),
            Err(IndexError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_empty_id_rejected() {
        let mut index = HnswIndex::new(HnswConfig::new(2)).expect("new");
        assert!(index.insert("", &[0.0, 0.0]).is_err());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = HnswIndex::new(HnswConfig::new(3)).expect("new");
        assert!(matches!(
            index.insert("a", &[0.0, 0.0]),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_first_insert_becomes_entry_point() {
        let mut index = HnswIndex::new(HnswConfig::new(2)).expect("new");
        index.insert("a", &[0.5, 0.5]).expect("insert");
        assert_eq!(index.entry_point, Some(0));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_degree_bounds_hold_under_load() {
        let index = filled_index(500, 8);
        assert_degree_bounds(&index);
    }

    #[test]
    fn test_links_symmetric_at_rest() {
        let index = filled_index(300, 8);
        assert_symmetric(&index);
    }

    #[test]
    fn test_invariants_survive_deletes_and_more_inserts() {
        let mut index = filled_index(200, 8);
        for i in (0..200).step_by(3) {
            index.soft_delete(&format!("n{i}")).expect("delete");
        }
        let mut rng = ChaCha8Rng::seed_from_u64(77);
        for i in 200..300 {
            let v: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            index.insert(&format!("n{i}"), &v).expect("insert");
        }
        assert_degree_bounds(&index);
        assert_symmetric(&index);
    }

    #[test]
    fn test_reinsert_after_delete_allows_same_id() {
        let mut index = HnswIndex::new(HnswConfig::new(2)).expect("new");
        index.insert("a", &[0.0, 0.0]).expect("insert");
        index.soft_delete("a").expect("delete");
        index.insert("a", &[1.0, 1.0]).expect("reinsert");

        let hits = index
            .search(&[1.0, 1.0], 1, &SearchOptions::default())
            .expect("search");
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].distance < 1e-6);
    }

    #[test]
    fn test_single_dimension_vectors() {
        let mut index = HnswIndex::new(HnswConfig::new(1)).expect("new");
        for i in 0..50 {
            index.insert(&format!("n{i}"), &[i as f32]).expect("insert");
        }
        let hits = index
            .search(&[25.2], 1, &SearchOptions::default())
            .expect("search");
        assert_eq!(hits[0].id, "n25");
    }
}
