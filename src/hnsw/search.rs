//! Layer descent and best-first beam expansion.

use super::graph::{HnswIndex, NodeId};
use crate::index::{validate_query, IndexError, Neighbor, SearchOptions};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

/// A node paired with its distance to the query.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Candidate {
    pub distance: f32,
    pub node: NodeId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.node == other.node
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties resolve by arena slot, i.e. insertion order.
        self.distance
            .total_cmp(&other.distance)
            .then(self.node.cmp(&other.node))
    }
}

impl HnswIndex {
    /// Greedy walk on one layer: repeatedly hop to the closest out-link
    /// until no link improves. Tombstoned nodes still route.
    pub(crate) fn greedy_closest(&self, query: &[f32], start: NodeId, level: u8) -> NodeId {
        let mut best = start;
        let mut best_dist = self.dist_to_query(query, best);
        loop {
            let mut improved = false;
            for &nb in self.links(best, level) {
                let d = self.dist_to_query(query, nb);
                if d < best_dist {
                    best = nb;
                    best_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return best;
            }
        }
    }

    /// Best-first expansion on one layer.
    ///
    /// Maintains a min-heap of nodes to visit and a max-heap of current
    /// results capped at `ef`; a visited set prevents re-expansion.
    /// Terminates when the nearest unvisited candidate is farther than the
    /// worst retained result. Tombstoned nodes are expanded (they keep the
    /// graph navigable) but never returned.
    ///
    /// Returns live candidates sorted ascending by distance.
    pub(crate) fn search_layer(
        &self,
        query: &[f32],
        entries: &[NodeId],
        ef: usize,
        level: u8,
    ) -> Vec<Candidate> {
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut to_visit: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entries {
            if !visited.insert(ep) {
                continue;
            }
            let candidate = Candidate {
                distance: self.dist_to_query(query, ep),
                node: ep,
            };
            to_visit.push(Reverse(candidate));
            if !self.is_deleted(ep) {
                results.push(candidate);
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(current)) = to_visit.pop() {
            if let Some(worst) = results.peek() {
                if current.distance > worst.distance && results.len() >= ef {
                    break;
                }
            }

            for &nb in self.links(current.node, level) {
                if !visited.insert(nb) {
                    continue;
                }
                let d = self.dist_to_query(query, nb);
                let admit = results.len() < ef
                    || results.peek().map_or(true, |worst| d < worst.distance);
                if !admit {
                    continue;
                }

                let candidate = Candidate { distance: d, node: nb };
                to_visit.push(Reverse(candidate));
                if !self.is_deleted(nb) {
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    pub(crate) fn search_impl(
        &self,
        query: &[f32],
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Neighbor>, IndexError> {
        validate_query(query, k, self.config.dimension)?;

        let Some(mut ep) = self.entry_point else {
            return Ok(Vec::new());
        };

        for level in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, level);
        }

        let ef = options.ef_search.unwrap_or(self.config.ef_search).max(k);
        let mut candidates = self.search_layer(query, &[ep], ef, 0);
        candidates.truncate(k);

        Ok(candidates
            .into_iter()
            .map(|c| Neighbor {
                id: self.nodes[c.node as usize].id.clone(),
                distance: c.distance,
            })
            .collect())
    }
}
