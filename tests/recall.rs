//! HNSW recall against a brute-force oracle, through a full save/reopen
//! cycle.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use vecbase::collection::{Collection, CollectionConfig, HnswParams};
use vecbase::index::IndexKind;
use vecbase::metadata::Metadata;
use vecbase::metric::{DistanceMetric, Metric, L2};

const DIM: usize = 32;
const NUM_VECTORS: usize = 1000;
const NUM_QUERIES: usize = 100;
const K: usize = 10;
const EXPECTED_RECALL: f32 = 0.9;

fn random_vector(rng: &mut ChaCha8Rng) -> Vec<f32> {
    (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

#[test]
fn test_recall_at_10_after_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let vectors: Vec<Vec<f32>> = (0..NUM_VECTORS).map(|_| random_vector(&mut rng)).collect();
    let queries: Vec<Vec<f32>> = (0..NUM_QUERIES).map(|_| random_vector(&mut rng)).collect();

    // Build with modest parameters, snapshot, drop.
    {
        let config = CollectionConfig::new(DIM)
            .with_metric(DistanceMetric::L2)
            .with_index_kind(IndexKind::Hnsw)
            .with_hnsw(HnswParams {
                m: 8,
                m0: 16,
                ef_construction: 50,
                ef_search: 100,
            });
        let coll = Collection::open(dir.path(), config).expect("open");
        for (i, v) in vectors.iter().enumerate() {
            coll.insert(&format!("v{i}"), v, Metadata::new()).expect("insert");
        }
        coll.flush().expect("flush");
        coll.close().expect("close");
    }

    // Reopen from the snapshot and measure recall against brute force.
    let config = CollectionConfig::new(DIM)
        .with_index_kind(IndexKind::Hnsw)
        .with_hnsw(HnswParams {
            m: 8,
            m0: 16,
            ef_construction: 50,
            ef_search: 100,
        });
    let coll = Collection::open(dir.path(), config).expect("reopen");
    assert_eq!(coll.len().expect("len"), NUM_VECTORS);

    let mut found = 0usize;
    for query in &queries {
        // Oracle: exact top-k by linear scan.
        let mut scored: Vec<(f32, usize)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (L2::distance(query, v), i))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        let truth: HashSet<String> = scored[..K].iter().map(|(_, i)| format!("v{i}")).collect();

        let response = coll.search(query, K).expect("search");
        assert_eq!(response.results.len(), K);
        found += response
            .results
            .iter()
            .filter(|h| truth.contains(&h.id))
            .count();
    }

    #[allow(clippy::cast_precision_loss)]
    let recall = found as f32 / (NUM_QUERIES * K) as f32;
    println!("recall@{K}: {recall:.4} ({found}/{})", NUM_QUERIES * K);
    assert!(
        recall >= EXPECTED_RECALL,
        "recall {recall:.4} below {EXPECTED_RECALL}"
    );
}

#[test]
fn test_flat_matches_oracle_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    let vectors: Vec<Vec<f32>> = (0..200).map(|_| random_vector(&mut rng)).collect();
    let coll = Collection::open(
        dir.path(),
        CollectionConfig::new(DIM).with_index_kind(IndexKind::Flat),
    )
    .expect("open");
    for (i, v) in vectors.iter().enumerate() {
        coll.insert(&format!("v{i}"), v, Metadata::new()).expect("insert");
    }

    let query = random_vector(&mut rng);
    let mut scored: Vec<(f32, usize)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (L2::distance(&query, v), i))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));

    let response = coll.search(&query, 5).expect("search");
    for (hit, (dist, idx)) in response.results.iter().zip(scored.iter()) {
        assert_eq!(hit.id, format!("v{idx}"));
        assert!((hit.score - dist).abs() < 1e-5);
    }
}
