//! Index snapshot durability: corruption detection, atomicity, version
//! handling, and search equivalence across save/load.

use std::fs;
use vecbase::collection::{Collection, CollectionConfig, INDEX_FILE};
use vecbase::hnsw::{persist, HnswConfig, HnswIndex};
use vecbase::index::{IndexKind, SearchOptions, VectorIndex};
use vecbase::metadata::Metadata;

fn filled_index(n: usize, dim: usize) -> HnswIndex {
    let mut index = HnswIndex::new(HnswConfig::new(dim).with_m(8)).expect("new index");
    for i in 0..n {
        let v: Vec<f32> = (0..dim)
            .map(|j| ((i * 31 + j * 7) % 97) as f32 / 97.0)
            .collect();
        index.insert(&format!("n{i}"), &v).expect("insert");
    }
    index
}

#[test]
fn test_truncated_snapshot_is_corruption_and_file_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index.vbix");

    let mut index = filled_index(300, 8);
    index.save(&path).expect("save");

    // Chop the last 16 bytes off.
    let intact = fs::read(&path).expect("read");
    fs::write(&path, &intact[..intact.len() - 16]).expect("truncate");
    let mangled = fs::read(&path).expect("reread");

    let mut fresh = HnswIndex::new(HnswConfig::new(8).with_m(8)).expect("new");
    let result = fresh.load(&path);
    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(err.is_corruption(), "expected corruption, got {err}");

    // Load must not repair or rewrite anything.
    let after = fs::read(&path).expect("read after failed load");
    assert_eq!(after, mangled);
}

#[test]
fn test_crc_field_sits_at_offset_48() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index.vbix");

    let mut index = filled_index(50, 4);
    index.save(&path).expect("save");

    let data = fs::read(&path).expect("read");
    let stored = u32::from_le_bytes(data[48..52].try_into().expect("4 bytes"));
    let computed = crc32fast::hash(&data[52..]);
    assert_eq!(stored, computed, "CRC at offset 48 must cover bytes after it");

    // Flipping any covered byte must break the stored CRC.
    let mut broken = data.clone();
    broken[60] ^= 0xA5;
    assert_ne!(crc32fast::hash(&broken[52..]), stored);
}

#[test]
fn test_save_load_search_equivalence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index.vbix");

    let mut index = filled_index(500, 16);
    for i in (0..500).step_by(7) {
        index.soft_delete(&format!("n{i}")).expect("delete");
    }
    index.save(&path).expect("save");

    let mut reopened = HnswIndex::new(HnswConfig::new(16).with_m(8)).expect("new");
    reopened.load(&path).expect("load");
    assert_eq!(reopened.len(), index.len());

    for q in 0..20 {
        let query: Vec<f32> = (0..16).map(|j| ((q * 13 + j * 5) % 89) as f32 / 89.0).collect();
        let before = index
            .search(&query, 10, &SearchOptions::default())
            .expect("search before");
        let after = reopened
            .search(&query, 10, &SearchOptions::default())
            .expect("search after");
        assert_eq!(before, after, "query {q} diverged after reload");
    }
}

#[test]
fn test_bad_magic_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index.vbix");

    let mut index = filled_index(20, 4);
    index.save(&path).expect("save");

    let mut data = fs::read(&path).expect("read");
    data[..4].copy_from_slice(b"JUNK");
    fs::write(&path, &data).expect("mangle");

    let mut fresh = HnswIndex::new(HnswConfig::new(4).with_m(8)).expect("new");
    assert!(fresh.load(&path).expect_err("must fail").is_corruption());
}

#[test]
fn test_legacy_version_loads_read_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index.vbix");

    let mut index = filled_index(30, 4);
    index.save(&path).expect("save");

    let mut data = fs::read(&path).expect("read");
    data[4..6].copy_from_slice(&persist::VERSION_LEGACY.to_le_bytes());
    fs::write(&path, &data).expect("rewrite");

    let mut legacy = HnswIndex::new(HnswConfig::new(4).with_m(8)).expect("new");
    legacy.load(&path).expect("legacy load");

    // Reads fine, writes refused.
    assert!(!legacy
        .search(&[0.1, 0.2, 0.3, 0.4], 3, &SearchOptions::default())
        .expect("search")
        .is_empty());
    assert!(legacy.insert("new", &[0.0; 4]).is_err());
}

#[test]
fn test_collection_save_load_index_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coll = Collection::open(
        dir.path(),
        CollectionConfig::new(4).with_index_kind(IndexKind::Hnsw),
    )
    .expect("open");

    for i in 0..100 {
        let v = [i as f32, (i % 7) as f32, (i % 3) as f32, 1.0];
        coll.insert(&format!("n{i}"), &v, Metadata::new()).expect("insert");
    }

    let snapshot = dir.path().join("explicit.vbix");
    coll.save_index(&snapshot).expect("save_index");
    assert!(snapshot.exists());

    let before = coll.search(&[50.0, 1.0, 2.0, 1.0], 5).expect("search");
    coll.load_index(&snapshot).expect("load_index");
    let after = coll.search(&[50.0, 1.0, 2.0, 1.0], 5).expect("search");

    let ids = |r: &vecbase::SearchResponse| -> Vec<String> {
        r.results.iter().map(|h| h.id.clone()).collect()
    };
    assert_eq!(ids(&before), ids(&after));
}

#[test]
fn test_corrupt_collection_snapshot_rebuilds_from_wal() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let coll = Collection::open(
            dir.path(),
            CollectionConfig::new(2).with_index_kind(IndexKind::Hnsw),
        )
        .expect("open");
        for i in 0..50 {
            coll.insert(&format!("n{i}"), &[i as f32, 0.5], Metadata::new())
                .expect("insert");
        }
        coll.flush().expect("flush");
    }

    // Corrupt the snapshot; the WAL remains good.
    let snapshot = dir.path().join(INDEX_FILE);
    let data = fs::read(&snapshot).expect("read");
    fs::write(&snapshot, &data[..data.len() / 2]).expect("truncate");

    let coll = Collection::open(
        dir.path(),
        CollectionConfig::new(2).with_index_kind(IndexKind::Hnsw),
    )
    .expect("reopen rebuilds");
    assert_eq!(coll.len().expect("len"), 50);
    let response = coll.search(&[25.0, 0.5], 1).expect("search");
    assert_eq!(response.results[0].id, "n25");
}
