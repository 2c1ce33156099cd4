//! Filter algebra: literal scenarios plus algebraic laws over random
//! metadata.

use proptest::prelude::*;
use std::collections::HashSet;
use vecbase::collection::{Collection, CollectionConfig};
use vecbase::filter::Filter;
use vecbase::metadata::{Metadata, Value};
use vecbase::store::VectorEntry;

fn meta(pairs: &[(&str, Value)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[test]
fn test_price_range_keeps_inclusive_band() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coll = Collection::open(dir.path(), CollectionConfig::new(2)).expect("open");

    for (i, price) in [50i64, 100, 150, 200].iter().enumerate() {
        coll.insert(
            &format!("p{price}"),
            &[i as f32, 0.0],
            meta(&[("price", Value::Int(*price))]),
        )
        .expect("insert");
    }

    let response = coll
        .query()
        .between("price", 100i64, 150i64)
        .limit(10)
        .execute()
        .expect("query");
    let mut ids: Vec<&str> = response.results.iter().map(|h| h.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["p100", "p150"]);
}

#[test]
fn test_contains_all_tags() {
    let black_white_red = VectorEntry::new(
        "a",
        vec![0.0],
        meta(&[("tags", Value::from(vec!["black", "white", "red"]))]),
    );
    let black_only = VectorEntry::new(
        "b",
        vec![0.0],
        meta(&[("tags", Value::from(vec!["black"]))]),
    );

    let filter = Filter::contains_all("tags", vec![Value::from("black"), Value::from("white")]);
    assert!(filter.matches(&black_white_red));
    assert!(!filter.matches(&black_only));
}

#[test]
fn test_filter_display_is_debuggable() {
    let filter = Filter::and(vec![
        Filter::eq("category", Value::from("electronics")),
        Filter::between("price", 10i64, 99i64),
        Filter::not(Filter::contains_any("tags", vec![Value::from("refurb")])),
    ]);
    let rendered = filter.to_string();
    assert!(rendered.contains("category"));
    assert!(rendered.contains("price in [10, 99]"));
    assert!(rendered.contains("not ("));
}

/// Entries with two small integer fields, enough to make filters overlap.
fn arb_entries() -> impl Strategy<Value = Vec<VectorEntry>> {
    prop::collection::vec((0u8..6, 0u8..6), 1..40).prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (x, y))| {
                VectorEntry::new(
                    &format!("e{i}"),
                    vec![0.0],
                    meta(&[
                        ("x", Value::Int(i64::from(x))),
                        ("y", Value::Int(i64::from(y))),
                    ]),
                )
            })
            .collect()
    })
}

fn id_set(entries: &[&VectorEntry]) -> HashSet<String> {
    entries.iter().map(|e| e.id.clone()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn and_is_commutative(entries in arb_entries(), a in 0u8..6, b in 0u8..6) {
        let refs: Vec<&VectorEntry> = entries.iter().collect();
        let fa = Filter::eq("x", Value::Int(i64::from(a)));
        let fb = Filter::between("y", i64::from(b), i64::from(b) + 2);

        let ab = Filter::and(vec![fa.clone(), fb.clone()]).apply(&refs);
        let ba = Filter::and(vec![fb, fa]).apply(&refs);
        prop_assert_eq!(id_set(&ab), id_set(&ba));
    }

    #[test]
    fn or_is_idempotent_under_duplicates(entries in arb_entries(), a in 0u8..6) {
        let refs: Vec<&VectorEntry> = entries.iter().collect();
        let f = Filter::eq("x", Value::Int(i64::from(a)));

        let once = Filter::or(vec![f.clone()]).apply(&refs);
        let tripled = Filter::or(vec![f.clone(), f.clone(), f]).apply(&refs);
        prop_assert_eq!(once.len(), tripled.len());
        prop_assert_eq!(id_set(&once), id_set(&tripled));
    }

    #[test]
    fn double_negation_is_identity(entries in arb_entries(), a in 0u8..6) {
        let refs: Vec<&VectorEntry> = entries.iter().collect();
        let f = Filter::eq("x", Value::Int(i64::from(a)));

        let direct = f.apply(&refs);
        let doubled = Filter::not(Filter::not(f)).apply(&refs);
        prop_assert_eq!(id_set(&direct), id_set(&doubled));
    }

    #[test]
    fn not_partitions_the_set(entries in arb_entries(), a in 0u8..6) {
        let refs: Vec<&VectorEntry> = entries.iter().collect();
        let f = Filter::eq("x", Value::Int(i64::from(a)));

        let kept = f.apply(&refs);
        let dropped = Filter::not(f).apply(&refs);
        prop_assert_eq!(kept.len() + dropped.len(), refs.len());
        let mut union = id_set(&kept);
        union.extend(id_set(&dropped));
        prop_assert_eq!(union.len(), refs.len());
    }

    #[test]
    fn selectivity_always_in_unit_interval(a in 0u8..6, b in 0u8..6) {
        let f = Filter::or(vec![
            Filter::and(vec![
                Filter::eq("x", Value::Int(i64::from(a))),
                Filter::gte("y", i64::from(b)),
            ]),
            Filter::not(Filter::contains_any("tags", vec![Value::from("t")])),
        ]);
        let s = f.estimate_selectivity();
        prop_assert!((0.0..=1.0).contains(&s));
    }
}
