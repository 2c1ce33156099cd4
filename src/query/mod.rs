//! Query pipeline and fluent builder.
//!
//! A filtered search runs in stages: the ANN index returns an oversized
//! candidate set (sized from the filters' combined selectivity), filters
//! prune it cheapest-first while the ANN scores ride along, a score
//! threshold trims the tail, and the survivors are truncated to `k`.

use crate::collection::Collection;
use crate::error::Error;
use crate::filter::Filter;
use crate::metadata::{Metadata, Value};
use std::time::Duration;

/// Hard ceiling on the ANN overfetch.
pub const MAX_CANDIDATE_BUDGET: usize = 10_000;

/// One result row. Vector and metadata are deep copies; nothing aliases the
/// collection's internal storage.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    /// Entry id.
    pub id: String,
    /// Distance under the collection metric; smaller is closer.
    pub score: f32,
    /// The stored vector.
    pub vector: Vec<f32>,
    /// The stored metadata.
    pub metadata: Metadata,
}

/// A completed search.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResponse {
    /// Hits, closest first.
    pub results: Vec<SearchHit>,
    /// Wall-clock time spent.
    pub took: Duration,
    /// Matches found before truncation to the requested limit.
    pub total: usize,
}

/// A fully-specified query, ready for execution.
#[derive(Clone, Debug, Default)]
pub struct QuerySpec {
    /// ANN query vector; absent for pure metadata scans.
    pub vector: Option<Vec<f32>>,
    /// Filters, applied in ascending selectivity order.
    pub filters: Vec<Filter>,
    /// Result cap.
    pub k: usize,
    /// Keep only hits with score (distance) at or below this.
    pub threshold: Option<f32>,
    /// Per-query beam-width override.
    pub ef_search: Option<usize>,
}

/// ANN overfetch size: `k` scaled by the inverse of the filters' combined
/// selectivity, clamped to `[2k, 10_000]`.
#[must_use]
pub fn candidate_budget(k: usize, filters: &[Filter]) -> usize {
    let selectivity: f64 = filters
        .iter()
        .map(Filter::estimate_selectivity)
        .product::<f64>()
        .max(1e-4);
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = (k as f64 / selectivity).ceil() as usize;
    let floor = k.saturating_mul(2);
    let ceiling = MAX_CANDIDATE_BUDGET.max(floor);
    scaled.clamp(floor, ceiling)
}

/// Orders filters so the most selective (cheapest downstream) run first.
#[must_use]
pub fn order_by_selectivity(mut filters: Vec<Filter>) -> Vec<Filter> {
    filters.sort_by(|a, b| {
        a.estimate_selectivity()
            .partial_cmp(&b.estimate_selectivity())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    filters
}

enum GroupOp {
    And,
    Or,
}

/// Fluent query construction.
///
/// ```rust,no_run
/// # use vecbase::collection::{Collection, CollectionConfig};
/// # let coll = Collection::open("./data/demo", CollectionConfig::new(3)).unwrap();
/// let response = coll
///     .query()
///     .with_vector(&[1.0, 0.0, 0.0])
///     .eq("category", "electronics")
///     .gt("rating", 4.0)
///     .limit(5)
///     .execute()
///     .expect("query failed");
/// ```
///
/// `and()` / `or()` open a nested group closed by `end()`; filters added
/// in between combine under that group. Top-level filters combine as AND.
pub struct QueryBuilder<'a> {
    collection: &'a Collection,
    spec: QuerySpec,
    groups: Vec<(GroupOp, Vec<Filter>)>,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(collection: &'a Collection) -> Self {
        Self {
            collection,
            spec: QuerySpec {
                k: 10,
                ..Default::default()
            },
            groups: Vec::new(),
        }
    }

    fn push(mut self, filter: Filter) -> Self {
        if let Some((_, group)) = self.groups.last_mut() {
            group.push(filter);
        } else {
            self.spec.filters.push(filter);
        }
        self
    }

    /// Sets the ANN query vector.
    #[must_use]
    pub fn with_vector(mut self, vector: &[f32]) -> Self {
        self.spec.vector = Some(vector.to_vec());
        self
    }

    /// Adds a prebuilt filter.
    #[must_use]
    pub fn with_filter(self, filter: Filter) -> Self {
        self.push(filter)
    }

    /// `field == value`.
    #[must_use]
    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(Filter::eq(field, value))
    }

    /// `field > value`, strict.
    ///
    /// Ranges are inclusive, so strictness comes from intersecting the
    /// inclusive bound with the negated equality; the range leaf still
    /// rejects entries missing the field.
    #[must_use]
    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.push(Filter::and(vec![
            Filter::Range {
                field: field.to_string(),
                min: Some(value.clone()),
                max: None,
            },
            Filter::not(Filter::Equality {
                field: field.to_string(),
                value,
            }),
        ]))
    }

    /// `field < value`, strict.
    #[must_use]
    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.push(Filter::and(vec![
            Filter::Range {
                field: field.to_string(),
                min: None,
                max: Some(value.clone()),
            },
            Filter::not(Filter::Equality {
                field: field.to_string(),
                value,
            }),
        ]))
    }

    /// `min <= field <= max`, inclusive.
    #[must_use]
    pub fn between(self, field: &str, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.push(Filter::between(field, min, max))
    }

    /// Field contains any of `values`.
    #[must_use]
    pub fn contains_any(self, field: &str, values: Vec<Value>) -> Self {
        self.push(Filter::contains_any(field, values))
    }

    /// Field contains all of `values`.
    #[must_use]
    pub fn contains_all(self, field: &str, values: Vec<Value>) -> Self {
        self.push(Filter::contains_all(field, values))
    }

    /// Opens an AND group; close with [`QueryBuilder::end`].
    #[must_use]
    pub fn and(mut self) -> Self {
        self.groups.push((GroupOp::And, Vec::new()));
        self
    }

    /// Opens an OR group; close with [`QueryBuilder::end`].
    #[must_use]
    pub fn or(mut self) -> Self {
        self.groups.push((GroupOp::Or, Vec::new()));
        self
    }

    /// Closes the innermost group.
    #[must_use]
    pub fn end(mut self) -> Self {
        if let Some((op, children)) = self.groups.pop() {
            let combined = match op {
                GroupOp::And => Filter::and(children),
                GroupOp::Or => Filter::or(children),
            };
            self.push(combined)
        } else {
            self
        }
    }

    /// Negates `filter`.
    #[must_use]
    pub fn not(self, filter: Filter) -> Self {
        self.push(Filter::not(filter))
    }

    /// Caps the result count.
    #[must_use]
    pub fn limit(mut self, k: usize) -> Self {
        self.spec.k = k;
        self
    }

    /// Drops hits scoring (i.e. farther than) above `threshold`.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.spec.threshold = Some(threshold);
        self
    }

    /// Overrides the HNSW beam width for this query.
    #[must_use]
    pub fn with_ef_search(mut self, ef_search: usize) -> Self {
        self.spec.ef_search = Some(ef_search);
        self
    }

    /// Runs the query.
    pub fn execute(mut self) -> Result<SearchResponse, Error> {
        // Close any dangling groups rather than silently dropping them.
        while !self.groups.is_empty() {
            self = self.end();
        }
        for filter in &self.spec.filters {
            filter.validate()?;
        }
        self.collection.execute_spec(&self.spec)
    }
}
