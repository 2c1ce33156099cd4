//! Metadata filter algebra.
//!
//! Filters prune ANN candidates by their metadata. Four node kinds compose
//! into a tree: equality, range, containment, and logical combinators.
//! Every node knows how to [`apply`](Filter::apply) itself to a candidate
//! set, [`validate`](Filter::validate) its own construction, and
//! [`estimate_selectivity`](Filter::estimate_selectivity) — the fraction of
//! entries it is expected to keep, which the query pipeline uses to order
//! filters cheapest-first and to size the ANN overfetch.

use crate::metadata::Value;
use crate::store::VectorEntry;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Filter construction and validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// Field name is empty.
    #[error("filter field must be non-empty")]
    EmptyField,

    /// An equality or containment filter was given a null value.
    #[error("filter on {field} has a null value")]
    NullValue {
        /// The offending field.
        field: String,
    },

    /// A range filter has no endpoints at all.
    #[error("range filter on {field} needs at least one endpoint")]
    UnboundedRange {
        /// The offending field.
        field: String,
    },

    /// Range endpoints are not mutually comparable.
    #[error("range endpoints on {field} are not comparable")]
    IncomparableEndpoints {
        /// The offending field.
        field: String,
    },

    /// A range endpoint has a type ranges cannot order.
    #[error("range filter on {field} does not support {type_name} endpoints")]
    UnsupportedEndpoint {
        /// The offending field.
        field: String,
        /// Type name of the endpoint.
        type_name: String,
    },

    /// A containment filter has no values to look for.
    #[error("containment filter on {field} needs at least one value")]
    EmptyContainment {
        /// The offending field.
        field: String,
    },

    /// And/Or with zero children.
    #[error("{op} requires at least one child")]
    EmptyChildren {
        /// The combinator name.
        op: &'static str,
    },

    /// Not with other than exactly one child.
    #[error("not requires exactly one child, got {got}")]
    NotArity {
        /// Number of children supplied.
        got: usize,
    },
}

/// How a containment filter matches array-valued fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainmentMode {
    /// Field contains at least one of the sought values.
    ContainsAny,
    /// Field contains every sought value.
    ContainsAll,
    /// Field equals the sought values as a multiset: same size, every
    /// element matched, order irrelevant.
    ExactMatch,
}

/// Logical combinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    /// Intersection; short-circuits on an empty intermediate result.
    And,
    /// Union, deduplicated by entry id.
    Or,
    /// Complement of exactly one child.
    Not,
}

/// A composable metadata filter.
///
/// Scalar field values are treated as one-element arrays by containment
/// filters, so `ContainsAny(category, ["a"])` works on a plain string field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    /// `field == value`, with numeric coercion across int/float widths.
    Equality {
        /// Metadata field.
        field: String,
        /// Value to match.
        value: Value,
    },
    /// `min <= field <= max`, inclusive on both ends. An absent endpoint is
    /// unbounded on that side. Accepts numeric, string (lexicographic), and
    /// timestamp values.
    Range {
        /// Metadata field.
        field: String,
        /// Lower bound, if any.
        min: Option<Value>,
        /// Upper bound, if any.
        max: Option<Value>,
    },
    /// Array membership under a [`ContainmentMode`].
    Containment {
        /// Metadata field.
        field: String,
        /// Sought values.
        values: Vec<Value>,
        /// Matching mode.
        mode: ContainmentMode,
    },
    /// And / Or / Not over child filters.
    Logical {
        /// The combinator.
        op: LogicalOp,
        /// Child filters.
        children: Vec<Filter>,
    },
}

impl Filter {
    /// `field == value`.
    #[must_use]
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Equality {
            field: field.to_string(),
            value: value.into(),
        }
    }

    /// `min <= field <= max`.
    #[must_use]
    pub fn between(field: &str, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Filter::Range {
            field: field.to_string(),
            min: Some(min.into()),
            max: Some(max.into()),
        }
    }

    /// `field >= min`.
    #[must_use]
    pub fn gte(field: &str, min: impl Into<Value>) -> Self {
        Filter::Range {
            field: field.to_string(),
            min: Some(min.into()),
            max: None,
        }
    }

    /// `field <= max`.
    #[must_use]
    pub fn lte(field: &str, max: impl Into<Value>) -> Self {
        Filter::Range {
            field: field.to_string(),
            min: None,
            max: Some(max.into()),
        }
    }

    /// Field contains any of `values`.
    #[must_use]
    pub fn contains_any(field: &str, values: Vec<Value>) -> Self {
        Filter::Containment {
            field: field.to_string(),
            values,
            mode: ContainmentMode::ContainsAny,
        }
    }

    /// Field contains all of `values`.
    #[must_use]
    pub fn contains_all(field: &str, values: Vec<Value>) -> Self {
        Filter::Containment {
            field: field.to_string(),
            values,
            mode: ContainmentMode::ContainsAll,
        }
    }

    /// Field equals `values` as a multiset.
    #[must_use]
    pub fn exact_match(field: &str, values: Vec<Value>) -> Self {
        Filter::Containment {
            field: field.to_string(),
            values,
            mode: ContainmentMode::ExactMatch,
        }
    }

    /// All children must match.
    #[must_use]
    pub fn and(children: Vec<Filter>) -> Self {
        Filter::Logical {
            op: LogicalOp::And,
            children,
        }
    }

    /// Any child may match.
    #[must_use]
    pub fn or(children: Vec<Filter>) -> Self {
        Filter::Logical {
            op: LogicalOp::Or,
            children,
        }
    }

    /// Complement of `child`.
    #[must_use]
    pub fn not(child: Filter) -> Self {
        Filter::Logical {
            op: LogicalOp::Not,
            children: vec![child],
        }
    }

    /// Validates the filter tree.
    pub fn validate(&self) -> Result<(), FilterError> {
        match self {
            Filter::Equality { field, value } => {
                if field.is_empty() {
                    return Err(FilterError::EmptyField);
                }
                if value.is_null() {
                    return Err(FilterError::NullValue {
                        field: field.clone(),
                    });
                }
                Ok(())
            }
            Filter::Range { field, min, max } => {
                if field.is_empty() {
                    return Err(FilterError::EmptyField);
                }
                if min.is_none() && max.is_none() {
                    return Err(FilterError::UnboundedRange {
                        field: field.clone(),
                    });
                }
                for endpoint in [min, max].into_iter().flatten() {
                    match endpoint {
                        Value::Int(_) | Value::Float(_) | Value::String(_) | Value::Timestamp(_) => {}
                        other => {
                            return Err(FilterError::UnsupportedEndpoint {
                                field: field.clone(),
                                type_name: other.type_name().to_string(),
                            })
                        }
                    }
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo.compare(hi).is_none() {
                        return Err(FilterError::IncomparableEndpoints {
                            field: field.clone(),
                        });
                    }
                }
                Ok(())
            }
            Filter::Containment { field, values, .. } => {
                if field.is_empty() {
                    return Err(FilterError::EmptyField);
                }
                if values.is_empty() {
                    return Err(FilterError::EmptyContainment {
                        field: field.clone(),
                    });
                }
                if values.iter().any(Value::is_null) {
                    return Err(FilterError::NullValue {
                        field: field.clone(),
                    });
                }
                Ok(())
            }
            Filter::Logical { op, children } => {
                match op {
                    LogicalOp::And | LogicalOp::Or => {
                        if children.is_empty() {
                            return Err(FilterError::EmptyChildren {
                                op: if *op == LogicalOp::And { "and" } else { "or" },
                            });
                        }
                    }
                    LogicalOp::Not => {
                        if children.len() != 1 {
                            return Err(FilterError::NotArity {
                                got: children.len(),
                            });
                        }
                    }
                }
                for child in children {
                    child.validate()?;
                }
                Ok(())
            }
        }
    }

    /// Whether one entry passes a leaf predicate.
    ///
    /// Logical nodes are handled set-wise in [`Filter::apply`]; this is the
    /// per-entry evaluation used by the leaves (and recursively for `Not`).
    #[must_use]
    pub fn matches(&self, entry: &VectorEntry) -> bool {
        match self {
            Filter::Equality { field, value } => entry
                .metadata
                .get(field)
                .is_some_and(|v| v.coerced_eq(value)),
            Filter::Range { field, min, max } => {
                let Some(v) = entry.metadata.get(field) else {
                    return false;
                };
                if let Some(lo) = min {
                    match v.compare(lo) {
                        Some(Ordering::Less) | None => return false,
                        _ => {}
                    }
                }
                if let Some(hi) = max {
                    match v.compare(hi) {
                        Some(Ordering::Greater) | None => return false,
                        _ => {}
                    }
                }
                true
            }
            Filter::Containment {
                field,
                values,
                mode,
            } => {
                let Some(v) = entry.metadata.get(field) else {
                    return false;
                };
                let elements = v.as_elements();
                match mode {
                    ContainmentMode::ContainsAny => values
                        .iter()
                        .any(|sought| elements.iter().any(|e| e.coerced_eq(sought))),
                    ContainmentMode::ContainsAll => values
                        .iter()
                        .all(|sought| elements.iter().any(|e| e.coerced_eq(sought))),
                    ContainmentMode::ExactMatch => {
                        if elements.len() != values.len() {
                            return false;
                        }
                        // Multiset match: each sought value consumes one
                        // distinct element.
                        let mut remaining: Vec<&Value> = elements;
                        for sought in values {
                            let Some(pos) =
                                remaining.iter().position(|e| e.coerced_eq(sought))
                            else {
                                return false;
                            };
                            remaining.swap_remove(pos);
                        }
                        true
                    }
                }
            }
            Filter::Logical { op, children } => match op {
                LogicalOp::And => children.iter().all(|c| c.matches(entry)),
                LogicalOp::Or => children.iter().any(|c| c.matches(entry)),
                LogicalOp::Not => children.first().map_or(true, |c| !c.matches(entry)),
            },
        }
    }

    /// Filters a candidate set.
    ///
    /// `And` applies children sequentially and short-circuits as soon as the
    /// intermediate set is empty; `Or` unions child results deduplicated by
    /// id; `Not` subtracts its child's matches.
    #[must_use]
    pub fn apply<'a>(&self, entries: &[&'a VectorEntry]) -> Vec<&'a VectorEntry> {
        match self {
            Filter::Logical { op, children } => match op {
                LogicalOp::And => {
                    let mut current: Vec<&VectorEntry> = entries.to_vec();
                    for child in children {
                        if current.is_empty() {
                            break;
                        }
                        current = child.apply(&current);
                    }
                    current
                }
                LogicalOp::Or => {
                    let mut seen: HashSet<&str> = HashSet::new();
                    let mut out = Vec::new();
                    for child in children {
                        for entry in child.apply(entries) {
                            if seen.insert(entry.id.as_str()) {
                                out.push(entry);
                            }
                        }
                    }
                    out
                }
                LogicalOp::Not => {
                    let Some(child) = children.first() else {
                        return entries.to_vec();
                    };
                    let excluded: HashSet<&str> =
                        child.apply(entries).iter().map(|e| e.id.as_str()).collect();
                    entries
                        .iter()
                        .copied()
                        .filter(|e| !excluded.contains(e.id.as_str()))
                        .collect()
                }
            },
            leaf => entries.iter().copied().filter(|e| leaf.matches(e)).collect(),
        }
    }

    /// Estimated fraction of entries this filter keeps, in `[0, 1]`.
    #[must_use]
    pub fn estimate_selectivity(&self) -> f64 {
        match self {
            Filter::Equality { .. } => 0.1,
            Filter::Range { min, max, .. } => {
                if min.is_some() && max.is_some() {
                    0.3
                } else {
                    0.5
                }
            }
            Filter::Containment { mode, .. } => match mode {
                ContainmentMode::ContainsAny => 0.4,
                ContainmentMode::ContainsAll => 0.2,
                ContainmentMode::ExactMatch => 0.1,
            },
            Filter::Logical { op, children } => match op {
                LogicalOp::And => children
                    .iter()
                    .map(Filter::estimate_selectivity)
                    .product::<f64>()
                    .clamp(0.0, 1.0),
                LogicalOp::Or => {
                    let miss: f64 = children
                        .iter()
                        .map(|c| 1.0 - c.estimate_selectivity())
                        .product();
                    (1.0 - miss).clamp(0.0, 1.0)
                }
                LogicalOp::Not => children
                    .first()
                    .map_or(1.0, |c| (1.0 - c.estimate_selectivity()).clamp(0.0, 1.0)),
            },
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equality { field, value } => write!(f, "{field} == {value}"),
            Filter::Range { field, min, max } => match (min, max) {
                (Some(lo), Some(hi)) => write!(f, "{field} in [{lo}, {hi}]"),
                (Some(lo), None) => write!(f, "{field} >= {lo}"),
                (None, Some(hi)) => write!(f, "{field} <= {hi}"),
                (None, None) => write!(f, "{field} unbounded"),
            },
            Filter::Containment {
                field,
                values,
                mode,
            } => {
                let mode_name = match mode {
                    ContainmentMode::ContainsAny => "contains_any",
                    ContainmentMode::ContainsAll => "contains_all",
                    ContainmentMode::ExactMatch => "exact_match",
                };
                write!(f, "{field} {mode_name} [")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Filter::Logical { op, children } => match op {
                LogicalOp::Not => {
                    write!(f, "not (")?;
                    if let Some(child) = children.first() {
                        write!(f, "{child}")?;
                    }
                    f.write_str(")")
                }
                _ => {
                    let joiner = if *op == LogicalOp::And { " and " } else { " or " };
                    f.write_str("(")?;
                    for (i, child) in children.iter().enumerate() {
                        if i > 0 {
                            f.write_str(joiner)?;
                        }
                        write!(f, "{child}")?;
                    }
                    f.write_str(")")
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    fn entry(id: &str, pairs: &[(&str, Value)]) -> VectorEntry {
        let metadata: Metadata = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        VectorEntry::new(id, vec![0.0], metadata)
    }

    fn ids<'a>(entries: &[&'a VectorEntry]) -> Vec<&'a str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_equality_numeric_coercion() {
        let e = entry("a", &[("rating", Value::Float(4.0))]);
        assert!(Filter::eq("rating", Value::Int(4)).matches(&e));
        assert!(!Filter::eq("rating", Value::Int(5)).matches(&e));
        assert!(!Filter::eq("missing", Value::Int(4)).matches(&e));
    }

    #[test]
    fn test_range_inclusive_both_ends() {
        let entries: Vec<VectorEntry> = [50, 100, 150, 200]
            .iter()
            .enumerate()
            .map(|(i, price)| entry(&format!("p{i}"), &[("price", Value::Int(*price))]))
            .collect();
        let refs: Vec<&VectorEntry> = entries.iter().collect();

        let filter = Filter::between("price", 100i64, 150i64);
        let kept = filter.apply(&refs);
        assert_eq!(ids(&kept), vec!["p1", "p2"]);
    }

    #[test]
    fn test_range_equal_endpoints() {
        let e = entry("a", &[("price", Value::Int(100))]);
        assert!(Filter::between("price", 100i64, 100i64).matches(&e));
    }

    #[test]
    fn test_range_one_sided_and_strings() {
        let e = entry("a", &[("name", Value::from("melon"))]);
        assert!(Filter::gte("name", "apple").matches(&e));
        assert!(!Filter::gte("name", "zebra").matches(&e));
        assert!(Filter::lte("name", "zebra").matches(&e));
    }

    #[test]
    fn test_range_incomparable_value_fails_match() {
        let e = entry("a", &[("price", Value::from("expensive"))]);
        // String value against numeric bounds never matches.
        assert!(!Filter::between("price", 1i64, 10i64).matches(&e));
    }

    #[test]
    fn test_range_timestamps() {
        let e = entry("a", &[("created", Value::Timestamp(1_500))]);
        assert!(Filter::between("created", Value::Timestamp(1_000), Value::Timestamp(2_000)).matches(&e));
        assert!(!Filter::gte("created", Value::Timestamp(1_600)).matches(&e));
    }

    #[test]
    fn test_containment_scalar_as_singleton() {
        let e = entry("a", &[("category", Value::from("gpu"))]);
        assert!(
            Filter::contains_any("category", vec![Value::from("gpu"), Value::from("cpu")])
                .matches(&e)
        );
    }

    #[test]
    fn test_contains_all() {
        let e = entry(
            "a",
            &[("tags", Value::from(vec!["black", "white", "red"]))],
        );
        assert!(
            Filter::contains_all("tags", vec![Value::from("black"), Value::from("white")])
                .matches(&e)
        );

        let short = entry("b", &[("tags", Value::from(vec!["black"]))]);
        assert!(
            !Filter::contains_all("tags", vec![Value::from("black"), Value::from("white")])
                .matches(&short)
        );
    }

    #[test]
    fn test_exact_match_is_multiset_equality() {
        let e = entry("a", &[("tags", Value::from(vec!["b", "a"]))]);
        // Order irrelevant.
        assert!(Filter::exact_match("tags", vec![Value::from("a"), Value::from("b")]).matches(&e));
        // Size must match.
        assert!(!Filter::exact_match("tags", vec![Value::from("a")]).matches(&e));

        // Multiplicity matters.
        let doubled = entry("b", &[("tags", Value::from(vec!["a", "a"]))]);
        assert!(
            !Filter::exact_match("tags", vec![Value::from("a"), Value::from("b")])
                .matches(&doubled)
        );
        assert!(
            Filter::exact_match("tags", vec![Value::from("a"), Value::from("a")])
                .matches(&doubled)
        );
    }

    #[test]
    fn test_and_commutative_or_dedups_not_involution() {
        let entries: Vec<VectorEntry> = (0..20)
            .map(|i| {
                entry(
                    &format!("e{i}"),
                    &[
                        ("x", Value::Int(i % 4)),
                        ("y", Value::Int(i % 3)),
                    ],
                )
            })
            .collect();
        let refs: Vec<&VectorEntry> = entries.iter().collect();

        let a = Filter::eq("x", Value::Int(1));
        let b = Filter::eq("y", Value::Int(2));

        // And(A, B) == And(B, A) as sets.
        let ab: HashSet<&str> = Filter::and(vec![a.clone(), b.clone()])
            .apply(&refs)
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        let ba: HashSet<&str> = Filter::and(vec![b.clone(), a.clone()])
            .apply(&refs)
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ab, ba);

        // Or with a duplicated child returns no duplicates.
        let or_dup = Filter::or(vec![a.clone(), a.clone()]).apply(&refs);
        let unique: HashSet<&str> = or_dup.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(or_dup.len(), unique.len());

        // Not(Not(F)) == F as sets.
        let f = Filter::eq("x", Value::Int(0));
        let direct: HashSet<&str> = f.apply(&refs).iter().map(|e| e.id.as_str()).collect();
        let doubled: HashSet<&str> = Filter::not(Filter::not(f))
            .apply(&refs)
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(direct, doubled);
    }

    #[test]
    fn test_validation_rules() {
        assert!(Filter::eq("f", Value::Int(1)).validate().is_ok());
        assert!(matches!(
            Filter::eq("f", Value::Null).validate(),
            Err(FilterError::NullValue { .. })
        ));
        assert!(matches!(
            Filter::and(vec![]).validate(),
            Err(FilterError::EmptyChildren { op: "and" })
        ));
        assert!(matches!(
            Filter::or(vec![]).validate(),
            Err(FilterError::EmptyChildren { op: "or" })
        ));
        assert!(matches!(
            Filter::Logical {
                op: LogicalOp::Not,
                children: vec![]
            }
            .validate(),
            Err(FilterError::NotArity { got: 0 })
        ));
        assert!(matches!(
            Filter::Range {
                field: "f".into(),
                min: None,
                max: None
            }
            .validate(),
            Err(FilterError::UnboundedRange { .. })
        ));
        // Incomparable endpoints: string vs int.
        assert!(matches!(
            Filter::Range {
                field: "f".into(),
                min: Some(Value::from("a")),
                max: Some(Value::Int(5))
            }
            .validate(),
            Err(FilterError::IncomparableEndpoints { .. })
        ));
        // Bool endpoints unsupported.
        assert!(matches!(
            Filter::Range {
                field: "f".into(),
                min: Some(Value::Bool(true)),
                max: None
            }
            .validate(),
            Err(FilterError::UnsupportedEndpoint { .. })
        ));
        // Invalid child fails the parent.
        assert!(Filter::and(vec![Filter::eq("f", Value::Null)])
            .validate()
            .is_err());
    }

    #[test]
    fn test_selectivity_constants_and_combinators() {
        assert!((Filter::eq("f", Value::Int(1)).estimate_selectivity() - 0.1).abs() < 1e-9);
        assert!(
            (Filter::between("f", 1i64, 2i64).estimate_selectivity() - 0.3).abs() < 1e-9
        );
        assert!((Filter::gte("f", 1i64).estimate_selectivity() - 0.5).abs() < 1e-9);
        assert!(
            (Filter::contains_any("f", vec![Value::Int(1)]).estimate_selectivity() - 0.4).abs()
                < 1e-9
        );
        assert!(
            (Filter::contains_all("f", vec![Value::Int(1)]).estimate_selectivity() - 0.2).abs()
                < 1e-9
        );
        assert!(
            (Filter::exact_match("f", vec![Value::Int(1)]).estimate_selectivity() - 0.1).abs()
                < 1e-9
        );

        let a = Filter::eq("f", Value::Int(1)); // 0.1
        let b = Filter::gte("g", 1i64); // 0.5
        assert!(
            (Filter::and(vec![a.clone(), b.clone()]).estimate_selectivity() - 0.05).abs() < 1e-9
        );
        // Or: 1 - (1-0.1)(1-0.5) = 0.55
        assert!((Filter::or(vec![a.clone(), b]).estimate_selectivity() - 0.55).abs() < 1e-9);
        assert!((Filter::not(a).estimate_selectivity() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(
            Filter::eq("category", Value::from("gpu")).to_string(),
            "category == \"gpu\""
        );
        assert_eq!(
            Filter::between("price", 100i64, 150i64).to_string(),
            "price in [100, 150]"
        );
        let composed = Filter::and(vec![
            Filter::eq("a", Value::Int(1)),
            Filter::not(Filter::eq("b", Value::Int(2))),
        ]);
        assert_eq!(composed.to_string(), "(a == 1 and not (b == 2))");
    }
}
