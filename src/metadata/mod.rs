//! Metadata values and schema validation.
//!
//! Every entry carries a `field -> Value` map next to its vector. Values are
//! a tagged union with numeric-coercion equality so that filters written with
//! integer literals still match float-typed fields (and vice versa).

mod schema;
mod value;

pub use schema::{FieldType, Schema, SchemaError};
pub use value::Value;

use std::collections::HashMap;

/// Metadata attached to a vector entry.
pub type Metadata = HashMap<String, Value>;

/// Key set on tombstone records to mark an id as deleted.
pub const DELETED_KEY: &str = "_deleted";

/// Key carrying the deletion timestamp on tombstone records.
pub const DELETED_AT_KEY: &str = "_deleted_at";
