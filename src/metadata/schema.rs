//! Optional insert-time schema validation.

use super::{Metadata, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Schema validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// A required field is absent from the metadata map.
    #[error("missing required field: {field}")]
    MissingField {
        /// The absent field.
        field: String,
    },

    /// A field value has the wrong type.
    #[error("field {field}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The offending field.
        field: String,
        /// Declared type.
        expected: FieldType,
        /// Observed value type.
        actual: String,
    },
}

/// Declared type of a metadata field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Boolean field.
    Bool,
    /// Integer field.
    Int,
    /// Float field. Integers are accepted and coerced.
    Float,
    /// String field.
    String,
    /// Timestamp field. Integers are accepted as epoch milliseconds.
    Timestamp,
    /// Array of strings (the common tags case).
    StringArray,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Timestamp => "timestamp",
            FieldType::StringArray => "string_array",
        };
        f.write_str(name)
    }
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Bool, Value::Bool(_))
            | (FieldType::Int, Value::Int(_))
            | (FieldType::Float, Value::Float(_) | Value::Int(_))
            | (FieldType::String, Value::String(_))
            | (FieldType::Timestamp, Value::Timestamp(_) | Value::Int(_)) => true,
            (FieldType::StringArray, Value::Array(items)) => {
                items.iter().all(|v| matches!(v, Value::String(_)))
            }
            _ => false,
        }
    }
}

/// Per-field declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Declared type.
    pub field_type: FieldType,
    /// Whether the field must be present on every entry.
    #[serde(default)]
    pub required: bool,
}

/// A collection-level metadata schema.
///
/// Validation is opt-in: fields not mentioned in the schema pass through
/// untouched, so a schema constrains only what it declares.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: HashMap<String, FieldSpec>,
}

impl Schema {
    /// Creates an empty schema that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field.
    #[must_use]
    pub fn with_field(mut self, name: &str, field_type: FieldType, required: bool) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSpec {
                field_type,
                required,
            },
        );
        self
    }

    /// Returns true when no fields are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validates a metadata map against the declared fields.
    pub fn validate(&self, metadata: &Metadata) -> Result<(), SchemaError> {
        for (name, spec) in &self.fields {
            match metadata.get(name) {
                None => {
                    if spec.required {
                        return Err(SchemaError::MissingField {
                            field: name.clone(),
                        });
                    }
                }
                Some(Value::Null) => {
                    // Null satisfies any optional declaration.
                    if spec.required {
                        return Err(SchemaError::MissingField {
                            field: name.clone(),
                        });
                    }
                }
                Some(value) => {
                    if !spec.field_type.accepts(value) {
                        return Err(SchemaError::TypeMismatch {
                            field: name.clone(),
                            expected: spec.field_type,
                            actual: value.type_name().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_empty_schema_accepts_anything() {
        let schema = Schema::new();
        let m = meta(&[("anything", Value::Int(1))]);
        assert!(schema.validate(&m).is_ok());
    }

    #[test]
    fn test_required_field_enforced() {
        let schema = Schema::new().with_field("category", FieldType::String, true);
        assert!(matches!(
            schema.validate(&Metadata::new()),
            Err(SchemaError::MissingField { .. })
        ));
        let m = meta(&[("category", Value::from("gpu"))]);
        assert!(schema.validate(&m).is_ok());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = Schema::new().with_field("price", FieldType::Float, false);
        let m = meta(&[("price", Value::from("cheap"))]);
        assert!(matches!(
            schema.validate(&m),
            Err(SchemaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_int_coerces_to_float_and_timestamp() {
        let schema = Schema::new()
            .with_field("price", FieldType::Float, false)
            .with_field("created", FieldType::Timestamp, false);
        let m = meta(&[("price", Value::Int(100)), ("created", Value::Int(1_700_000))]);
        assert!(schema.validate(&m).is_ok());
    }

    #[test]
    fn test_string_array_must_be_homogeneous() {
        let schema = Schema::new().with_field("tags", FieldType::StringArray, false);
        let good = meta(&[("tags", Value::from(vec!["a", "b"]))]);
        assert!(schema.validate(&good).is_ok());

        let bad = meta(&[(
            "tags",
            Value::Array(vec![Value::from("a"), Value::Int(1)]),
        )]);
        assert!(schema.validate(&bad).is_err());
    }
}
