//! Typed attribute bags, schemas, and metadata filters.
//!
//! Metadata values are drawn from a closed set of field kinds rather than an
//! untyped dynamic map. Collections may declare a [`MetadataSchema`]; inserts
//! are then checked against it. [`MetadataFilter`] evaluates predicate trees
//! over the bag during search.

use crate::vector::Metadata;
use crate::{LatticeError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

// =============================================================================
// Field values and types
// =============================================================================

/// A typed metadata value.
///
/// Serializes to natural JSON: strings, numbers, booleans, arrays, objects,
/// and `{lat, lon}` geo points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean flag.
    Bool(bool),
    /// Numeric value; integers are widened to `f64`.
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence of values.
    Array(Vec<FieldValue>),
    /// Geographic point.
    Geo { lat: f64, lon: f64 },
    /// Nested mapping.
    Object(HashMap<String, FieldValue>),
}

impl FieldValue {
    /// Returns the field type of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Number(_) => FieldType::Number,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Array(_) => FieldType::Array,
            FieldValue::Geo { .. } => FieldType::Geo,
            FieldValue::Object(_) => FieldType::Object,
        }
    }

    /// Returns the value as a float if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as a string slice if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approx_size_bytes(&self) -> usize {
        match self {
            FieldValue::Bool(_) => 1,
            FieldValue::Number(_) => 8,
            FieldValue::String(s) => s.len(),
            FieldValue::Array(items) => items.iter().map(FieldValue::approx_size_bytes).sum(),
            FieldValue::Geo { .. } => 16,
            FieldValue::Object(map) => map
                .iter()
                .map(|(k, v)| k.len() + v.approx_size_bytes())
                .sum(),
        }
    }

    /// Compares two values when they share a comparable type.
    ///
    /// Numbers compare numerically, strings lexicographically; everything
    /// else is incomparable.
    fn partial_compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Number(a), FieldValue::Number(b)) => a.partial_cmp(b),
            (FieldValue::String(a), FieldValue::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// The kind of a metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Bool,
    Array,
    Object,
    Geo,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Geo => "geo",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Declared type and presence requirement for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Expected value kind.
    pub field_type: FieldType,
    /// Whether the field must be present on every vector.
    pub required: bool,
}

/// Typed schema for a collection's metadata.
///
/// Fields not declared in the schema are allowed and pass validation
/// unchecked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSchema {
    /// Declared fields by name.
    pub fields: HashMap<String, FieldSpec>,
}

impl MetadataSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an optional field.
    pub fn add_field(&mut self, name: impl Into<String>, field_type: FieldType) -> &mut Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: false,
            },
        );
        self
    }

    /// Declares a required field.
    pub fn add_required_field(
        &mut self,
        name: impl Into<String>,
        field_type: FieldType,
    ) -> &mut Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: true,
            },
        );
        self
    }

    /// Returns true if no fields are declared.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks the given metadata against the schema.
    pub fn validate(&self, metadata: Option<&Metadata>) -> Result<()> {
        for (name, spec) in &self.fields {
            let value = metadata.and_then(|m| m.get(name));
            match value {
                Some(value) => {
                    let actual = value.field_type();
                    if actual != spec.field_type {
                        return Err(LatticeError::SchemaViolation(format!(
                            "field {} has wrong type: expected {}, got {}",
                            name, spec.field_type, actual
                        )));
                    }
                }
                None if spec.required => {
                    return Err(LatticeError::SchemaViolation(format!(
                        "required field {} is missing",
                        name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Comparison operator for a single filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value is an object with optional `gte`/`lte` bounds.
    Range,
    /// Substring match on strings, membership on arrays.
    Contains,
}

/// A single filtering condition over a dot-separated field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Dot-separated path into the metadata bag.
    pub field: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Value to compare against.
    pub value: FieldValue,
}

impl FilterCondition {
    /// Builds an equality condition.
    pub fn equals(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    /// Builds a closed-range condition (`gte <= value <= lte`).
    pub fn range(
        field: impl Into<String>,
        min: impl Into<FieldValue>,
        max: impl Into<FieldValue>,
    ) -> Self {
        let mut bounds = HashMap::new();
        bounds.insert("gte".to_string(), min.into());
        bounds.insert("lte".to_string(), max.into());
        Self {
            field: field.into(),
            op: CompareOp::Range,
            value: FieldValue::Object(bounds),
        }
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        let path: Vec<&str> = self.field.split('.').collect();
        let value = match lookup_path(metadata, &path) {
            Some(v) => v,
            None => return false,
        };

        match self.op {
            CompareOp::Eq => value == &self.value,
            CompareOp::Neq => value != &self.value,
            CompareOp::Gt => matches!(value.partial_compare(&self.value), Some(Ordering::Greater)),
            CompareOp::Gte => matches!(
                value.partial_compare(&self.value),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            CompareOp::Lt => matches!(value.partial_compare(&self.value), Some(Ordering::Less)),
            CompareOp::Lte => matches!(
                value.partial_compare(&self.value),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            CompareOp::Range => {
                let bounds = match &self.value {
                    FieldValue::Object(map) => map,
                    _ => return false,
                };
                if let Some(min) = bounds.get("gte") {
                    if matches!(value.partial_compare(min), Some(Ordering::Less) | None) {
                        return false;
                    }
                }
                if let Some(max) = bounds.get("lte") {
                    if matches!(value.partial_compare(max), Some(Ordering::Greater) | None) {
                        return false;
                    }
                }
                true
            }
            CompareOp::Contains => match value {
                FieldValue::String(s) => self
                    .value
                    .as_str()
                    .map(|needle| s.contains(needle))
                    .unwrap_or(false),
                FieldValue::Array(items) => items.contains(&self.value),
                _ => false,
            },
        }
    }
}

/// How multiple conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    #[default]
    And,
    Or,
}

/// A predicate over a vector's metadata.
///
/// An empty filter matches everything; a vector without metadata matches
/// only the empty filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    /// Conditions to evaluate.
    pub conditions: Vec<FilterCondition>,
    /// Combination mode.
    #[serde(default)]
    pub operator: FilterOperator,
}

impl MetadataFilter {
    /// Builds a conjunction of conditions.
    pub fn and(conditions: Vec<FilterCondition>) -> Self {
        Self {
            conditions,
            operator: FilterOperator::And,
        }
    }

    /// Builds a disjunction of conditions.
    pub fn or(conditions: Vec<FilterCondition>) -> Self {
        Self {
            conditions,
            operator: FilterOperator::Or,
        }
    }

    /// Evaluates the filter against a metadata bag.
    pub fn matches(&self, metadata: Option<&Metadata>) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let metadata = match metadata {
            Some(m) => m,
            None => return false,
        };
        match self.operator {
            FilterOperator::And => self.conditions.iter().all(|c| c.matches(metadata)),
            FilterOperator::Or => self.conditions.iter().any(|c| c.matches(metadata)),
        }
    }
}

/// Resolves a dot-separated path through nested objects.
fn lookup_path<'a>(metadata: &'a Metadata, path: &[&str]) -> Option<&'a FieldValue> {
    let (first, rest) = path.split_first()?;
    let mut current = metadata.get(*first)?;
    for part in rest {
        match current {
            FieldValue::Object(map) => current = map.get(*part)?,
            _ => return None,
        }
    }
    Some(current)
}
