//! Structural validation of decoded value trees.
//!
//! Messages arrive as generic [`serde_json::Value`] trees. [`FieldReader`]
//! extracts typed fields from a map while recording every requirement the
//! tree fails, so a malformed message yields the complete list of
//! [`Violation`]s instead of stopping at the first problem.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Value};
use thiserror::Error;

/// Kind of value a field must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// A map with string keys.
    Map,
    /// A whole number.
    Integer,
    /// UTF-8 text.
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Map => "map",
            ValueKind::Integer => "integer",
            ValueKind::Text => "text",
        };
        f.write_str(name)
    }
}

/// A requirement imposed on some entity of a value tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// The entity must exist.
    Present,
    /// The entity must be of the given kind.
    Kind(ValueKind),
    /// The integer must lie within `min..=max`.
    Range {
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
    },
    /// The integer must be one of the listed values.
    OneOf(Vec<i64>),
    /// The text must be valid base64.
    Base64,
}

impl Requirement {
    /// Formal requirement name.
    pub fn name(&self) -> &'static str {
        match self {
            Requirement::Present => "present",
            Requirement::Kind(_) => "type",
            Requirement::Range { .. } => "range",
            Requirement::OneOf(_) => "one-of",
            Requirement::Base64 => "base64",
        }
    }

    /// Formal requirement parameters, rendered as text.
    pub fn parameters(&self) -> Vec<String> {
        match self {
            Requirement::Present | Requirement::Base64 => Vec::new(),
            Requirement::Kind(kind) => vec![kind.to_string()],
            Requirement::Range { min, max } => vec![min.to_string(), max.to_string()],
            Requirement::OneOf(values) => values.iter().map(i64::to_string).collect(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.parameters().join(", "))
    }
}

/// One violated requirement, with the path of the offending entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the violating entity, e.g. `body.lid`.
    pub entity: String,
    /// The requirement that was not met.
    pub requirement: Requirement,
}

impl Violation {
    /// Create a violation.
    pub fn new(entity: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            entity: entity.into(),
            requirement,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.requirement)
    }
}

/// A value tree failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema violated: {}", render(.violations))]
pub struct SchemaViolation {
    /// Every violated requirement, in discovery order.
    pub violations: Vec<Violation>,
}

impl SchemaViolation {
    /// Create from a list of violations.
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }
}

fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Typed field extraction from a map-shaped value tree.
///
/// Each accessor returns `None` when the field violates a requirement; the
/// violation is recorded and reported by [`FieldReader::finish`].
#[derive(Debug)]
pub struct FieldReader<'a> {
    map: Option<&'a Map<String, Value>>,
    path: String,
    violations: Vec<Violation>,
}

impl<'a> FieldReader<'a> {
    /// Start reading `value`, which must be a map, located at `path`.
    ///
    /// Use an empty path for the root of a tree.
    pub fn new(value: &'a Value, path: &str) -> Self {
        let mut violations = Vec::new();
        let map = value.as_object();
        if map.is_none() {
            violations.push(Violation::new(
                entity_name(path),
                Requirement::Kind(ValueKind::Map),
            ));
        }
        Self {
            map,
            path: path.to_string(),
            violations,
        }
    }

    fn entity(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.path)
        }
    }

    /// Raw access to an optional field. Absent and `null` both read as `None`.
    pub fn optional(&self, key: &str) -> Option<&'a Value> {
        self.map?.get(key).filter(|value| !value.is_null())
    }

    fn required(&mut self, key: &str) -> Option<&'a Value> {
        // A non-map root was already reported; don't pile on per-field noise.
        let map = self.map?;
        match map.get(key).filter(|value| !value.is_null()) {
            Some(value) => Some(value),
            None => {
                let entity = self.entity(key);
                self.violations.push(Violation::new(entity, Requirement::Present));
                None
            }
        }
    }

    /// Read a required integer in `min..=max`.
    pub fn integer(&mut self, key: &str, min: i64, max: i64) -> Option<i64> {
        let value = self.required(key)?;
        let Some(number) = value.as_i64() else {
            let entity = self.entity(key);
            self.violations
                .push(Violation::new(entity, Requirement::Kind(ValueKind::Integer)));
            return None;
        };
        if number < min || number > max {
            let entity = self.entity(key);
            self.violations
                .push(Violation::new(entity, Requirement::Range { min, max }));
            return None;
        }
        Some(number)
    }

    /// Read a required 32-bit integer.
    pub fn int32(&mut self, key: &str) -> Option<i32> {
        self.integer(key, i64::from(i32::MIN), i64::from(i32::MAX))
            .and_then(|number| i32::try_from(number).ok())
    }

    /// Read a required integer restricted to a closed set of values.
    pub fn one_of(&mut self, key: &str, allowed: &[i64]) -> Option<i64> {
        let value = self.required(key)?;
        match value.as_i64() {
            Some(number) if allowed.contains(&number) => Some(number),
            _ => {
                let entity = self.entity(key);
                self.violations
                    .push(Violation::new(entity, Requirement::OneOf(allowed.to_vec())));
                None
            }
        }
    }

    /// Read a required text field.
    pub fn text(&mut self, key: &str) -> Option<String> {
        let value = self.required(key)?;
        match value.as_str() {
            Some(text) => Some(text.to_string()),
            None => {
                let entity = self.entity(key);
                self.violations
                    .push(Violation::new(entity, Requirement::Kind(ValueKind::Text)));
                None
            }
        }
    }

    /// Read a required byte string, carried in the tree as base64 text.
    pub fn bytes(&mut self, key: &str) -> Option<Vec<u8>> {
        let text = self.text(key)?;
        match BASE64.decode(text.as_bytes()) {
            Ok(bytes) => Some(bytes),
            Err(_) => {
                let entity = self.entity(key);
                self.violations.push(Violation::new(entity, Requirement::Base64));
                None
            }
        }
    }

    /// Record that field `key` violates `requirement`.
    pub fn reject(&mut self, key: &str, requirement: Requirement) {
        let entity = self.entity(key);
        self.violations.push(Violation::new(entity, requirement));
    }

    /// Finish reading, failing if any requirement was violated.
    pub fn finish(self) -> Result<(), SchemaViolation> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaViolation::new(self.violations))
        }
    }

    /// Finish reading and hand back the value assembled from the fields.
    ///
    /// `value` is `None` exactly when some accessor recorded a violation.
    pub fn finish_with<T>(self, value: Option<T>) -> Result<T, SchemaViolation> {
        let root = entity_name(&self.path);
        self.finish()?;
        value.ok_or_else(|| SchemaViolation::new(vec![Violation::new(root, Requirement::Present)]))
    }
}

fn entity_name(path: &str) -> String {
    if path.is_empty() {
        "(root)".to_string()
    } else {
        path.to_string()
    }
}

/// Encode bytes the way [`FieldReader::bytes`] expects them.
pub fn encode_bytes(bytes: &[u8]) -> Value {
    Value::String(BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reads_valid_fields() {
        let tree = json!({"lid": 1, "msg": "hi", "dat": "aGVsbG8="});
        let mut reader = FieldReader::new(&tree, "");
        assert_eq!(reader.int32("lid"), Some(1));
        assert_eq!(reader.text("msg").as_deref(), Some("hi"));
        assert_eq!(reader.bytes("dat"), Some(b"hello".to_vec()));
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_collects_every_violation() {
        let tree = json!({"lid": "one", "dat": "%%%"});
        let mut reader = FieldReader::new(&tree, "body");
        assert_eq!(reader.int32("lid"), None);
        assert_eq!(reader.int32("bid"), None);
        assert_eq!(reader.bytes("dat"), None);

        let err = reader.finish().unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                Violation::new("body.lid", Requirement::Kind(ValueKind::Integer)),
                Violation::new("body.bid", Requirement::Present),
                Violation::new("body.dat", Requirement::Base64),
            ]
        );
    }

    #[test]
    fn test_non_map_root_is_single_violation() {
        let tree = json!([1, 2, 3]);
        let mut reader = FieldReader::new(&tree, "");
        assert_eq!(reader.text("msg"), None);
        let err = reader.finish().unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::new("(root)", Requirement::Kind(ValueKind::Map))]
        );
    }

    #[test]
    fn test_out_of_range_integer() {
        let tree = json!({"lid": 5_000_000_000_i64});
        let mut reader = FieldReader::new(&tree, "");
        assert_eq!(reader.int32("lid"), None);
        let err = reader.finish().unwrap_err();
        assert_eq!(err.violations[0].requirement.name(), "range");
    }

    #[test]
    fn test_one_of_rejects_unknown_tag() {
        let tree = json!({"type": 42});
        let mut reader = FieldReader::new(&tree, "");
        assert_eq!(reader.one_of("type", &[1, 2]), None);
        let err = reader.finish().unwrap_err();
        assert_eq!(err.to_string(), "schema violated: type: one-of(1, 2)");
    }

    #[test]
    fn test_null_counts_as_absent() {
        let tree = json!({"body": null});
        let reader = FieldReader::new(&tree, "");
        assert!(reader.optional("body").is_none());
    }
}
