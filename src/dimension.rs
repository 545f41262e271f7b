use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single typed field value carried by a sample or a dimension key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Returns the integer value, if this field holds one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) => 1,
            Self::Float(_) => 2,
            Self::Str(_) => 3,
        }
    }

    /// Rough heap + inline footprint in bytes.
    pub fn byte_size(&self) -> usize {
        let heap = match self {
            Self::Str(s) => s.len(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + heap
    }
}

// Floats compare by bit pattern so the type can be a map key.
impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Bool(v) => v.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Str(v) => v.hash(state),
        }
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// One `(field position, value)` component of a dimension key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionPart {
    pub field: u32,
    pub value: FieldValue,
}

/// Identifies one slice of a metric.
///
/// Keys are immutable and cheap to clone; the empty key is the default
/// dimension used by unsliced metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionKey(Arc<[DimensionPart]>);

impl Default for DimensionKey {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl DimensionKey {
    /// Builds a key from `(field, value)` pairs, in the given order.
    pub fn new<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = (u32, V)>,
        V: Into<FieldValue>,
    {
        let parts: Vec<DimensionPart> = parts
            .into_iter()
            .map(|(field, value)| DimensionPart {
                field,
                value: value.into(),
            })
            .collect();
        Self(Arc::from(parts))
    }

    /// Whether this is the default (unsliced) key.
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parts(&self) -> &[DimensionPart] {
        &self.0
    }

    /// Rough footprint in bytes, shared storage counted once per key.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .0
                .iter()
                .map(|p| std::mem::size_of::<u32>() + p.value.byte_size())
                .sum::<usize>()
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("DEFAULT");
        }
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}={}", part.field, part.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_dimension_key_as_map_key() {
        let mut map: HashMap<DimensionKey, u32> = HashMap::new();
        let key = DimensionKey::new([(1, FieldValue::from("wifi")), (2, FieldValue::Int(7))]);
        map.insert(key.clone(), 42);
        assert_eq!(map.get(&key), Some(&42));
    }

    #[test]
    fn test_dimension_key_equality() {
        let a = DimensionKey::new([(1, 10i64)]);
        let b = DimensionKey::new([(1, 10i64)]);
        let c = DimensionKey::new([(1, 11i64)]);
        let d = DimensionKey::new([(2, 10i64)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_float_values_hash_by_bits() {
        let mut map: HashMap<FieldValue, u32> = HashMap::new();
        map.insert(FieldValue::Float(1.5), 1);
        assert_eq!(map.get(&FieldValue::Float(1.5)), Some(&1));
        assert_ne!(FieldValue::Float(0.0), FieldValue::Float(-0.0));
        assert_eq!(FieldValue::Float(f64::NAN), FieldValue::Float(f64::NAN));
    }

    #[test]
    fn test_mixed_types_order_by_kind() {
        let mut values = vec![
            FieldValue::from("a"),
            FieldValue::Float(0.5),
            FieldValue::Int(3),
            FieldValue::Bool(true),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                FieldValue::Bool(true),
                FieldValue::Int(3),
                FieldValue::Float(0.5),
                FieldValue::from("a"),
            ]
        );
    }

    #[test]
    fn test_default_key_display() {
        assert_eq!(DimensionKey::default().to_string(), "DEFAULT");
        assert!(DimensionKey::default().is_default());

        let key = DimensionKey::new([(1, FieldValue::from("wifi")), (3, FieldValue::Int(2))]);
        assert_eq!(key.to_string(), "1=wifi|3=2");
        assert!(!key.is_default());
    }

    #[test]
    fn test_field_value_untagged_yaml() {
        let values: Vec<FieldValue> =
            serde_yaml::from_str("[10, \"some value\", 1.25, true]").expect("valid yaml");
        assert_eq!(
            values,
            vec![
                FieldValue::Int(10),
                FieldValue::from("some value"),
                FieldValue::Float(1.25),
                FieldValue::Bool(true),
            ]
        );
    }

    #[test]
    fn test_dimension_key_serializes_as_parts() {
        let key = DimensionKey::new([(1, 10i64)]);
        let json = serde_json::to_string(&key).expect("serialize");
        assert_eq!(json, r#"[{"field":1,"value":10}]"#);
    }
}
