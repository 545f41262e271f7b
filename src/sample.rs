use serde::{Deserialize, Serialize};

use crate::dimension::{DimensionKey, FieldValue};

/// One dimensioned data point, as produced by a pull or by the event log.
///
/// Field positions are 1-based, matching the atom field numbering used by
/// data sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub key: DimensionKey,
    pub timestamp_ns: u64,
    #[serde(default)]
    pub fields: Vec<FieldValue>,
}

impl Sample {
    pub fn new(key: DimensionKey, timestamp_ns: u64, fields: Vec<FieldValue>) -> Self {
        Self {
            key,
            timestamp_ns,
            fields,
        }
    }

    /// Returns the field at the 1-based position `pos`.
    pub fn field(&self, pos: usize) -> Option<&FieldValue> {
        pos.checked_sub(1).and_then(|idx| self.fields.get(idx))
    }

    /// Returns the integer field at `pos`, or `None` when missing or not an integer.
    pub fn long(&self, pos: usize) -> Option<i64> {
        self.field(pos).and_then(FieldValue::as_i64)
    }
}
