//! Primary keys and index values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Primary key of a record.
///
/// Records are keyed by their `id` field, which may be a string or an
/// integer. Both normalise to the same textual key, so `7` and `"7"` address
/// the same record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    /// Creates a key from its textual form.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Extracts a key from a JSON value.
    ///
    /// Returns `None` for anything other than a string or an integer.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Returns the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<i64> for RecordKey {
    fn from(key: i64) -> Self {
        Self(key.to_string())
    }
}

impl From<u64> for RecordKey {
    fn from(key: u64) -> Self {
        Self(key.to_string())
    }
}

impl From<i32> for RecordKey {
    fn from(key: i32) -> Self {
        Self(key.to_string())
    }
}

impl From<&RecordKey> for RecordKey {
    fn from(key: &RecordKey) -> Self {
        key.clone()
    }
}

/// A totally ordered projection of a JSON value.
///
/// Used as the key of secondary indexes and for sorting query results.
/// Ordering across kinds is `Null < Bool < Number < Text < Other`.
#[derive(Debug, Clone)]
pub enum IndexValue {
    /// Missing field or JSON `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// Any JSON number.
    Number(f64),
    /// A string.
    Text(String),
    /// Arrays and objects, compared by their serialized form.
    Other(String),
}

impl IndexValue {
    /// Projects a JSON value.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => IndexValue::Null,
            Value::Bool(b) => IndexValue::Bool(*b),
            Value::Number(n) => IndexValue::Number(n.as_f64().unwrap_or_default()),
            Value::String(s) => IndexValue::Text(s.clone()),
            other => IndexValue::Other(other.to_string()),
        }
    }

    /// Projects an optional field; absent fields index as `Null`.
    pub fn from_field(value: Option<&Value>) -> Self {
        value.map(Self::from_value).unwrap_or(IndexValue::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            IndexValue::Null => 0,
            IndexValue::Bool(_) => 1,
            IndexValue::Number(_) => 2,
            IndexValue::Text(_) => 3,
            IndexValue::Other(_) => 4,
        }
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Null, IndexValue::Null) => Ordering::Equal,
            (IndexValue::Bool(a), IndexValue::Bool(b)) => a.cmp(b),
            (IndexValue::Number(a), IndexValue::Number(b)) => a.total_cmp(b),
            (IndexValue::Text(a), IndexValue::Text(b)) => a.cmp(b),
            (IndexValue::Other(a), IndexValue::Other(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_and_string_keys_normalise() {
        assert_eq!(RecordKey::from_value(&json!(7)), Some(RecordKey::from(7)));
        assert_eq!(RecordKey::from_value(&json!("7")), Some(RecordKey::from(7)));
        assert_eq!(RecordKey::from_value(&json!("")), None);
        assert_eq!(RecordKey::from_value(&json!(1.5)), None);
        assert_eq!(RecordKey::from_value(&json!({"id": 1})), None);
    }

    #[test]
    fn index_values_order_across_kinds() {
        let mut values = vec![
            IndexValue::from_value(&json!("b")),
            IndexValue::from_value(&json!(10)),
            IndexValue::from_value(&json!(null)),
            IndexValue::from_value(&json!(2.5)),
            IndexValue::from_value(&json!(true)),
            IndexValue::from_value(&json!("a")),
        ];
        values.sort();

        assert_eq!(
            values,
            vec![
                IndexValue::Null,
                IndexValue::Bool(true),
                IndexValue::Number(2.5),
                IndexValue::Number(10.0),
                IndexValue::Text("a".into()),
                IndexValue::Text("b".into()),
            ]
        );
    }

    #[test]
    fn integer_and_float_numbers_compare_equal() {
        assert_eq!(
            IndexValue::from_value(&json!(3)),
            IndexValue::from_value(&json!(3.0))
        );
    }
}
