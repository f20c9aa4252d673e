// Typed field encoding used by the remote document store
//
// Every field travels wrapped in a single-key object naming its type, e.g.
// `{"stringValue": "Heat"}` or `{"integerValue": "1995"}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldValue {
    StringValue(String),
    /// 64-bit integers are carried as decimal strings
    IntegerValue(#[serde(with = "integer_string")] i64),
    DoubleValue(f64),
    BooleanValue(bool),
    TimestampValue(DateTime<Utc>),
    ArrayValue(ArrayValue),
    NullValue(()),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    /// Absent on the wire when the array is empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<FieldValue>,
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::StringValue(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::IntegerValue(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value; integers widen to `f64`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::DoubleValue(n) => Some(*n),
            FieldValue::IntegerValue(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::BooleanValue(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::TimestampValue(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::ArrayValue(a) => Some(&a.values),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::NullValue(()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::StringValue(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::StringValue(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::IntegerValue(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::DoubleValue(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::BooleanValue(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::TimestampValue(value)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(values: Vec<T>) -> Self {
        FieldValue::ArrayValue(ArrayValue {
            values: values.into_iter().map(Into::into).collect(),
        })
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::NullValue(()))
    }
}

/// A stored document: its resource name and typed fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Last path segment of the resource name
    pub fn id(&self) -> Option<&str> {
        self.name.as_deref().and_then(|n| n.rsplit('/').next())
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(FieldValue::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(FieldValue::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(FieldValue::as_bool)
    }

    pub fn get_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key).and_then(FieldValue::as_timestamp)
    }

    /// String elements of an array field; other element types are skipped
    pub fn get_strings(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(FieldValue::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Field names present, used as the update mask on upsert
    pub fn field_paths(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

mod integer_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Accepts the canonical string form as well as a bare number
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_wire_tags() {
        let doc = Document::new()
            .with("title", "Heat")
            .with("year", 1995_i64)
            .with("rating", 8.5)
            .with("seen", true)
            .with("comment", None::<String>)
            .with("genres", vec!["Crime", "Drama"]);

        let wire = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            wire,
            json!({
                "fields": {
                    "comment": {"nullValue": null},
                    "genres": {"arrayValue": {"values": [
                        {"stringValue": "Crime"},
                        {"stringValue": "Drama"}
                    ]}},
                    "rating": {"doubleValue": 8.5},
                    "seen": {"booleanValue": true},
                    "title": {"stringValue": "Heat"},
                    "year": {"integerValue": "1995"}
                }
            })
        );
    }

    #[test]
    fn test_parses_stored_document() {
        let doc: Document = serde_json::from_value(json!({
            "name": "projects/p/databases/(default)/documents/movies/tt0113277",
            "fields": {
                "title": {"stringValue": "Heat"},
                "year": {"integerValue": "1995"},
                "rating": {"doubleValue": 8},
                "addedAt": {"timestampValue": "2024-03-01T12:00:00Z"},
                "genres": {"arrayValue": {}}
            },
            "createTime": "2024-03-01T12:00:00Z",
            "updateTime": "2024-03-01T12:00:00Z"
        }))
        .unwrap();

        assert_eq!(doc.id(), Some("tt0113277"));
        assert_eq!(doc.get_str("title"), Some("Heat"));
        assert_eq!(doc.get_i64("year"), Some(1995));
        assert_eq!(doc.get_f64("rating"), Some(8.0));
        assert!(doc.get_timestamp("addedAt").is_some());
        assert!(doc.get_strings("genres").is_empty());
        assert_eq!(doc.get_str("missing"), None);
    }

    #[test]
    fn test_integer_accepts_bare_number() {
        let value: FieldValue = serde_json::from_value(json!({"integerValue": 7})).unwrap();
        assert_eq!(value.as_i64(), Some(7));

        assert!(serde_json::from_value::<FieldValue>(json!({"integerValue": "x"})).is_err());
    }

    #[test]
    fn test_type_mismatch_reads_as_none() {
        let doc = Document::new().with("year", "1995");
        assert_eq!(doc.get_i64("year"), None);
        assert!(FieldValue::from(None::<i64>).is_null());
    }
}
