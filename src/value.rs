//! Loosely-typed source values and coerced destination values.
//!
//! Documents come out of the source as [`Document`]s: string keys mapped to
//! [`SourceValue`]s with whatever shape the store happened to hold. Before a
//! value can be bound to a statement it is coerced with [`coerce`] into a
//! [`SqlValue`] matching the field's declared [`FieldType`].

use crate::error::{Error, Result};
use crate::schema::FieldType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// A source document: field name to dynamically typed value.
pub type Document = BTreeMap<String, SourceValue>;

/// Build a [`Document`] from key/value pairs.
pub fn document<I, K, V>(pairs: I) -> Document
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<SourceValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// A value as read from the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceValue {
    /// Explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// Integer (32 and 64 bit source integers both land here)
    Int(i64),
    /// Floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Point in time
    Timestamp(DateTime<Utc>),
    /// Store-generated object identifier, kept as its hex form
    ObjectId(String),
    /// Ordered sequence
    Array(Vec<SourceValue>),
    /// Nested mapping
    Document(Document),
}

impl SourceValue {
    /// Short type name used in coercion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceValue::Null => "null",
            SourceValue::Bool(_) => "bool",
            SourceValue::Int(_) => "integer",
            SourceValue::Float(_) => "float",
            SourceValue::String(_) => "string",
            SourceValue::Timestamp(_) => "timestamp",
            SourceValue::ObjectId(_) => "object id",
            SourceValue::Array(_) => "array",
            SourceValue::Document(_) => "document",
        }
    }

    /// Check for null.
    pub fn is_null(&self) -> bool {
        matches!(self, SourceValue::Null)
    }

    /// Empty string, empty array or empty document.
    pub fn is_empty(&self) -> bool {
        match self {
            SourceValue::String(s) => s.is_empty(),
            SourceValue::Array(a) => a.is_empty(),
            SourceValue::Document(d) => d.is_empty(),
            _ => false,
        }
    }

    /// Borrow as a string slice if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SourceValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to JSON. Timestamps become RFC 3339 strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            SourceValue::Null => JsonValue::Null,
            SourceValue::Bool(b) => JsonValue::Bool(*b),
            SourceValue::Int(i) => JsonValue::Number((*i).into()),
            SourceValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            SourceValue::String(s) | SourceValue::ObjectId(s) => JsonValue::String(s.clone()),
            SourceValue::Timestamp(t) => JsonValue::String(t.to_rfc3339()),
            SourceValue::Array(items) => {
                JsonValue::Array(items.iter().map(SourceValue::to_json).collect())
            }
            SourceValue::Document(doc) => JsonValue::Object(
                doc.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceValue::String(s) | SourceValue::ObjectId(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<JsonValue> for SourceValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => SourceValue::Null,
            JsonValue::Bool(b) => SourceValue::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => SourceValue::Int(i),
                None => SourceValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => SourceValue::String(s),
            JsonValue::Array(items) => {
                SourceValue::Array(items.into_iter().map(SourceValue::from).collect())
            }
            JsonValue::Object(map) => SourceValue::Document(
                map.into_iter()
                    .map(|(k, v)| (k, SourceValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for SourceValue {
    fn from(value: &str) -> Self {
        SourceValue::String(value.to_string())
    }
}

impl From<String> for SourceValue {
    fn from(value: String) -> Self {
        SourceValue::String(value)
    }
}

impl From<i64> for SourceValue {
    fn from(value: i64) -> Self {
        SourceValue::Int(value)
    }
}

impl From<i32> for SourceValue {
    fn from(value: i32) -> Self {
        SourceValue::Int(value.into())
    }
}

impl From<f64> for SourceValue {
    fn from(value: f64) -> Self {
        SourceValue::Float(value)
    }
}

impl From<bool> for SourceValue {
    fn from(value: bool) -> Self {
        SourceValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for SourceValue {
    fn from(value: DateTime<Utc>) -> Self {
        SourceValue::Timestamp(value)
    }
}

impl From<Document> for SourceValue {
    fn from(value: Document) -> Self {
        SourceValue::Document(value)
    }
}

impl<T: Into<SourceValue>> From<Vec<T>> for SourceValue {
    fn from(value: Vec<T>) -> Self {
        SourceValue::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<SourceValue>> From<Option<T>> for SourceValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SourceValue::Null)
    }
}

/// A value coerced to a destination semantic type, ready to bind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Text
    Text(String),
    /// 64-bit integer
    Integer(i64),
    /// Double precision float
    Double(f64),
    /// Boolean
    Boolean(bool),
    /// Timestamp (UTC)
    Timestamp(DateTime<Utc>),
    /// Ordered sequence of strings
    TextArray(Vec<String>),
    /// Arbitrary JSON
    Json(JsonValue),
}

impl SqlValue {
    /// Check for null.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// JSON text for sinks without native array/JSON columns.
    pub fn to_json_text(&self) -> String {
        match self {
            SqlValue::TextArray(items) => {
                JsonValue::Array(items.iter().cloned().map(JsonValue::String).collect())
                    .to_string()
            }
            SqlValue::Json(v) => v.to_string(),
            SqlValue::Null => "null".to_string(),
            SqlValue::Text(s) => JsonValue::String(s.clone()).to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Double(f) => f.to_string(),
            SqlValue::Boolean(b) => b.to_string(),
            SqlValue::Timestamp(t) => JsonValue::String(t.to_rfc3339()).to_string(),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Text(s) => write!(f, "{}", s),
            SqlValue::Integer(i) => write!(f, "{}", i),
            SqlValue::Double(d) => write!(f, "{}", d),
            SqlValue::Boolean(b) => write!(f, "{}", b),
            SqlValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            SqlValue::TextArray(_) | SqlValue::Json(_) => write!(f, "{}", self.to_json_text()),
        }
    }
}

/// Coerce a source value to the destination type of a field.
///
/// Null stays null; whether null is acceptable is decided by the caller.
pub fn coerce(value: &SourceValue, ty: FieldType) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    let coerced = match ty {
        FieldType::Text => coerce_text(value).map(SqlValue::Text),
        FieldType::Integer => coerce_integer(value).map(SqlValue::Integer),
        FieldType::Double => coerce_double(value).map(SqlValue::Double),
        FieldType::Boolean => coerce_bool(value).map(SqlValue::Boolean),
        FieldType::Timestamp => coerce_timestamp(value).map(SqlValue::Timestamp),
        FieldType::TextArray => match value {
            SourceValue::Array(items) => items
                .iter()
                .map(coerce_text)
                .collect::<Option<Vec<_>>>()
                .map(SqlValue::TextArray),
            _ => None,
        },
        FieldType::Json => Some(SqlValue::Json(value.to_json())),
    };

    coerced.ok_or_else(|| {
        Error::row(format!(
            "cannot coerce {} value '{}' to {}",
            value.type_name(),
            truncate(&value.to_string(), 64),
            ty
        ))
    })
}

fn coerce_text(value: &SourceValue) -> Option<String> {
    match value {
        SourceValue::String(s) | SourceValue::ObjectId(s) => Some(s.clone()),
        SourceValue::Int(i) => Some(i.to_string()),
        SourceValue::Float(f) => Some(f.to_string()),
        SourceValue::Bool(b) => Some(b.to_string()),
        SourceValue::Timestamp(t) => Some(t.to_rfc3339()),
        _ => None,
    }
}

fn coerce_integer(value: &SourceValue) -> Option<i64> {
    match value {
        SourceValue::Int(i) => Some(*i),
        SourceValue::Float(f) if f.fract() == 0.0 && f.is_finite() => {
            // `as` saturates; 2^63 itself would land on i64::MAX
            let bound = 2f64.powi(63);
            (*f >= -bound && *f < bound).then_some(*f as i64)
        }
        SourceValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_double(value: &SourceValue) -> Option<f64> {
    match value {
        SourceValue::Float(f) => Some(*f),
        SourceValue::Int(i) => Some(*i as f64),
        SourceValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_bool(value: &SourceValue) -> Option<bool> {
    match value {
        SourceValue::Bool(b) => Some(*b),
        SourceValue::Int(0) => Some(false),
        SourceValue::Int(1) => Some(true),
        SourceValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_timestamp(value: &SourceValue) -> Option<DateTime<Utc>> {
    match value {
        SourceValue::Timestamp(t) => Some(*t),
        SourceValue::Int(millis) => Utc.timestamp_millis_opt(*millis).single(),
        SourceValue::String(s) => parse_timestamp(s.trim()),
        _ => None,
    }
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_coerce_text() {
        assert_eq!(
            coerce(&SourceValue::from("42"), FieldType::Text).unwrap(),
            SqlValue::Text("42".into())
        );
        assert_eq!(
            coerce(&SourceValue::Int(7), FieldType::Text).unwrap(),
            SqlValue::Text("7".into())
        );
        assert_eq!(
            coerce(&SourceValue::ObjectId("65ab".into()), FieldType::Text).unwrap(),
            SqlValue::Text("65ab".into())
        );
        assert!(coerce(&SourceValue::Array(vec![]), FieldType::Text).is_err());
    }

    #[test]
    fn test_coerce_integer() {
        assert_eq!(
            coerce(&SourceValue::Float(3.0), FieldType::Integer).unwrap(),
            SqlValue::Integer(3)
        );
        assert!(coerce(&SourceValue::Float(3.5), FieldType::Integer).is_err());
        assert_eq!(
            coerce(&SourceValue::from(" 12 "), FieldType::Integer).unwrap(),
            SqlValue::Integer(12)
        );
        let err = coerce(&SourceValue::from("twelve"), FieldType::Integer).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("twelve"));
    }

    #[test]
    fn test_coerce_integer_rejects_out_of_range_floats() {
        let err = coerce(&SourceValue::Float(9.223372036854776e18), FieldType::Integer).unwrap_err();
        assert!(!err.is_fatal());
        assert!(coerce(&SourceValue::Float(-1e19), FieldType::Integer).is_err());
        assert_eq!(
            coerce(&SourceValue::Float(-(2f64.powi(63))), FieldType::Integer).unwrap(),
            SqlValue::Integer(i64::MIN)
        );
        assert_eq!(
            coerce(&SourceValue::Float(2f64.powi(53)), FieldType::Integer).unwrap(),
            SqlValue::Integer(1 << 53)
        );
    }

    #[test]
    fn test_coerce_bool() {
        assert_eq!(
            coerce(&SourceValue::Int(1), FieldType::Boolean).unwrap(),
            SqlValue::Boolean(true)
        );
        assert_eq!(
            coerce(&SourceValue::from("FALSE"), FieldType::Boolean).unwrap(),
            SqlValue::Boolean(false)
        );
        assert!(coerce(&SourceValue::Int(2), FieldType::Boolean).is_err());
    }

    #[test]
    fn test_coerce_timestamp() {
        let expected = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(
            coerce(&SourceValue::from("2021-03-04T05:06:07Z"), FieldType::Timestamp).unwrap(),
            SqlValue::Timestamp(expected)
        );
        assert_eq!(
            coerce(&SourceValue::from("2021-03-04 05:06:07"), FieldType::Timestamp).unwrap(),
            SqlValue::Timestamp(expected)
        );
        assert_eq!(
            coerce(
                &SourceValue::Int(expected.timestamp_millis()),
                FieldType::Timestamp
            )
            .unwrap(),
            SqlValue::Timestamp(expected)
        );
        assert!(coerce(&SourceValue::from("yesterday"), FieldType::Timestamp).is_err());
    }

    #[test]
    fn test_coerce_text_array() {
        let votes = SourceValue::from(vec!["a", "b"]);
        assert_eq!(
            coerce(&votes, FieldType::TextArray).unwrap(),
            SqlValue::TextArray(vec!["a".into(), "b".into()])
        );
        let nested = SourceValue::Array(vec![SourceValue::Document(Document::new())]);
        assert!(coerce(&nested, FieldType::TextArray).is_err());
        assert!(coerce(&SourceValue::from("a"), FieldType::TextArray).is_err());
    }

    #[test]
    fn test_coerce_json_and_null() {
        let doc = SourceValue::Document(document([("push", "on")]));
        assert_eq!(
            coerce(&doc, FieldType::Json).unwrap(),
            SqlValue::Json(serde_json::json!({"push": "on"}))
        );
        assert_eq!(
            coerce(&SourceValue::Null, FieldType::Integer).unwrap(),
            SqlValue::Null
        );
    }

    #[test]
    fn test_from_json() {
        let value = SourceValue::from(serde_json::json!({"a": [1, 2.5, "x", null]}));
        let SourceValue::Document(doc) = value else {
            panic!("expected document");
        };
        assert_eq!(
            doc["a"],
            SourceValue::Array(vec![
                SourceValue::Int(1),
                SourceValue::Float(2.5),
                SourceValue::from("x"),
                SourceValue::Null,
            ])
        );
    }

    #[test]
    fn test_json_text() {
        assert_eq!(
            SqlValue::TextArray(vec!["a".into()]).to_json_text(),
            r#"["a"]"#
        );
        assert_eq!(SqlValue::Json(serde_json::json!({})).to_json_text(), "{}");
    }

    proptest! {
        #[test]
        fn prop_integers_stringify(n in any::<i64>()) {
            prop_assert_eq!(
                coerce(&SourceValue::Int(n), FieldType::Text).unwrap(),
                SqlValue::Text(n.to_string())
            );
        }

        #[test]
        fn prop_numeric_strings_parse(n in any::<i64>()) {
            prop_assert_eq!(
                coerce(&SourceValue::String(n.to_string()), FieldType::Integer).unwrap(),
                SqlValue::Integer(n)
            );
        }

        #[test]
        fn prop_non_numeric_strings_are_row_errors(s in "[a-zA-Z]{1,16}") {
            let err = coerce(&SourceValue::String(s), FieldType::Integer).unwrap_err();
            prop_assert!(!err.is_fatal());
        }
    }
}
