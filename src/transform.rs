//! Per-column transforms that compute a value from the whole document.
//!
//! A transform registered for a destination column replaces whatever the
//! document holds under that field's source key. Its output goes through the
//! same coercion as source values; a [`SourceValue::Null`] output is written
//! as NULL.

use crate::error::{Error, Result};
use crate::schema::EntitySchema;
use crate::value::{Document, SourceValue};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Computes a column value from a source document.
pub type Transform = Arc<dyn Fn(&Document) -> SourceValue + Send + Sync>;

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Default length of regenerated tokens.
pub const DEFAULT_TOKEN_LENGTH: usize = 255;

/// Random alphanumeric string of `len` characters.
pub fn random_token(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        for byte in Uuid::new_v4().as_bytes() {
            if out.len() == len {
                break;
            }
            out.push(TOKEN_ALPHABET[*byte as usize % TOKEN_ALPHABET.len()] as char);
        }
    }
    out
}

/// Build a transform from its configuration form.
///
/// | name              | output                                   |
/// |-------------------|------------------------------------------|
/// | `random_token[:N]`| fresh alphanumeric token (default 255)   |
/// | `uuid`            | fresh v4 UUID                            |
/// | `now`             | current time                             |
/// | `null`            | NULL                                     |
/// | `constant:VALUE`  | the literal text `VALUE`                 |
/// | `copy:KEY`        | the document's value under `KEY`         |
pub fn builtin(spec: &str) -> Result<Transform> {
    let (name, arg) = match spec.split_once(':') {
        Some((name, arg)) => (name.trim(), Some(arg)),
        None => (spec.trim(), None),
    };

    let transform: Transform = match (name, arg) {
        ("random_token", None) => {
            Arc::new(|_: &Document| SourceValue::String(random_token(DEFAULT_TOKEN_LENGTH)))
        }
        ("random_token", Some(len)) => {
            let len: usize = len.trim().parse().map_err(|_| {
                Error::config(format!("random_token length must be a number, got '{}'", len))
            })?;
            if len == 0 {
                return Err(Error::config("random_token length must be positive"));
            }
            Arc::new(move |_: &Document| SourceValue::String(random_token(len)))
        }
        ("uuid", None) => Arc::new(|_: &Document| SourceValue::String(Uuid::new_v4().to_string())),
        ("now", None) => Arc::new(|_: &Document| SourceValue::Timestamp(Utc::now())),
        ("null", None) => Arc::new(|_: &Document| SourceValue::Null),
        ("constant", Some(value)) => {
            let value = value.to_string();
            Arc::new(move |_: &Document| SourceValue::String(value.clone()))
        }
        ("copy", Some(key)) => {
            let key = key.trim().to_string();
            Arc::new(move |doc: &Document| doc.get(&key).cloned().unwrap_or(SourceValue::Null))
        }
        _ => return Err(Error::config(format!("unknown transform '{}'", spec))),
    };

    Ok(transform)
}

/// Transforms keyed by destination column.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: BTreeMap<String, Transform>,
}

impl TransformRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform for a destination column, replacing any earlier one.
    pub fn register<F>(&mut self, column: impl Into<String>, transform: F)
    where
        F: Fn(&Document) -> SourceValue + Send + Sync + 'static,
    {
        self.transforms.insert(column.into(), Arc::new(transform));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, column: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&Document) -> SourceValue + Send + Sync + 'static,
    {
        self.register(column, transform);
        self
    }

    /// Register a built-in transform by its configuration form.
    pub fn register_builtin(&mut self, column: impl Into<String>, spec: &str) -> Result<()> {
        self.transforms.insert(column.into(), builtin(spec)?);
        Ok(())
    }

    /// Transform for a column.
    pub fn get(&self, column: &str) -> Option<&Transform> {
        self.transforms.get(column)
    }

    /// Whether no transforms are registered.
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Every registered column must exist in the schema.
    pub fn check_columns(&self, schema: &EntitySchema) -> Result<()> {
        for column in self.transforms.keys() {
            if schema.field(column).is_none() {
                return Err(Error::schema(
                    schema.table(),
                    format!("transform registered for unknown column '{}'", column),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("columns", &self.transforms.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldMapping;
    use crate::value::document;

    #[test]
    fn test_random_token() {
        let a = random_token(255);
        let b = random_token(255);
        assert_eq!(a.len(), 255);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_builtins() {
        let doc = document([("name", "ada")]);

        let token = builtin("random_token:16").unwrap();
        assert!(matches!(token(&doc), SourceValue::String(s) if s.len() == 16));

        let copy = builtin("copy:name").unwrap();
        assert_eq!(copy(&doc), SourceValue::String("ada".into()));

        let constant = builtin("constant:pending").unwrap();
        assert_eq!(constant(&doc), SourceValue::String("pending".into()));

        assert!(builtin("null").unwrap()(&doc).is_null());
        assert!(builtin("rot13").is_err());
        assert!(builtin("random_token:x").is_err());
        assert!(builtin("random_token:0").is_err());
    }

    #[test]
    fn test_check_columns() {
        let schema = EntitySchema::builder("users")
            .field(FieldMapping::text("token"))
            .build()
            .unwrap();

        let ok = TransformRegistry::new().with("token", |_| SourceValue::Null);
        ok.check_columns(&schema).unwrap();

        let bad = TransformRegistry::new().with("tokn", |_| SourceValue::Null);
        let err = bad.check_columns(&schema).unwrap_err();
        assert!(err.to_string().contains("tokn"));
    }
}
