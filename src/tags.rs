//! Annotation strings for field mappings.
//!
//! Schemas can be written compactly as one annotation per field, in the
//! struct-tag form `key:"value"` separated by whitespace:
//!
//! ```text
//! src:"link,omitempty" dest:"link" default:"null"
//! src:"userID" dest:"userID" unique:"true" fkey:"users,userID"
//! ```
//!
//! Recognized keys are `src` (with the `omitempty` option), `dest`, `type`,
//! `unique`, `identity`, `nullable`, `fkey` and `default`. Unknown keys are
//! ignored.

use crate::error::{Error, Result};
use crate::schema::{DefaultExpr, FieldMapping, FieldType, ForeignKey};
use tracing::debug;

/// Split an annotation into `(key, value)` pairs in order.
pub fn parse_pairs(tag: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut rest = tag.trim_start();

    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| Error::validation(format!("expected key:\"value\" in '{}'", tag)))?;
        let key = &rest[..colon];
        if key.is_empty() || key.contains(char::is_whitespace) || key.contains('"') {
            return Err(Error::validation(format!("malformed key '{}' in '{}'", key, tag)));
        }

        let after = &rest[colon + 1..];
        let Some(body) = after.strip_prefix('"') else {
            return Err(Error::validation(format!(
                "value of '{}' must be double-quoted in '{}'",
                key, tag
            )));
        };

        let mut value = String::new();
        let mut escaped = false;
        let mut end = None;
        for (i, c) in body.char_indices() {
            match (escaped, c) {
                (true, _) => {
                    value.push(c);
                    escaped = false;
                }
                (false, '\\') => escaped = true,
                (false, '"') => {
                    end = Some(i);
                    break;
                }
                (false, _) => value.push(c),
            }
        }
        let end = end.ok_or_else(|| {
            Error::validation(format!("unterminated value for '{}' in '{}'", key, tag))
        })?;

        pairs.push((key.to_string(), value));
        rest = body[end + 1..].trim_start();
    }

    Ok(pairs)
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(Error::validation(format!(
            "'{}' expects true or false, got '{}'",
            key, other
        ))),
    }
}

fn parse_type(value: &str) -> Result<FieldType> {
    let quoted = format!("\"{}\"", value.trim().to_ascii_lowercase());
    serde_json::from_str(&quoted)
        .map_err(|_| Error::validation(format!("unknown field type '{}'", value)))
}

/// Parse one field annotation.
///
/// `field_type` is used when the annotation carries no `type` key; one of the
/// two must be present. A missing `src` reads from the destination column
/// name. A missing `dest` yields an empty destination column, which schema
/// building rejects.
pub fn parse_field(tag: &str, field_type: Option<FieldType>) -> Result<FieldMapping> {
    let pairs = parse_pairs(tag)?;

    let mut source = None;
    let mut omit_if_empty = false;
    let mut dest = None;
    let mut ty = field_type;
    let mut unique = false;
    let mut identity = false;
    let mut nullable = false;
    let mut foreign_key = None;
    let mut default_raw = None;

    for (key, value) in &pairs {
        match key.as_str() {
            "src" => {
                let mut parts = value.split(',');
                source = parts.next().map(|s| s.trim().to_string());
                for option in parts {
                    match option.trim() {
                        "omitempty" => omit_if_empty = true,
                        other => debug!("ignoring src option '{}'", other),
                    }
                }
            }
            "dest" => dest = Some(value.trim().to_string()),
            "type" => ty = Some(parse_type(value)?),
            "unique" => unique = parse_flag(key, value)?,
            "identity" => identity = parse_flag(key, value)?,
            "nullable" => nullable = parse_flag(key, value)?,
            "fkey" => {
                foreign_key = Some(ForeignKey::parse(value).ok_or_else(|| {
                    Error::validation(format!("fkey must be 'table,column', got '{}'", value))
                })?);
            }
            "default" => default_raw = Some(value.clone()),
            other => debug!("ignoring annotation key '{}'", other),
        }
    }

    let ty = ty.ok_or_else(|| Error::validation(format!("no field type for '{}'", tag)))?;
    let dest = dest.unwrap_or_default();
    let source_key = match source {
        Some(s) if !s.is_empty() => s,
        _ if dest.is_empty() => {
            return Err(Error::validation(format!(
                "annotation names neither src nor dest: '{}'",
                tag
            )));
        }
        _ => dest.clone(),
    };

    let mut field = FieldMapping::new(dest, ty).source(source_key);
    field.unique = unique || identity;
    field.identity = identity;
    field.nullable = nullable;
    field.omit_if_empty = omit_if_empty;
    field.foreign_key = foreign_key;
    field.default = default_raw.map(|raw| DefaultExpr::parse(&raw, ty));
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SqlValue;

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs(r#"src:"link,omitempty"  dest:"link" default:"null""#).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("src".to_string(), "link,omitempty".to_string()),
                ("dest".to_string(), "link".to_string()),
                ("default".to_string(), "null".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_pairs_escaped_quote() {
        let pairs = parse_pairs(r#"default:"say \"hi\"""#).unwrap();
        assert_eq!(pairs[0].1, "say \"hi\"");
    }

    #[test]
    fn test_parse_pairs_rejects_garbage() {
        assert!(parse_pairs("src=userID").is_err());
        assert!(parse_pairs(r#"src:userID"#).is_err());
        assert!(parse_pairs(r#"src:"userID"#).is_err());
    }

    #[test]
    fn test_parse_omitempty_with_null_default() {
        let field = parse_field(
            r#"src:"email,omitempty" dest:"email" default:"null""#,
            Some(FieldType::Text),
        )
        .unwrap();
        assert_eq!(field.source_key, "email");
        assert!(field.omit_if_empty);
        assert_eq!(field.default, Some(DefaultExpr::Null));
        assert!(field.is_nullable());
    }

    #[test]
    fn test_parse_unique_foreign_key() {
        let field = parse_field(
            r#"src:"userID" dest:"userID" unique:"true" fkey:"users,userID""#,
            Some(FieldType::Text),
        )
        .unwrap();
        assert!(field.unique);
        assert_eq!(field.foreign_key, Some(ForeignKey::new("users", "userID")));
    }

    #[test]
    fn test_parse_renamed_source_with_typed_default() {
        let field = parse_field(
            r#"src:"shhs" dest:"date" default:"NOW()""#,
            Some(FieldType::Timestamp),
        )
        .unwrap();
        assert_eq!(field.source_key, "shhs");
        assert_eq!(field.dest_column, "date");
        assert_eq!(field.default, Some(DefaultExpr::Now));

        let field = parse_field(r#"src:"views" dest:"views" type:"int" default:"0""#, None).unwrap();
        assert_eq!(field.field_type, FieldType::Integer);
        assert_eq!(field.default, Some(DefaultExpr::Value(SqlValue::Integer(0))));
    }

    #[test]
    fn test_missing_dest_yields_empty_column() {
        let field = parse_field(r#"src:"overview""#, Some(FieldType::Text)).unwrap();
        assert_eq!(field.dest_column, "");
    }

    #[test]
    fn test_type_is_required() {
        assert!(parse_field(r#"src:"a" dest:"a""#, None).is_err());
        assert!(parse_field(r#"dest:"a" type:"blob""#, None).is_err());
    }

    #[test]
    fn test_bad_fkey_rejected() {
        assert!(parse_field(r#"dest:"a" fkey:"users""#, Some(FieldType::Text)).is_err());
    }
}
