//! Entity schemas: the declarative mapping from source documents to
//! destination rows.
//!
//! A schema is described once at startup through [`EntitySchema::builder`]
//! (or parsed from annotation strings, see [`crate::tags`]) and is immutable
//! afterwards. Build-time validation rejects everything that would otherwise
//! surface as a confusing runtime failure: unnamed columns, duplicate
//! destination columns, more than one identity field, and foreign keys that
//! point nowhere (see [`SchemaCatalog::validate`]).

use crate::error::{Error, Result};
use crate::value::{SqlValue, parse_timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Destination semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Text
    #[serde(alias = "string")]
    Text,
    /// 64-bit integer
    #[serde(alias = "int")]
    Integer,
    /// Double precision float
    #[serde(alias = "float")]
    Double,
    /// Boolean
    #[serde(alias = "bool")]
    Boolean,
    /// Timestamp
    #[serde(alias = "time", alias = "datetime")]
    Timestamp,
    /// Ordered sequence of strings
    #[serde(alias = "string_array", alias = "text[]")]
    TextArray,
    /// Nested mapping stored as JSON
    #[serde(alias = "map")]
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Double => "double",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
            FieldType::TextArray => "text_array",
            FieldType::Json => "json",
        };
        write!(f, "{}", name)
    }
}

/// Default applied by the destination when a value is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultExpr {
    /// NULL (also makes the column nullable)
    Null,
    /// Current timestamp, evaluated by the destination
    Now,
    /// Typed literal
    Value(SqlValue),
    /// Raw SQL expression, emitted verbatim
    Sql(String),
}

impl DefaultExpr {
    /// Interpret a default annotation for a field of the given type.
    ///
    /// `null` and `now()` are recognized in any case. Anything that parses as
    /// a literal of the field type becomes [`DefaultExpr::Value`]; `{}` and
    /// `[]` are the empty sequence or mapping. Whatever is left is kept as a
    /// raw SQL expression.
    pub fn parse(raw: &str, ty: FieldType) -> Self {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();

        match lower.as_str() {
            "null" => return DefaultExpr::Null,
            "now()" | "now" | "current_timestamp" => return DefaultExpr::Now,
            _ => {}
        }

        let literal = match ty {
            FieldType::Text => Some(SqlValue::Text(unquote(trimmed).to_string())),
            FieldType::Integer => trimmed.parse().ok().map(SqlValue::Integer),
            FieldType::Double => trimmed.parse().ok().map(SqlValue::Double),
            FieldType::Boolean => match lower.as_str() {
                "true" => Some(SqlValue::Boolean(true)),
                "false" => Some(SqlValue::Boolean(false)),
                _ => None,
            },
            FieldType::Timestamp => parse_timestamp(unquote(trimmed)).map(SqlValue::Timestamp),
            FieldType::TextArray => match trimmed {
                "{}" | "[]" => Some(SqlValue::TextArray(Vec::new())),
                other => serde_json::from_str::<Vec<String>>(other)
                    .ok()
                    .map(SqlValue::TextArray),
            },
            FieldType::Json => serde_json::from_str(trimmed).ok().map(SqlValue::Json),
        };

        literal
            .map(DefaultExpr::Value)
            .unwrap_or_else(|| DefaultExpr::Sql(trimmed.to_string()))
    }
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .unwrap_or(s)
}

/// Foreign-key reference to `table(column)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referenced table
    pub table: String,
    /// Referenced column
    pub column: String,
}

impl ForeignKey {
    /// Create a reference.
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Parse the `table,column` annotation form.
    pub fn parse(raw: &str) -> Option<Self> {
        let (table, column) = raw.split_once(',')?;
        let (table, column) = (table.trim(), column.trim());
        if table.is_empty() || column.is_empty() || column.contains(',') {
            return None;
        }
        Some(Self::new(table, column))
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.table, self.column)
    }
}

/// One destination column and where its value comes from.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    /// Key read from the source document
    pub source_key: String,
    /// Destination column name
    pub dest_column: String,
    /// Destination semantic type
    pub field_type: FieldType,
    /// Uniqueness constraint on the column
    pub unique: bool,
    /// Designated identity: collisions mean "already migrated"
    pub identity: bool,
    /// Foreign-key reference
    pub foreign_key: Option<ForeignKey>,
    /// Default applied when the value is absent
    pub default: Option<DefaultExpr>,
    /// Treat empty strings, arrays and mappings as absent
    pub omit_if_empty: bool,
    /// Explicitly nullable
    pub nullable: bool,
}

impl FieldMapping {
    /// New field whose source key equals its destination column.
    pub fn new(dest_column: impl Into<String>, field_type: FieldType) -> Self {
        let dest_column = dest_column.into();
        Self {
            source_key: dest_column.clone(),
            dest_column,
            field_type,
            unique: false,
            identity: false,
            foreign_key: None,
            default: None,
            omit_if_empty: false,
            nullable: false,
        }
    }

    /// Text field.
    pub fn text(dest_column: impl Into<String>) -> Self {
        Self::new(dest_column, FieldType::Text)
    }

    /// Integer field.
    pub fn integer(dest_column: impl Into<String>) -> Self {
        Self::new(dest_column, FieldType::Integer)
    }

    /// Double field.
    pub fn double(dest_column: impl Into<String>) -> Self {
        Self::new(dest_column, FieldType::Double)
    }

    /// Boolean field.
    pub fn boolean(dest_column: impl Into<String>) -> Self {
        Self::new(dest_column, FieldType::Boolean)
    }

    /// Timestamp field.
    pub fn timestamp(dest_column: impl Into<String>) -> Self {
        Self::new(dest_column, FieldType::Timestamp)
    }

    /// Multi-valued text field.
    pub fn text_array(dest_column: impl Into<String>) -> Self {
        Self::new(dest_column, FieldType::TextArray)
    }

    /// JSON field.
    pub fn json(dest_column: impl Into<String>) -> Self {
        Self::new(dest_column, FieldType::Json)
    }

    /// Read the value from a different source key.
    pub fn source(mut self, key: impl Into<String>) -> Self {
        self.source_key = key.into();
        self
    }

    /// Add a uniqueness constraint.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Designate as the identity field (implies unique).
    pub fn identity(mut self) -> Self {
        self.identity = true;
        self.unique = true;
        self
    }

    /// Reference `table(column)`.
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.foreign_key = Some(ForeignKey::new(table, column));
        self
    }

    /// Set the default.
    pub fn default_expr(mut self, default: DefaultExpr) -> Self {
        self.default = Some(default);
        self
    }

    /// Set the default from its annotation form (see [`DefaultExpr::parse`]).
    pub fn default_value(self, raw: &str) -> Self {
        let ty = self.field_type;
        self.default_expr(DefaultExpr::parse(raw, ty))
    }

    /// Treat empty values as absent.
    pub fn omit_if_empty(mut self) -> Self {
        self.omit_if_empty = true;
        self
    }

    /// Allow NULL.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Whether the column accepts NULL.
    pub fn is_nullable(&self) -> bool {
        self.nullable || matches!(self.default, Some(DefaultExpr::Null))
    }
}

/// Ordered field mappings for one destination table.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    table: String,
    fields: Vec<FieldMapping>,
    index_columns: Vec<String>,
}

impl EntitySchema {
    /// Start describing a schema for `table`.
    pub fn builder(table: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            table: table.into(),
            fields: Vec::new(),
            index_columns: Vec::new(),
        }
    }

    /// Destination table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Field mappings in declaration order.
    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    /// Columns that get a non-unique index.
    pub fn index_columns(&self) -> &[String] {
        &self.index_columns
    }

    /// The identity field, if any.
    pub fn identity(&self) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.identity)
    }

    /// Look up a field by destination column.
    pub fn field(&self, dest_column: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.dest_column == dest_column)
    }

    /// Fields carrying a foreign key.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&FieldMapping, &ForeignKey)> {
        self.fields
            .iter()
            .filter_map(|f| f.foreign_key.as_ref().map(|fk| (f, fk)))
    }

    /// Copy with a different destination table name.
    pub fn renamed(&self, table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..self.clone()
        }
    }

    /// Copy with additional non-unique index columns.
    pub fn with_index_columns(&self, columns: &[String]) -> Result<Self> {
        let mut schema = self.clone();
        for column in columns {
            if schema.field(column).is_none() {
                return Err(Error::schema(
                    &schema.table,
                    format!("index column '{}' is not a mapped column", column),
                ));
            }
            if !schema.index_columns.contains(column) {
                schema.index_columns.push(column.clone());
            }
        }
        Ok(schema)
    }
}

/// Builder for [`EntitySchema`].
#[derive(Debug, Clone)]
pub struct EntitySchemaBuilder {
    table: String,
    fields: Vec<FieldMapping>,
    index_columns: Vec<String>,
}

impl EntitySchemaBuilder {
    /// Append a field.
    pub fn field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    /// Append several fields.
    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldMapping>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Add a non-unique index on a mapped column.
    pub fn index(mut self, column: impl Into<String>) -> Self {
        self.index_columns.push(column.into());
        self
    }

    /// Validate and build.
    ///
    /// When no field is explicitly marked as identity and exactly one field
    /// is unique, that field becomes the identity.
    pub fn build(self) -> Result<EntitySchema> {
        let table = self.table.trim().to_string();
        if table.is_empty() {
            return Err(Error::schema("<unnamed>", "destination table name is empty"));
        }
        if self.fields.is_empty() {
            return Err(Error::schema(&table, "schema declares no fields"));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.dest_column.trim().is_empty() {
                return Err(Error::schema(
                    &table,
                    format!(
                        "field with source key '{}' has no destination column",
                        field.source_key
                    ),
                ));
            }
            if field.source_key.trim().is_empty() {
                return Err(Error::schema(
                    &table,
                    format!("column '{}' has an empty source key", field.dest_column),
                ));
            }
            if !seen.insert(field.dest_column.as_str()) {
                return Err(Error::schema(
                    &table,
                    format!(
                        "destination column '{}' is claimed by more than one field",
                        field.dest_column
                    ),
                ));
            }
        }

        let mut fields = self.fields;
        let identities = fields.iter().filter(|f| f.identity).count();
        if identities > 1 {
            return Err(Error::schema(
                &table,
                "more than one field is designated as identity",
            ));
        }
        if identities == 0 {
            let mut unique = fields.iter_mut().filter(|f| f.unique);
            if let (Some(only), None) = (unique.next(), unique.next()) {
                only.identity = true;
            }
        }

        let schema = EntitySchema {
            table,
            fields,
            index_columns: Vec::new(),
        };
        schema.with_index_columns(&self.index_columns)
    }
}

/// The set of schemas taking part in one run, used to check references.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: Vec<EntitySchema>,
    external: HashSet<String>,
}

impl SchemaCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. Registration order is materialization order.
    pub fn register(&mut self, schema: EntitySchema) -> Result<()> {
        if self.get(schema.table()).is_some() {
            return Err(Error::schema(
                schema.table(),
                "destination table is registered twice",
            ));
        }
        self.schemas.push(schema);
        Ok(())
    }

    /// Declare a table that exists in the destination but is not backed up.
    pub fn declare_external(&mut self, table: impl Into<String>) {
        self.external.insert(table.into());
    }

    /// Get a registered schema.
    pub fn get(&self, table: &str) -> Option<&EntitySchema> {
        self.schemas.iter().find(|s| s.table() == table)
    }

    /// Registered schemas in order.
    pub fn schemas(&self) -> &[EntitySchema] {
        &self.schemas
    }

    /// Check every foreign key.
    ///
    /// A reference must name the schema itself, a schema registered before
    /// it, or an external table. References to registered schemas must name
    /// a unique column of that schema.
    pub fn validate(&self) -> Result<()> {
        for (position, schema) in self.schemas.iter().enumerate() {
            for (field, fk) in schema.foreign_keys() {
                if self.external.contains(&fk.table) {
                    continue;
                }

                let target = if fk.table == schema.table() {
                    Some(schema)
                } else {
                    self.schemas[..position]
                        .iter()
                        .find(|s| s.table() == fk.table)
                };

                let Some(target) = target else {
                    let hint = if self.get(&fk.table).is_some() {
                        " (it is registered later; register referenced tables first)"
                    } else {
                        ""
                    };
                    return Err(Error::schema(
                        schema.table(),
                        format!(
                            "column '{}' references unknown table '{}'{}",
                            field.dest_column, fk.table, hint
                        ),
                    ));
                };

                match target.field(&fk.column) {
                    None => {
                        return Err(Error::schema(
                            schema.table(),
                            format!(
                                "column '{}' references missing column {}",
                                field.dest_column, fk
                            ),
                        ));
                    }
                    Some(col) if !col.unique => {
                        return Err(Error::schema(
                            schema.table(),
                            format!(
                                "column '{}' references {} which is not unique",
                                field.dest_column, fk
                            ),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Dependency level per registered schema: 0 for schemas without
    /// in-catalog references, otherwise one more than the deepest target.
    pub fn dependency_levels(&self) -> Vec<usize> {
        let mut levels: HashMap<&str, usize> = HashMap::new();
        let mut out = Vec::with_capacity(self.schemas.len());

        for schema in &self.schemas {
            let level = schema
                .foreign_keys()
                .filter(|(_, fk)| fk.table != schema.table())
                .filter_map(|(_, fk)| levels.get(fk.table.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            levels.insert(schema.table(), level);
            out.push(level);
        }

        out
    }
}
