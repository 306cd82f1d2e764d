//! Destination table materialization.
//!
//! [`Materializer::reconcile`] makes a destination table match an entity
//! schema without ever dropping anything: a missing table is created with
//! every column, constraint and index; an existing table only gains the
//! columns, constraints and indexes it lacks. Added columns are nullable
//! (existing rows have no value for them) and carry their declared default.

use crate::error::{Error, Result};
use crate::schema::{EntitySchema, FieldMapping};
use crate::sink::{
    ConstraintKind, Dialect, Sink, SinkError, foreign_key_name, index_name, quote_ident,
    unique_name,
};
use crate::value::SqlValue;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, instrument};

/// What reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaterializeReport {
    /// Table name
    pub table: String,
    /// The table did not exist and was created
    pub created: bool,
    /// Columns added to an existing table
    pub added_columns: Vec<String>,
    /// Constraints added to an existing table
    pub added_constraints: Vec<String>,
    /// Indexes created
    pub added_indexes: Vec<String>,
}

impl MaterializeReport {
    /// Whether nothing had to change.
    pub fn is_noop(&self) -> bool {
        !self.created
            && self.added_columns.is_empty()
            && self.added_constraints.is_empty()
            && self.added_indexes.is_empty()
    }
}

/// Column definition used in `CREATE TABLE`.
fn column_definition(dialect: Dialect, field: &FieldMapping) -> String {
    let mut def = format!(
        "{} {}",
        quote_ident(&field.dest_column),
        dialect.column_type(field.field_type)
    );
    if !field.is_nullable() {
        def.push_str(" NOT NULL");
    }
    if field.unique {
        def.push_str(" UNIQUE");
    }
    if let Some(default) = &field.default {
        def.push_str(" DEFAULT ");
        def.push_str(&dialect.default_clause(default));
    }
    def
}

/// `CREATE TABLE` statement for a schema.
pub fn create_table_statement(dialect: Dialect, schema: &EntitySchema) -> String {
    let mut parts: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| column_definition(dialect, f))
        .collect();

    for (field, fk) in schema.foreign_keys() {
        parts.push(format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            quote_ident(&foreign_key_name(schema.table(), &field.dest_column)),
            quote_ident(&field.dest_column),
            quote_ident(&fk.table),
            quote_ident(&fk.column)
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(schema.table()),
        parts.join(",\n    ")
    )
}

fn create_index_statement(table: &str, column: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index_name(table, column)),
        quote_ident(table),
        quote_ident(column)
    )
}

fn add_column_statement(dialect: Dialect, table: &str, field: &FieldMapping) -> String {
    let mut stmt = format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        quote_ident(table),
        quote_ident(&field.dest_column),
        dialect.column_type(field.field_type)
    );
    if let Some(default) = &field.default {
        stmt.push_str(" DEFAULT ");
        stmt.push_str(&dialect.default_clause(default));
    }
    stmt
}

/// Creates and evolves destination tables.
pub struct Materializer<'a> {
    sink: &'a dyn Sink,
}

impl<'a> Materializer<'a> {
    /// Create a materializer over a sink.
    pub fn new(sink: &'a dyn Sink) -> Self {
        Self { sink }
    }

    /// DDL that would create the table from scratch.
    pub fn plan(&self, schema: &EntitySchema) -> Vec<String> {
        plan_statements(self.sink.dialect(), schema)
    }

    /// Bring the destination table in line with the schema.
    #[instrument(skip(self, schema), fields(table = %schema.table(), sink = self.sink.name()))]
    pub async fn reconcile(&self, schema: &EntitySchema) -> Result<MaterializeReport> {
        let table = schema.table();
        let dialect = self.sink.dialect();
        let mut report = MaterializeReport {
            table: table.to_string(),
            ..Default::default()
        };

        let columns = self
            .lookup(table, dialect.columns_query(), "column introspection failed")
            .await?;

        if columns.is_empty() {
            let ddl = create_table_statement(dialect, schema);
            debug!("Creating table with DDL: {}", ddl);
            self.run(table, &ddl, "create table failed").await?;
            report.created = true;
            info!("Created table {}", table);
        } else {
            let existing: HashSet<&str> = columns.iter().map(String::as_str).collect();
            self.add_missing_columns(schema, &existing, &mut report)
                .await?;
            self.add_missing_uniques(schema, &mut report).await?;
            self.add_missing_foreign_keys(schema, &mut report).await?;
        }

        self.add_missing_indexes(schema, &mut report).await?;

        if report.is_noop() {
            debug!("Table {} already matches its schema", table);
        } else if !report.created {
            info!(
                "Evolved table {}: {} column(s), {} constraint(s), {} index(es) added",
                table,
                report.added_columns.len(),
                report.added_constraints.len(),
                report.added_indexes.len()
            );
        }

        Ok(report)
    }

    async fn add_missing_columns(
        &self,
        schema: &EntitySchema,
        existing: &HashSet<&str>,
        report: &mut MaterializeReport,
    ) -> Result<()> {
        let dialect = self.sink.dialect();
        for field in schema.fields() {
            if existing.contains(field.dest_column.as_str()) {
                continue;
            }
            let stmt = add_column_statement(dialect, schema.table(), field);
            debug!("Adding column: {}", stmt);
            self.run(schema.table(), &stmt, "add column failed").await?;
            report.added_columns.push(field.dest_column.clone());
        }
        Ok(())
    }

    async fn add_missing_uniques(
        &self,
        schema: &EntitySchema,
        report: &mut MaterializeReport,
    ) -> Result<()> {
        let table = schema.table();
        let dialect = self.sink.dialect();

        if !schema.fields().iter().any(|f| f.unique) {
            return Ok(());
        }

        let unique_columns = self
            .lookup(
                table,
                dialect.constraint_columns_query(ConstraintKind::Unique),
                "constraint introspection failed",
            )
            .await?;
        let indexes = self
            .lookup(table, dialect.index_names_query(), "index introspection failed")
            .await?;

        for field in schema.fields().iter().filter(|f| f.unique) {
            let name = unique_name(table, &field.dest_column);
            if unique_columns.contains(&field.dest_column) || indexes.contains(&name) {
                continue;
            }
            let stmt = dialect.add_unique(table, &field.dest_column);
            debug!("Adding unique constraint: {}", stmt);
            self.run(table, &stmt, "add unique constraint failed").await?;
            report.added_constraints.push(name);
        }
        Ok(())
    }

    async fn add_missing_foreign_keys(
        &self,
        schema: &EntitySchema,
        report: &mut MaterializeReport,
    ) -> Result<()> {
        let table = schema.table();
        let dialect = self.sink.dialect();

        if schema.foreign_keys().next().is_none() {
            return Ok(());
        }

        let fk_columns = self
            .lookup(
                table,
                dialect.constraint_columns_query(ConstraintKind::ForeignKey),
                "constraint introspection failed",
            )
            .await?;

        for (field, fk) in schema.foreign_keys() {
            if fk_columns.contains(&field.dest_column) {
                continue;
            }
            let Some(stmt) = dialect.add_foreign_key(table, &field.dest_column, fk) else {
                return Err(Error::materialize(
                    table,
                    format!(
                        "cannot add foreign key {} -> {} to an existing {} table",
                        field.dest_column, fk, dialect
                    ),
                    None,
                ));
            };
            debug!("Adding foreign key: {}", stmt);
            self.run(table, &stmt, "add foreign key failed").await?;
            report
                .added_constraints
                .push(foreign_key_name(table, &field.dest_column));
        }
        Ok(())
    }

    async fn add_missing_indexes(
        &self,
        schema: &EntitySchema,
        report: &mut MaterializeReport,
    ) -> Result<()> {
        let table = schema.table();
        if schema.index_columns().is_empty() {
            return Ok(());
        }

        let existing = self
            .lookup(
                table,
                self.sink.dialect().index_names_query(),
                "index introspection failed",
            )
            .await?;

        for column in schema.index_columns() {
            let name = index_name(table, column);
            if existing.contains(&name) {
                continue;
            }
            self.run(table, &create_index_statement(table, column), "create index failed")
                .await?;
            report.added_indexes.push(name);
        }
        Ok(())
    }

    async fn lookup(&self, table: &str, query: &str, message: &str) -> Result<Vec<String>> {
        self.sink
            .query_column(query, &[SqlValue::Text(table.to_string())])
            .await
            .map_err(|e| fail(table, message, e))
    }

    async fn run(&self, table: &str, stmt: &str, message: &str) -> Result<()> {
        self.sink
            .execute(stmt, &[])
            .await
            .map(|_| ())
            .map_err(|e| fail(table, message, e))
    }
}

fn fail(table: &str, message: &str, e: SinkError) -> Error {
    Error::materialize(table, format!("{}: {}", message, e), Some(e))
}

/// Statements creating a table and its indexes from scratch.
pub fn plan_statements(dialect: Dialect, schema: &EntitySchema) -> Vec<String> {
    let mut statements = vec![create_table_statement(dialect, schema)];
    statements.extend(
        schema
            .index_columns()
            .iter()
            .map(|c| create_index_statement(schema.table(), c)),
    );
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldMapping;
    use crate::sink::DuckDbSink;

    fn users() -> EntitySchema {
        EntitySchema::builder("users")
            .field(FieldMapping::text("userID").unique())
            .field(FieldMapping::text("token"))
            .field(FieldMapping::boolean("premium").default_value("false"))
            .field(FieldMapping::text("email").omit_if_empty().default_value("null"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_table_statement_postgres() {
        let ddl = create_table_statement(Dialect::Postgres, &users());
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"users\""));
        assert!(ddl.contains("\"userID\" TEXT NOT NULL UNIQUE"));
        assert!(ddl.contains("\"premium\" BOOLEAN NOT NULL DEFAULT FALSE"));
        assert!(ddl.contains("\"email\" TEXT DEFAULT NULL"));
    }

    #[test]
    fn test_create_table_statement_foreign_key() {
        let schema = EntitySchema::builder("cv")
            .field(FieldMapping::text("userID").unique().references("users", "userID"))
            .build()
            .unwrap();
        let ddl = create_table_statement(Dialect::Postgres, &schema);
        assert!(ddl.contains(
            "CONSTRAINT \"cv_userID_fkey\" FOREIGN KEY (\"userID\") REFERENCES \"users\" (\"userID\")"
        ));
    }

    #[test]
    fn test_plan_includes_indexes() {
        let schema = EntitySchema::builder("events")
            .field(FieldMapping::text("kind"))
            .index("kind")
            .build()
            .unwrap();
        let plan = plan_statements(Dialect::DuckDb, &schema);
        assert_eq!(plan.len(), 2);
        assert!(plan[1].contains("\"events_kind_idx\""));
    }

    #[tokio::test]
    async fn test_reconcile_creates_then_is_idempotent() {
        let sink = DuckDbSink::in_memory().unwrap();
        let materializer = Materializer::new(&sink);

        let first = materializer.reconcile(&users()).await.unwrap();
        assert!(first.created);

        let second = materializer.reconcile(&users()).await.unwrap();
        assert!(second.is_noop(), "{:?}", second);
    }

    #[tokio::test]
    async fn test_reconcile_adds_missing_columns_and_keeps_rows() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute(
            "CREATE TABLE \"users\" (\"userID\" VARCHAR, \"token\" VARCHAR)",
            &[],
        )
        .await
        .unwrap();
        sink.execute(
            "INSERT INTO \"users\" VALUES ($1, $2)",
            &[SqlValue::Text("u1".into()), SqlValue::Text("t".into())],
        )
        .await
        .unwrap();

        let report = Materializer::new(&sink).reconcile(&users()).await.unwrap();
        assert!(!report.created);
        assert_eq!(report.added_columns, vec!["premium", "email"]);
        assert_eq!(report.added_constraints, vec!["users_userID_key"]);

        let premium = sink
            .query_column("SELECT CAST(\"premium\" AS VARCHAR) FROM \"users\"", &[])
            .await
            .unwrap();
        assert_eq!(premium, vec!["false"]);
    }

    #[tokio::test]
    async fn test_reconcile_adds_missing_unique() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute(
            "CREATE TABLE \"users\" (\"userID\" VARCHAR, \"token\" VARCHAR, \
             \"premium\" BOOLEAN, \"email\" VARCHAR)",
            &[],
        )
        .await
        .unwrap();

        let materializer = Materializer::new(&sink);
        let report = materializer.reconcile(&users()).await.unwrap();
        assert_eq!(report.added_constraints, vec!["users_userID_key"]);

        let again = materializer.reconcile(&users()).await.unwrap();
        assert!(again.is_noop(), "{:?}", again);
    }

    #[tokio::test]
    async fn test_missing_foreign_key_on_duckdb_is_fatal() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute("CREATE TABLE \"cv\" (\"userID\" VARCHAR)", &[])
            .await
            .unwrap();
        let schema = EntitySchema::builder("cv")
            .field(FieldMapping::text("userID").references("users", "userID"))
            .build()
            .unwrap();

        let err = Materializer::new(&sink).reconcile(&schema).await.unwrap_err();
        assert_eq!(err.code(), "MATERIALIZE_ERROR");
    }
}
