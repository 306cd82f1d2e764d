//! Relational destinations.
//!
//! A [`Sink`] executes parameterized statements and answers single-column
//! introspection queries. Everything dialect-specific (type names, literal
//! rendering, catalog queries, constraint DDL) lives in [`Dialect`], so the
//! materializer and the backup runner stay database-agnostic.

pub mod motherduck;
pub mod postgres;

pub use motherduck::DuckDbSink;
pub use postgres::PostgresSink;

use crate::schema::{DefaultExpr, FieldType, ForeignKey};
use crate::value::SqlValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classified failure of a destination statement.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// A uniqueness constraint rejected the row
    #[error("unique violation: {message}")]
    UniqueViolation {
        /// Violated constraint, when the database reports it
        constraint: Option<String>,
        /// Column holding the duplicate, when the database reports it
        column: Option<String>,
        /// Database message
        message: String,
    },

    /// Any other integrity constraint (foreign key, not null, check)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The connection is gone
    #[error("connection error: {0}")]
    Connection(String),

    /// Statement failed for another reason
    #[error("execution error: {0}")]
    Execution(String),
}

impl SinkError {
    /// Whether the connection was lost.
    pub fn is_connection(&self) -> bool {
        matches!(self, SinkError::Connection(_))
    }

    /// Whether a uniqueness constraint was violated.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, SinkError::UniqueViolation { .. })
    }
}

/// A relational destination.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Execute a statement with positional `$n` parameters and return the
    /// number of affected rows. Without parameters the text may contain
    /// several statements.
    async fn execute(&self, statement: &str, params: &[SqlValue]) -> Result<u64, SinkError>;

    /// Run a query and return its first column as text, skipping NULLs.
    async fn query_column(
        &self,
        statement: &str,
        params: &[SqlValue],
    ) -> Result<Vec<String>, SinkError>;

    /// Run parameterless statements in one transaction. Nothing is kept
    /// when any of them fails.
    async fn execute_atomic(&self, statements: &[String]) -> Result<(), SinkError>;

    /// SQL dialect spoken by this sink.
    fn dialect(&self) -> Dialect;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Check the connection is alive.
    async fn ping(&self) -> Result<(), SinkError> {
        self.query_column("SELECT 'ok'", &[]).await.map(|_| ())
    }
}

/// Kind of constraint looked up during introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// UNIQUE or PRIMARY KEY
    Unique,
    /// FOREIGN KEY
    ForeignKey,
}

/// SQL dialect of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL
    Postgres,
    /// DuckDB / MotherDuck
    DuckDb,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::DuckDb => write!(f, "duckdb"),
        }
    }
}

/// Double-quote an identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Name of the unique constraint (or unique index) on `table.column`.
pub fn unique_name(table: &str, column: &str) -> String {
    format!("{}_{}_key", table, column)
}

/// Name of the foreign key on `table.column`.
pub fn foreign_key_name(table: &str, column: &str) -> String {
    format!("{}_{}_fkey", table, column)
}

/// Name of the non-unique index on `table.column`.
pub fn index_name(table: &str, column: &str) -> String {
    format!("{}_{}_idx", table, column)
}

impl Dialect {
    /// Column type for a field type.
    pub fn column_type(self, ty: FieldType) -> &'static str {
        match (self, ty) {
            (Dialect::Postgres, FieldType::Text) => "TEXT",
            (Dialect::Postgres, FieldType::Integer) => "BIGINT",
            (Dialect::Postgres, FieldType::Double) => "DOUBLE PRECISION",
            (Dialect::Postgres, FieldType::Boolean) => "BOOLEAN",
            (Dialect::Postgres, FieldType::Timestamp) => "TIMESTAMPTZ",
            (Dialect::Postgres, FieldType::TextArray) => "TEXT[]",
            (Dialect::Postgres, FieldType::Json) => "JSONB",
            (Dialect::DuckDb, FieldType::Text) => "VARCHAR",
            (Dialect::DuckDb, FieldType::Integer) => "BIGINT",
            (Dialect::DuckDb, FieldType::Double) => "DOUBLE",
            (Dialect::DuckDb, FieldType::Boolean) => "BOOLEAN",
            (Dialect::DuckDb, FieldType::Timestamp) => "TIMESTAMP",
            // arrays and mappings are stored as JSON text
            (Dialect::DuckDb, FieldType::TextArray) => "VARCHAR",
            (Dialect::DuckDb, FieldType::Json) => "VARCHAR",
        }
    }

    /// Render a literal value.
    pub fn literal(self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Text(s) => quote_literal(s),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Double(d) if d.is_finite() => d.to_string(),
            SqlValue::Double(d) => quote_literal(&d.to_string()),
            SqlValue::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            SqlValue::Timestamp(ts) => match self {
                Dialect::Postgres => format!("{}::timestamptz", quote_literal(&ts.to_rfc3339())),
                Dialect::DuckDb => format!(
                    "TIMESTAMP {}",
                    quote_literal(&ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string())
                ),
            },
            SqlValue::TextArray(items) => match self {
                Dialect::Postgres if items.is_empty() => "'{}'::text[]".to_string(),
                Dialect::Postgres => format!(
                    "ARRAY[{}]::text[]",
                    items
                        .iter()
                        .map(|s| quote_literal(s))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                Dialect::DuckDb => quote_literal(&value.to_json_text()),
            },
            SqlValue::Json(_) => match self {
                Dialect::Postgres => format!("{}::jsonb", quote_literal(&value.to_json_text())),
                Dialect::DuckDb => quote_literal(&value.to_json_text()),
            },
        }
    }

    /// Render a column default.
    pub fn default_clause(self, default: &DefaultExpr) -> String {
        match default {
            DefaultExpr::Null => "NULL".to_string(),
            DefaultExpr::Now => match self {
                Dialect::Postgres => "NOW()".to_string(),
                Dialect::DuckDb => "CAST(current_timestamp AS TIMESTAMP)".to_string(),
            },
            DefaultExpr::Value(value) => self.literal(value),
            DefaultExpr::Sql(expr) => expr.clone(),
        }
    }

    /// Query listing the columns of table `$1`.
    pub fn columns_query(self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position"
            }
            Dialect::DuckDb => {
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position"
            }
        }
    }

    /// Query returning the name of table `$1` when it exists.
    pub fn table_exists_query(self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            Dialect::DuckDb => {
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
        }
    }

    /// Query listing the columns of table `$1` covered by a constraint kind.
    pub fn constraint_columns_query(self, kind: ConstraintKind) -> &'static str {
        match (self, kind) {
            (Dialect::Postgres, ConstraintKind::Unique) => {
                "SELECT kcu.column_name::text FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                  AND tc.table_name = kcu.table_name \
                 WHERE tc.table_schema = current_schema() AND tc.table_name = $1 \
                   AND tc.constraint_type IN ('UNIQUE', 'PRIMARY KEY')"
            }
            (Dialect::Postgres, ConstraintKind::ForeignKey) => {
                "SELECT kcu.column_name::text FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                  AND tc.table_name = kcu.table_name \
                 WHERE tc.table_schema = current_schema() AND tc.table_name = $1 \
                   AND tc.constraint_type = 'FOREIGN KEY'"
            }
            (Dialect::DuckDb, ConstraintKind::Unique) => {
                "SELECT unnest(constraint_column_names) FROM duckdb_constraints() \
                 WHERE schema_name = current_schema() AND table_name = $1 \
                   AND constraint_type IN ('UNIQUE', 'PRIMARY KEY')"
            }
            (Dialect::DuckDb, ConstraintKind::ForeignKey) => {
                "SELECT unnest(constraint_column_names) FROM duckdb_constraints() \
                 WHERE schema_name = current_schema() AND table_name = $1 \
                   AND constraint_type = 'FOREIGN KEY'"
            }
        }
    }

    /// Query listing the index names of table `$1`.
    pub fn index_names_query(self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT indexname::text FROM pg_indexes \
                 WHERE schemaname = current_schema() AND tablename = $1"
            }
            Dialect::DuckDb => {
                "SELECT index_name FROM duckdb_indexes() \
                 WHERE schema_name = current_schema() AND table_name = $1"
            }
        }
    }

    /// Statement adding a uniqueness constraint to an existing table.
    pub fn add_unique(self, table: &str, column: &str) -> String {
        let name = quote_ident(&unique_name(table, column));
        match self {
            Dialect::Postgres => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                quote_ident(table),
                name,
                quote_ident(column)
            ),
            Dialect::DuckDb => format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                name,
                quote_ident(table),
                quote_ident(column)
            ),
        }
    }

    /// Statement adding a foreign key to an existing table, if the dialect
    /// can alter constraints in place.
    pub fn add_foreign_key(self, table: &str, column: &str, fk: &ForeignKey) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(table),
                quote_ident(&foreign_key_name(table, column)),
                quote_ident(column),
                quote_ident(&fk.table),
                quote_ident(&fk.column)
            )),
            Dialect::DuckDb => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("userID"), "\"userID\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_literals() {
        let pg = Dialect::Postgres;
        let duck = Dialect::DuckDb;
        assert_eq!(pg.literal(&SqlValue::Text("O'Brien".into())), "'O''Brien'");
        assert_eq!(pg.literal(&SqlValue::Boolean(false)), "FALSE");
        assert_eq!(pg.literal(&SqlValue::TextArray(vec![])), "'{}'::text[]");
        assert_eq!(
            pg.literal(&SqlValue::TextArray(vec!["a".into(), "b".into()])),
            "ARRAY['a', 'b']::text[]"
        );
        assert_eq!(duck.literal(&SqlValue::TextArray(vec![])), "'[]'");

        let ts = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            duck.literal(&SqlValue::Timestamp(ts)),
            "TIMESTAMP '2024-01-02 03:04:05.000000'"
        );
    }

    #[test]
    fn test_default_clause() {
        assert_eq!(Dialect::Postgres.default_clause(&DefaultExpr::Now), "NOW()");
        assert_eq!(
            Dialect::DuckDb.default_clause(&DefaultExpr::Now),
            "CAST(current_timestamp AS TIMESTAMP)"
        );
        assert_eq!(
            Dialect::Postgres.default_clause(&DefaultExpr::Sql("gen_random_uuid()".into())),
            "gen_random_uuid()"
        );
    }

    #[test]
    fn test_constraint_ddl() {
        assert_eq!(
            Dialect::Postgres.add_unique("users", "userID"),
            "ALTER TABLE \"users\" ADD CONSTRAINT \"users_userID_key\" UNIQUE (\"userID\")"
        );
        assert!(
            Dialect::DuckDb
                .add_unique("users", "userID")
                .starts_with("CREATE UNIQUE INDEX IF NOT EXISTS")
        );
        let fk = ForeignKey::new("users", "userID");
        assert!(Dialect::DuckDb.add_foreign_key("cv", "userID", &fk).is_none());
        assert!(
            Dialect::Postgres
                .add_foreign_key("cv", "userID", &fk)
                .unwrap()
                .contains("REFERENCES \"users\" (\"userID\")")
        );
    }

    #[test]
    fn test_sink_error_classification() {
        assert!(SinkError::Connection("reset".into()).is_connection());
        assert!(
            SinkError::UniqueViolation {
                constraint: None,
                column: None,
                message: "dup".into()
            }
            .is_unique_violation()
        );
        assert!(!SinkError::Execution("syntax".into()).is_connection());
    }
}
