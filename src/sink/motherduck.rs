//! DuckDB sink, local or on MotherDuck.

use super::{Dialect, Sink, SinkError, quote_ident};
use crate::config::DuckDbConfig;
use crate::error::{Error, Result};
use crate::value::SqlValue;
use async_trait::async_trait;
use duckdb::types::{TimeUnit, ToSqlOutput, Value, ValueRef};
use duckdb::{Connection, params_from_iter};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

/// DuckDB sink. The connection is shared behind a mutex.
pub struct DuckDbSink {
    conn: Mutex<Connection>,
}

impl DuckDbSink {
    /// Open the configured database.
    ///
    /// With a MotherDuck token the database is opened as `md:<database>`,
    /// created first when `create_database` is set. Otherwise `path` is a
    /// local file or `:memory:`.
    #[instrument(skip(config), fields(target = %config.display_target()))]
    pub fn open(config: &DuckDbConfig) -> Result<Self> {
        let conn = match (&config.motherduck_token, &config.database) {
            (Some(token), Some(database)) => {
                info!("Connecting to MotherDuck...");
                if config.create_database {
                    let init = Connection::open(format!("md:?motherduck_token={}", token))
                        .map_err(|e| connection_error("Failed to connect to MotherDuck", e))?;
                    init.execute_batch(&format!(
                        "CREATE DATABASE IF NOT EXISTS {}",
                        quote_ident(database)
                    ))
                    .map_err(|e| connection_error("Failed to create database", e))?;
                    info!("Ensured database exists: {}", database);
                }
                Connection::open(format!("md:{}?motherduck_token={}", database, token))
                    .map_err(|e| connection_error("Failed to connect to database", e))?
            }
            (Some(_), None) => {
                return Err(Error::config("MotherDuck token given without a database"));
            }
            _ if config.path == ":memory:" => Connection::open_in_memory()
                .map_err(|e| connection_error("Failed to open in-memory database", e))?,
            _ => Connection::open(&config.path)
                .map_err(|e| connection_error("Failed to open database file", e))?,
        };

        if config.schema != "main" {
            conn.execute_batch(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema}; SET schema = '{raw}'",
                schema = quote_ident(&config.schema),
                raw = config.schema.replace('\'', "''")
            ))
            .map_err(|e| connection_error("Failed to select schema", e))?;
        }

        info!("Opened DuckDB database: {}", config.display_target());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::open(&DuckDbConfig::default())
    }

    fn lock(&self) -> std::result::Result<MutexGuard<'_, Connection>, SinkError> {
        self.conn
            .lock()
            .map_err(|_| SinkError::Connection("connection lock poisoned".into()))
    }
}

fn connection_error(message: &str, e: duckdb::Error) -> Error {
    Error::sink_connection(message, SinkError::Connection(e.to_string()))
}

#[async_trait]
impl Sink for DuckDbSink {
    async fn execute(&self, statement: &str, params: &[SqlValue]) -> std::result::Result<u64, SinkError> {
        debug!("Executing: {}", statement);
        let conn = self.lock()?;

        if params.is_empty() {
            conn.execute_batch(statement).map_err(classify)?;
            return Ok(0);
        }

        let affected = conn
            .execute(statement, params_from_iter(params.iter()))
            .map_err(classify)?;
        Ok(affected as u64)
    }

    async fn execute_atomic(&self, statements: &[String]) -> std::result::Result<(), SinkError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(classify)?;
        for statement in statements {
            debug!("Executing in transaction: {}", statement);
            tx.execute_batch(statement).map_err(classify)?;
        }
        tx.commit().map_err(classify)
    }

    async fn query_column(
        &self,
        statement: &str,
        params: &[SqlValue],
    ) -> std::result::Result<Vec<String>, SinkError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(statement).map_err(classify)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                row.get::<_, Option<String>>(0)
            })
            .map_err(classify)?;

        let mut values = Vec::new();
        for row in rows {
            values.extend(row.map_err(classify)?);
        }
        Ok(values)
    }

    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    fn name(&self) -> &'static str {
        "duckdb"
    }
}

/// Classify a DuckDB error by its message; the C API exposes no error codes.
fn classify(e: duckdb::Error) -> SinkError {
    let message = e.to_string();
    let lower = message.to_lowercase();

    if lower.contains("duplicate key") || lower.contains("unique constraint") {
        SinkError::UniqueViolation {
            constraint: None,
            column: duplicate_key_column(&message),
            message,
        }
    } else if lower.contains("constraint error") || lower.contains("violates foreign key") {
        SinkError::ConstraintViolation(message)
    } else if lower.contains("connection") && lower.contains("closed") {
        SinkError::Connection(message)
    } else {
        SinkError::Execution(message)
    }
}

/// Column named in `Duplicate key "<column>: <value>" violates ...`.
///
/// A composite key reads `"<a>: <x>, <b>: <y>"` and names no single column.
fn duplicate_key_column(message: &str) -> Option<String> {
    const PREFIX: &str = "duplicate key \"";
    let start = message.to_ascii_lowercase().find(PREFIX)? + PREFIX.len();
    let rest = message.get(start..)?;
    let key = match rest.find("\" violates") {
        Some(end) => &rest[..end],
        None => rest.rsplit_once('"').map_or(rest, |(key, _)| key),
    };

    let (column, value) = key.split_once(": ")?;
    if column.is_empty() || column.contains(", ") || names_another_column(value) {
        return None;
    }
    Some(column.to_string())
}

/// Whether key text continues with a `, <identifier>: ` segment.
fn names_another_column(value: &str) -> bool {
    value.match_indices(", ").any(|(i, sep)| {
        value[i + sep.len()..]
            .split_once(": ")
            .is_some_and(|(ident, _)| {
                !ident.is_empty() && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            })
    })
}

impl duckdb::ToSql for SqlValue {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::BigInt(*i)),
            SqlValue::Double(d) => ToSqlOutput::Owned(Value::Double(*d)),
            SqlValue::Boolean(b) => ToSqlOutput::Owned(Value::Boolean(*b)),
            SqlValue::Timestamp(ts) => {
                ToSqlOutput::Owned(Value::Timestamp(TimeUnit::Microsecond, ts.timestamp_micros()))
            }
            SqlValue::TextArray(_) | SqlValue::Json(_) => {
                ToSqlOutput::Owned(Value::Text(self.to_json_text()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_execute_and_query_column() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute("CREATE TABLE t (a VARCHAR, b BIGINT, c TIMESTAMP)", &[])
            .await
            .unwrap();

        let ts = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let affected = sink
            .execute(
                "INSERT INTO t (a, b, c) VALUES ($1, $2, $3)",
                &[
                    SqlValue::Text("x".into()),
                    SqlValue::Integer(42),
                    SqlValue::Timestamp(ts),
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let values = sink
            .query_column(
                "SELECT CAST(b AS VARCHAR) FROM t WHERE a = $1",
                &[SqlValue::Text("x".into())],
            )
            .await
            .unwrap();
        assert_eq!(values, vec!["42"]);

        let values = sink
            .query_column("SELECT CAST(c AS VARCHAR) FROM t", &[])
            .await
            .unwrap();
        assert_eq!(values, vec!["2024-05-01 12:00:00"]);
    }

    #[tokio::test]
    async fn test_unique_violation_is_classified() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute("CREATE TABLE u (id VARCHAR UNIQUE)", &[])
            .await
            .unwrap();
        let insert = "INSERT INTO u (id) VALUES ($1)";
        sink.execute(insert, &[SqlValue::Text("a".into())])
            .await
            .unwrap();
        let err = sink
            .execute(insert, &[SqlValue::Text("a".into())])
            .await
            .unwrap_err();
        assert!(err.is_unique_violation(), "{:?}", err);
        assert!(
            matches!(&err, SinkError::UniqueViolation { column: Some(c), .. } if c == "id"),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_duplicate_key_column() {
        assert_eq!(
            duplicate_key_column(
                "Constraint Error: Duplicate key \"userID: sid@example.com\" violates unique constraint."
            ),
            Some("userID".to_string())
        );
        assert_eq!(
            duplicate_key_column("Duplicate key \"email: a: b\" violates unique constraint"),
            Some("email".to_string())
        );
        assert_eq!(
            duplicate_key_column("Duplicate key \"email: a, b\" violates unique constraint"),
            Some("email".to_string())
        );
        assert_eq!(duplicate_key_column("Duplicate key \"a: 1, b: 2\" violates"), None);
        assert_eq!(
            duplicate_key_column(
                "Constraint Error: Duplicate key \"id: 1, email: sid@example.com\" violates unique constraint."
            ),
            None
        );
        assert_eq!(duplicate_key_column("unique constraint violated"), None);
    }

    #[tokio::test]
    async fn test_composite_unique_names_no_column() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute("CREATE TABLE pairs (id VARCHAR, email VARCHAR, UNIQUE (id, email))", &[])
            .await
            .unwrap();
        let insert = "INSERT INTO pairs (id, email) VALUES ($1, $2)";
        let row = [SqlValue::Text("1".into()), SqlValue::Text("a@example.com".into())];
        sink.execute(insert, &row).await.unwrap();

        let err = sink.execute(insert, &row).await.unwrap_err();
        assert!(
            matches!(&err, SinkError::UniqueViolation { column: None, .. }),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_not_null_violation_is_constraint_error() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute("CREATE TABLE n (id VARCHAR NOT NULL, x BIGINT)", &[])
            .await
            .unwrap();
        let err = sink
            .execute("INSERT INTO n (x) VALUES ($1)", &[SqlValue::Integer(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::ConstraintViolation(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_execute_atomic_rolls_back() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();

        let err = sink
            .execute_atomic(&[
                "INSERT INTO t VALUES (1)".to_string(),
                "INSERT INTO missing VALUES (2)".to_string(),
            ])
            .await
            .unwrap_err();
        assert!(!err.is_unique_violation());

        sink.execute_atomic(&["INSERT INTO t VALUES (3)".to_string()])
            .await
            .unwrap();
        let ids = sink
            .query_column("SELECT CAST(id AS VARCHAR) FROM t", &[])
            .await
            .unwrap();
        assert_eq!(ids, vec!["3"]);
    }

    #[tokio::test]
    async fn test_ping() {
        let sink = DuckDbSink::in_memory().unwrap();
        sink.ping().await.unwrap();
    }
}
