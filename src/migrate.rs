//! Migration Runner: ordered destination-side migrations applied once each.
//!
//! Applied migrations are recorded by name in a history table on the
//! destination. A run skips names already in the history, applies the rest
//! in order, and stops at the first failure; earlier steps stay applied.
//! SQL migrations are applied together with their history row in one
//! transaction. Reading the history never creates the table.

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::schema::{DefaultExpr, FieldType};
use crate::sink::{Sink, SinkError, quote_ident, quote_literal};
use crate::value::SqlValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Name of the history table.
pub const HISTORY_TABLE: &str = "_docshift_migrations";

/// A named destination migration.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// Unique name recorded in the history table.
    fn name(&self) -> &str;

    /// Apply the migration.
    async fn apply(&self, sink: &dyn Sink) -> std::result::Result<(), SinkError>;

    /// SQL text, for steps that can be applied atomically with their history row.
    fn sql(&self) -> Option<&str> {
        None
    }
}

/// A migration consisting of SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlMigration {
    /// Migration name
    pub name: String,
    /// Statements, separated by `;`
    pub sql: String,
}

impl SqlMigration {
    /// Create a SQL migration.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

#[async_trait]
impl MigrationStep for SqlMigration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, sink: &dyn Sink) -> std::result::Result<(), SinkError> {
        sink.execute(&self.sql, &[]).await.map(|_| ())
    }

    fn sql(&self) -> Option<&str> {
        Some(&self.sql)
    }
}

/// A history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Migration name
    pub name: String,
    /// When it was applied, as reported by the destination
    pub applied_at: String,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Migrations applied by this run, in order
    pub applied: Vec<String>,
    /// Migrations already in the history
    pub skipped: Vec<String>,
}

/// Applies migrations against an injected sink.
pub struct MigrationRunner<'a> {
    sink: &'a dyn Sink,
    metrics: Option<Arc<Metrics>>,
}

impl<'a> MigrationRunner<'a> {
    /// Create a runner.
    pub fn new(sink: &'a dyn Sink) -> Self {
        Self {
            sink,
            metrics: None,
        }
    }

    /// Count applied migrations into shared metrics.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn history_ddl(&self) -> String {
        let dialect = self.sink.dialect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (name {} PRIMARY KEY, applied_at {} NOT NULL DEFAULT {})",
            quote_ident(HISTORY_TABLE),
            dialect.column_type(FieldType::Text),
            dialect.column_type(FieldType::Timestamp),
            dialect.default_clause(&DefaultExpr::Now),
        )
    }

    async fn ensure_history(&self) -> Result<()> {
        self.sink
            .execute(&self.history_ddl(), &[])
            .await
            .map(|_| ())
            .map_err(|e| Error::migration(HISTORY_TABLE, "cannot create history table", e))
    }

    /// Whether the history table exists on the destination.
    pub async fn history_exists(&self) -> Result<bool> {
        let found = self
            .sink
            .query_column(
                self.sink.dialect().table_exists_query(),
                &[SqlValue::Text(HISTORY_TABLE.to_string())],
            )
            .await
            .map_err(|e| Error::migration(HISTORY_TABLE, "cannot look up history table", e))?;
        Ok(!found.is_empty())
    }

    /// Migrations recorded in the history, oldest first. Empty when no
    /// history table exists yet.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>> {
        if !self.history_exists().await? {
            return Ok(Vec::new());
        }
        let rows = self
            .sink
            .query_column(
                &format!(
                    "SELECT name || '|' || CAST(applied_at AS VARCHAR) FROM {} ORDER BY applied_at, name",
                    quote_ident(HISTORY_TABLE)
                ),
                &[],
            )
            .await
            .map_err(|e| Error::migration(HISTORY_TABLE, "cannot read history", e))?;

        Ok(rows
            .into_iter()
            .map(|row| match row.rsplit_once('|') {
                Some((name, at)) => AppliedMigration {
                    name: name.to_string(),
                    applied_at: at.to_string(),
                },
                None => AppliedMigration {
                    name: row,
                    applied_at: String::new(),
                },
            })
            .collect())
    }

    /// Apply every migration not yet in the history, in order.
    ///
    /// Duplicate names are rejected before anything runs. The first failing
    /// migration stops the run and is returned as [`Error::Migration`].
    #[instrument(skip(self, migrations), fields(count = migrations.len()))]
    pub async fn run(&self, migrations: &[Arc<dyn MigrationStep>]) -> Result<MigrationReport> {
        let mut seen = HashSet::new();
        for migration in migrations {
            if !seen.insert(migration.name()) {
                return Err(Error::config(format!(
                    "duplicate migration name '{}'",
                    migration.name()
                )));
            }
        }

        self.ensure_history().await?;
        let done: HashSet<String> = self.applied().await?.into_iter().map(|m| m.name).collect();
        let mut report = MigrationReport::default();

        for migration in migrations {
            let name = migration.name();
            if done.contains(name) {
                debug!("Migration {} already applied", name);
                report.skipped.push(name.to_string());
                continue;
            }

            info!(migration = %name, "Applying migration");
            let record = format!(
                "INSERT INTO {} (name) VALUES ({})",
                quote_ident(HISTORY_TABLE),
                quote_literal(name)
            );

            match migration.sql() {
                Some(sql) => self
                    .sink
                    .execute_atomic(&[sql.to_string(), record])
                    .await
                    .map_err(|e| Error::migration(name, e.to_string(), e))?,
                None => {
                    migration
                        .apply(self.sink)
                        .await
                        .map_err(|e| Error::migration(name, e.to_string(), e))?;
                    self.sink
                        .execute(&record, &[])
                        .await
                        .map(|_| ())
                        .map_err(|e| Error::migration(name, "applied but not recorded", e))?;
                }
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_migration();
            }
            report.applied.push(name.to_string());
        }

        info!(
            "Migrations complete: {} applied, {} already applied",
            report.applied.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}
