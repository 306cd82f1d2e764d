//! Legacy repair passes, run after backups and migrations.
//!
//! A repair pass reads raw documents from the source and writes directly
//! through [`Sink::execute`], bypassing field mappings entirely.

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::schema::FieldType;
use crate::sink::{Sink, quote_ident};
use crate::source::Source;
use crate::value::{Document, SourceValue, SqlValue, coerce};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Counts from one repair pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// Pass name
    pub name: String,
    /// Documents read
    pub documents: u64,
    /// Rows inserted
    pub written: u64,
    /// Documents with nothing to repair, or rows already present
    pub skipped: u64,
    /// Documents that could not be repaired
    pub failed: u64,
}

/// A post-backup corrective pass.
#[async_trait]
pub trait RepairPass: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Run the pass.
    async fn run(&self, source: &dyn Source, sink: &dyn Sink) -> Result<RepairReport>;
}

/// One column copied out of the nested element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairColumn {
    /// Key inside the nested element
    pub source: String,
    /// Destination column
    pub dest: String,
    /// Destination type
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl RepairColumn {
    /// Create a column mapping.
    pub fn new(source: impl Into<String>, dest: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            field_type,
        }
    }
}

/// Re-derives rows from the first element of a nested array.
///
/// For each document of `collection`, takes `nested_field[0]` and inserts
/// `key_field` plus the mapped keys of that element into `table`. A missing
/// or empty array is skipped; a first element that is not a mapping is a
/// failure. Rows whose key already exists are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedFirstElementRepair {
    /// Pass name
    pub name: String,
    /// Source collection
    pub collection: String,
    /// Key read from the top-level document
    pub key_field: String,
    /// Destination column receiving the key
    pub key_column: String,
    /// Array field holding the legacy elements
    pub nested_field: String,
    /// Destination table
    pub table: String,
    /// Columns copied from the first element
    pub columns: Vec<RepairColumn>,
}

enum Repaired {
    Written,
    Skipped(&'static str),
    Failed(String),
}

impl NestedFirstElementRepair {
    /// Create a pass with no columns.
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        nested_field: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            key_field: "_id".to_string(),
            key_column: "_id".to_string(),
            nested_field: nested_field.into(),
            table: table.into(),
            columns: Vec::new(),
        }
    }

    /// Key read from the document and the column it lands in.
    pub fn key(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.key_field = field.into();
        self.key_column = column.into();
        self
    }

    /// Copy a key of the nested element into a column.
    pub fn column(
        mut self,
        source: impl Into<String>,
        dest: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        self.columns.push(RepairColumn::new(source, dest, field_type));
        self
    }

    fn insert_statement(&self) -> String {
        let columns: Vec<String> = std::iter::once(&self.key_column)
            .chain(self.columns.iter().map(|c| &c.dest))
            .map(|c| quote_ident(c))
            .collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.table),
            columns.join(", "),
            placeholders.join(", ")
        )
    }

    /// Values for one document, or why it was passed over.
    fn row(&self, doc: &Document) -> std::result::Result<Vec<SqlValue>, Repaired> {
        let key = match doc.get(&self.key_field) {
            Some(v) if !v.is_null() => coerce(v, FieldType::Text)
                .map_err(|e| Repaired::Failed(e.to_string()))?,
            _ => return Err(Repaired::Failed(format!("missing '{}'", self.key_field))),
        };

        let first = match doc.get(&self.nested_field) {
            Some(SourceValue::Array(items)) => match items.first() {
                Some(first) => first,
                None => return Err(Repaired::Skipped("empty")),
            },
            None | Some(SourceValue::Null) => return Err(Repaired::Skipped("missing")),
            Some(other) => {
                return Err(Repaired::Failed(format!(
                    "'{}' is a {}, not an array",
                    self.nested_field,
                    other.type_name()
                )));
            }
        };
        let SourceValue::Document(element) = first else {
            return Err(Repaired::Failed(format!(
                "first element of '{}' is a {}, not a document",
                self.nested_field,
                first.type_name()
            )));
        };

        let mut values = Vec::with_capacity(self.columns.len() + 1);
        values.push(key);
        for column in &self.columns {
            let raw = element.get(&column.source).unwrap_or(&SourceValue::Null);
            let value = coerce(raw, column.field_type)
                .map_err(|e| Repaired::Failed(format!("column '{}': {}", column.dest, e)))?;
            values.push(value);
        }
        Ok(values)
    }
}

#[async_trait]
impl RepairPass for NestedFirstElementRepair {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, source, sink), fields(repair = %self.name, table = %self.table))]
    async fn run(&self, source: &dyn Source, sink: &dyn Sink) -> Result<RepairReport> {
        let mut report = RepairReport {
            name: self.name.clone(),
            ..Default::default()
        };
        let statement = self.insert_statement();
        let mut documents = source
            .fetch(&self.collection)
            .await
            .map_err(|e| Error::repair(&self.name, "cannot read source", e))?;

        while let Some(item) = documents.next().await {
            report.documents += 1;
            let doc = match item {
                Ok(doc) => doc,
                Err(e) if !e.is_fatal() => {
                    warn!("Repair {}: document #{}: {}", self.name, report.documents, e);
                    report.failed += 1;
                    continue;
                }
                Err(e) => return Err(Error::repair(&self.name, "source cursor failed", e)),
            };

            let outcome = match self.row(&doc) {
                Ok(values) => match sink.execute(&statement, &values).await {
                    Ok(_) => Repaired::Written,
                    Err(e) if e.is_unique_violation() => Repaired::Skipped("already present"),
                    Err(e) if e.is_connection() => {
                        return Err(Error::repair(
                            &self.name,
                            "insert failed",
                            Error::sink(&self.table, "insert failed", e),
                        ));
                    }
                    Err(e) => Repaired::Failed(e.to_string()),
                },
                Err(outcome) => outcome,
            };

            match outcome {
                Repaired::Written => report.written += 1,
                Repaired::Skipped(why) => {
                    debug!("Repair {}: document #{} skipped ({})", self.name, report.documents, why);
                    report.skipped += 1;
                }
                Repaired::Failed(reason) => {
                    warn!("Repair {}: document #{}: {}", self.name, report.documents, reason);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Repair {} complete: {} written, {} skipped, {} failed",
            self.name, report.written, report.skipped, report.failed
        );
        Ok(report)
    }
}

/// Run passes in order, stopping at the first fatal error.
pub async fn run_all(
    passes: &[Arc<dyn RepairPass>],
    source: &dyn Source,
    sink: &dyn Sink,
    metrics: Option<&Metrics>,
) -> Result<Vec<RepairReport>> {
    let mut reports = Vec::with_capacity(passes.len());
    for pass in passes {
        let report = pass.run(source, sink).await?;
        if let Some(metrics) = metrics {
            metrics.record_repair_rows(pass.name(), report.written);
        }
        reports.push(report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::DuckDbSink;
    use crate::source::MemorySource;
    use crate::value::document;

    fn details_repair() -> NestedFirstElementRepair {
        NestedFirstElementRepair::new("details", "users", "details", "details")
            .key("userID", "userID")
            .column("exp", "exp", FieldType::Integer)
            .column("salary", "salary", FieldType::Integer)
    }

    fn legacy_user(id: &str, details: SourceValue) -> Document {
        let mut doc = document([("userID", id)]);
        doc.insert("details".into(), details);
        doc
    }

    #[test]
    fn test_insert_statement() {
        assert_eq!(
            details_repair().insert_statement(),
            "INSERT INTO \"details\" (\"userID\", \"exp\", \"salary\") VALUES ($1, $2, $3)"
        );
    }

    #[tokio::test]
    async fn test_nested_first_element_repair() {
        let first = SourceValue::Document(document([("exp", 3i64), ("salary", 1000i64)]));
        let second = SourceValue::Document(document([("exp", 9i64), ("salary", 9i64)]));

        let mut source = MemorySource::new().with_collection(
            "users",
            vec![
                legacy_user("1", SourceValue::Array(vec![first, second])),
                legacy_user("2", SourceValue::Array(vec![])),
                document([("userID", "3")]),
                legacy_user("4", SourceValue::Array(vec![SourceValue::from("junk")])),
            ],
        );
        source.connect().await.unwrap();

        let sink = DuckDbSink::in_memory().unwrap();
        sink.execute(
            "CREATE TABLE details (\"userID\" VARCHAR UNIQUE, exp BIGINT, salary BIGINT)",
            &[],
        )
        .await
        .unwrap();

        let report = details_repair().run(&source, &sink).await.unwrap();
        assert_eq!(report.documents, 4);
        assert_eq!(report.written, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 1);

        let rows = sink
            .query_column("SELECT CAST(exp AS VARCHAR) FROM details WHERE \"userID\" = '1'", &[])
            .await
            .unwrap();
        assert_eq!(rows, vec!["3"]);

        let again = details_repair().run(&source, &sink).await.unwrap();
        assert_eq!(again.written, 0);
        assert_eq!(again.skipped, 3);
    }
}
