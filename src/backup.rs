//! Backup Runner: copies one collection into one destination table.
//!
//! Documents are drained from the source cursor and written one statement
//! per row, in source order. Per document the outcome is one of:
//!
//! - **written**: the row was inserted;
//! - **skipped**: the identity value already exists in the destination
//!   (the row was migrated by an earlier run and is left untouched);
//! - **failed**: the document could not be turned into a row (missing
//!   required value, coercion failure) or the database rejected it for a
//!   reason other than an identity collision.
//!
//! Failed rows are logged and counted; they never stop the backup. Only
//! fatal errors (lost connection, broken cursor) abort the entity.

use crate::error::{Error, Result};
use crate::metrics::{Metrics, RowMetric, Timer};
use crate::schema::{EntitySchema, FieldMapping};
use crate::sink::{Sink, SinkError, quote_ident, unique_name};
use crate::source::Source;
use crate::transform::{Transform, TransformRegistry};
use crate::value::{Document, SourceValue, SqlValue, coerce};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How many row errors a report keeps verbatim.
pub const MAX_REPORTED_ERRORS: usize = 10;

const PROGRESS_EVERY: u64 = 100;

/// Per-entity options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Destination table name overriding the schema's
    pub rename_to: Option<String>,
    /// Extra non-unique index columns
    pub index_columns: Vec<String>,
    /// Per-column transforms
    pub transforms: TransformRegistry,
}

impl BackupOptions {
    /// Options with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write to a differently named table.
    pub fn rename_to(mut self, table: impl Into<String>) -> Self {
        self.rename_to = Some(table.into());
        self
    }

    /// Add a non-unique index.
    pub fn index(mut self, column: impl Into<String>) -> Self {
        self.index_columns.push(column.into());
        self
    }

    /// Register a transform for a destination column.
    pub fn transform<F>(mut self, column: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Document) -> SourceValue + Send + Sync + 'static,
    {
        self.transforms.register(column, f);
        self
    }

    /// Use a prepared transform registry.
    pub fn transforms(mut self, transforms: TransformRegistry) -> Self {
        self.transforms = transforms;
        self
    }

    /// The schema these options produce: renamed, with extra indexes, and
    /// with every transform pointing at a real column.
    pub fn apply(&self, schema: &EntitySchema) -> Result<EntitySchema> {
        let schema = match &self.rename_to {
            Some(name) if !name.trim().is_empty() => schema.renamed(name.trim()),
            Some(_) => {
                return Err(Error::schema(schema.table(), "rename_to is empty"));
            }
            None => schema.clone(),
        };
        let schema = schema.with_index_columns(&self.index_columns)?;
        self.transforms.check_columns(&schema)?;
        Ok(schema)
    }
}

/// Value of one destination column in a row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// Bound value
    Value(SqlValue),
    /// The column's declared default, evaluated by the destination
    Default,
}

/// A coerced, transform-applied row ready for one insert.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DestinationRow {
    /// `(column, value)` in schema order
    pub columns: Vec<(String, ColumnValue)>,
}

impl DestinationRow {
    /// Value of a column.
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Columns with bound values and the values themselves; columns left to
    /// their default are omitted.
    pub fn bound(&self) -> (Vec<&str>, Vec<SqlValue>) {
        self.columns
            .iter()
            .filter_map(|(c, v)| match v {
                ColumnValue::Value(value) => Some((c.as_str(), value.clone())),
                ColumnValue::Default => None,
            })
            .unzip()
    }
}

fn resolve_field(
    field: &FieldMapping,
    transform: Option<&Transform>,
    doc: &Document,
) -> Result<ColumnValue> {
    if let Some(transform) = transform {
        let produced = transform(doc);
        return coerce(&produced, field.field_type)
            .map(ColumnValue::Value)
            .map_err(|e| Error::row(format!("transform for '{}': {}", field.dest_column, e)));
    }

    let raw = doc.get(&field.source_key);
    let absent = match raw {
        None => true,
        Some(v) if v.is_null() => true,
        Some(v) => field.omit_if_empty && v.is_empty(),
    };

    if absent {
        return if field.default.is_some() {
            Ok(ColumnValue::Default)
        } else if field.is_nullable() {
            Ok(ColumnValue::Value(SqlValue::Null))
        } else {
            Err(Error::row(format!(
                "missing required value '{}' for column '{}'",
                field.source_key, field.dest_column
            )))
        };
    }

    let raw = raw.unwrap_or(&SourceValue::Null);
    coerce(raw, field.field_type)
        .map(ColumnValue::Value)
        .map_err(|e| Error::row(format!("column '{}': {}", field.dest_column, e)))
}

/// Build the destination row for a document.
///
/// A registered transform always wins over the document's value. An absent
/// value (missing key, null, or empty under `omit_if_empty`) falls back to
/// the field's default, then to NULL when nullable; otherwise the document
/// is rejected with a row error.
pub fn build_row(
    schema: &EntitySchema,
    transforms: &TransformRegistry,
    doc: &Document,
) -> Result<DestinationRow> {
    let mut columns = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let value = resolve_field(field, transforms.get(&field.dest_column), doc)?;
        columns.push((field.dest_column.clone(), value));
    }
    Ok(DestinationRow { columns })
}

/// Insert statement for the given columns.
pub fn insert_statement(table: &str, columns: &[&str]) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
    }
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        names.join(", "),
        placeholders.join(", ")
    )
}

/// Whether a uniqueness violation hit the identity column.
///
/// The reported column is compared first, then the constraint name. Without
/// a declared identity, a schema with exactly one unique column uses that
/// column instead. A violation that names neither is not an identity hit.
fn is_identity_collision(schema: &EntitySchema, err: &SinkError) -> bool {
    let SinkError::UniqueViolation {
        constraint, column, ..
    } = err
    else {
        return false;
    };

    let mut uniques = schema.fields().iter().filter(|f| f.unique);
    let sole_unique = match (uniques.next(), uniques.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    };
    let Some(identity) = schema.identity().or(sole_unique) else {
        return false;
    };

    match (column, constraint) {
        (Some(column), _) => *column == identity.dest_column,
        (None, Some(name)) => *name == unique_name(schema.table(), &identity.dest_column),
        (None, None) => false,
    }
}

/// Outcome of writing one document.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// Inserted
    Written,
    /// Identity already present
    Skipped,
    /// Rejected, with the reason
    Failed(String),
}

/// Backup phase reported to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupPhase {
    /// Creating or evolving the destination table
    Materializing,
    /// Reading and writing documents
    Copying,
    /// Done
    Completed,
    /// Aborted by a fatal error
    Failed,
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupPhase::Materializing => write!(f, "materializing"),
            BackupPhase::Copying => write!(f, "copying"),
            BackupPhase::Completed => write!(f, "completed"),
            BackupPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Progress update.
#[derive(Debug, Clone)]
pub struct BackupProgress {
    /// Collection being backed up
    pub entity: String,
    /// Current phase
    pub phase: BackupPhase,
    /// Documents processed so far
    pub documents: u64,
}

/// Progress callback.
pub type ProgressCallback = Arc<dyn Fn(BackupProgress) + Send + Sync>;

/// Result of backing up one entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupReport {
    /// Source collection
    pub entity: String,
    /// Destination table
    pub table: String,
    /// Documents read
    pub documents: u64,
    /// Rows inserted
    pub written: u64,
    /// Rows skipped as already migrated
    pub skipped: u64,
    /// Rows rejected
    pub failed: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// First row errors, verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Fatal error that aborted the entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupReport {
    fn new(entity: &str, table: &str) -> Self {
        Self {
            entity: entity.to_string(),
            table: table.to_string(),
            ..Default::default()
        }
    }

    /// Whether the entity completed (row failures do not count against it).
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    fn record(&mut self, outcome: &RowOutcome) {
        self.documents += 1;
        match outcome {
            RowOutcome::Written => self.written += 1,
            RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::Failed(reason) => {
                self.failed += 1;
                if self.errors.len() < MAX_REPORTED_ERRORS {
                    self.errors
                        .push(format!("document #{}: {}", self.documents, reason));
                }
            }
        }
    }
}

/// Runs entity backups from an injected source into an injected sink.
pub struct BackupRunner<'a> {
    source: &'a dyn Source,
    sink: &'a dyn Sink,
    metrics: Option<Arc<Metrics>>,
    progress: Option<ProgressCallback>,
}

impl<'a> BackupRunner<'a> {
    /// Create a runner.
    pub fn new(source: &'a dyn Source, sink: &'a dyn Sink) -> Self {
        Self {
            source,
            sink,
            metrics: None,
            progress: None,
        }
    }

    /// Record row outcomes into shared metrics.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Receive progress updates.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Back up `collection` into the table described by `schema` and `options`.
    ///
    /// The destination table must already be materialized. Returns the
    /// report on completion; a fatal error is returned as
    /// [`Error::Backup`] naming the collection.
    #[instrument(skip(self, schema, options), fields(collection = %collection))]
    pub async fn run(
        &self,
        collection: &str,
        schema: &EntitySchema,
        options: &BackupOptions,
    ) -> Result<BackupReport> {
        let schema = options
            .apply(schema)
            .map_err(|e| Error::backup(collection, e))?;
        let mut report = BackupReport::new(collection, schema.table());
        let timer = Timer::start(format!("backup:{}", collection));

        info!("Backing up {} -> {}", collection, schema.table());
        self.report_progress(collection, BackupPhase::Copying, 0);

        let result = self
            .copy(collection, &schema, &options.transforms, &mut report)
            .await;
        report.duration_ms = timer.stop();

        if let Some(metrics) = &self.metrics {
            metrics.record_backup(collection, result.is_ok(), report.duration_ms);
        }

        match result {
            Ok(()) => {
                self.report_progress(collection, BackupPhase::Completed, report.documents);
                info!(
                    "Backed up {} in {}ms: {} written, {} skipped, {} failed",
                    collection, report.duration_ms, report.written, report.skipped, report.failed
                );
                Ok(report)
            }
            Err(e) => {
                self.report_progress(collection, BackupPhase::Failed, report.documents);
                tracing::error!(
                    "Backup of {} aborted after {} documents: {}",
                    collection,
                    report.documents,
                    e
                );
                Err(Error::backup(collection, e))
            }
        }
    }

    async fn copy(
        &self,
        collection: &str,
        schema: &EntitySchema,
        transforms: &TransformRegistry,
        report: &mut BackupReport,
    ) -> Result<()> {
        let mut documents = self.source.fetch(collection).await?;

        while let Some(item) = documents.next().await {
            let outcome = match item {
                Ok(doc) => self.write_document(schema, transforms, &doc).await?,
                Err(e) if !e.is_fatal() => RowOutcome::Failed(e.to_string()),
                Err(e) => return Err(e),
            };

            if let RowOutcome::Failed(reason) = &outcome {
                warn!(
                    "Skipping document #{} of {}: {}",
                    report.documents + 1,
                    collection,
                    reason
                );
            }
            if let Some(metrics) = &self.metrics {
                let metric = match &outcome {
                    RowOutcome::Written => RowMetric::Written,
                    RowOutcome::Skipped => RowMetric::Skipped,
                    RowOutcome::Failed(_) => RowMetric::Failed,
                };
                metrics.record_row(collection, metric);
            }
            report.record(&outcome);

            if report.documents % PROGRESS_EVERY == 0 {
                self.report_progress(collection, BackupPhase::Copying, report.documents);
            }
        }

        Ok(())
    }

    /// Build and insert one row. Only fatal sink errors are returned as `Err`.
    async fn write_document(
        &self,
        schema: &EntitySchema,
        transforms: &TransformRegistry,
        doc: &Document,
    ) -> Result<RowOutcome> {
        let row = match build_row(schema, transforms, doc) {
            Ok(row) => row,
            Err(e) if !e.is_fatal() => return Ok(RowOutcome::Failed(e.to_string())),
            Err(e) => return Err(e),
        };

        let (columns, values) = row.bound();
        let statement = insert_statement(schema.table(), &columns);

        match self.sink.execute(&statement, &values).await {
            Ok(_) => Ok(RowOutcome::Written),
            Err(e) if is_identity_collision(schema, &e) => {
                debug!("Identity already present in {}, skipping", schema.table());
                Ok(RowOutcome::Skipped)
            }
            Err(e) if e.is_connection() => Err(Error::sink(schema.table(), "insert failed", e)),
            Err(e) => Ok(RowOutcome::Failed(e.to_string())),
        }
    }

    fn report_progress(&self, entity: &str, phase: BackupPhase, documents: u64) {
        if let Some(callback) = &self.progress {
            callback(BackupProgress {
                entity: entity.to_string(),
                phase,
                documents,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DefaultExpr, FieldMapping};
    use crate::value::document;

    fn users() -> EntitySchema {
        EntitySchema::builder("users")
            .field(FieldMapping::text("userID").unique())
            .field(FieldMapping::text("token"))
            .field(FieldMapping::integer("views").default_value("0"))
            .field(FieldMapping::text("email").omit_if_empty().default_value("null"))
            .field(FieldMapping::text("bio").nullable())
            .build()
            .unwrap()
    }

    #[test]
    fn test_transform_wins_over_source_value() {
        let transforms = TransformRegistry::new()
            .with("token", |_| SourceValue::String("regenerated".into()));
        let doc = document([("userID", "42"), ("token", "raw-leaked-value")]);

        let row = build_row(&users(), &transforms, &doc).unwrap();
        assert_eq!(
            row.get("token"),
            Some(&ColumnValue::Value(SqlValue::Text("regenerated".into())))
        );
        assert_eq!(
            row.get("userID"),
            Some(&ColumnValue::Value(SqlValue::Text("42".into())))
        );
    }

    #[test]
    fn test_transform_applies_when_source_key_absent() {
        let transforms = TransformRegistry::new()
            .with("token", |_| SourceValue::String("fresh".into()));
        let doc = document([("userID", "42")]);
        let row = build_row(&users(), &transforms, &doc).unwrap();
        assert_eq!(
            row.get("token"),
            Some(&ColumnValue::Value(SqlValue::Text("fresh".into())))
        );
    }

    #[test]
    fn test_absent_values_use_defaults() {
        let doc = document([("userID", "42"), ("token", "t"), ("email", "")]);
        let row = build_row(&users(), &TransformRegistry::new(), &doc).unwrap();

        assert_eq!(row.get("views"), Some(&ColumnValue::Default));
        assert_eq!(row.get("email"), Some(&ColumnValue::Default));
        assert_eq!(row.get("bio"), Some(&ColumnValue::Value(SqlValue::Null)));

        let (columns, values) = row.bound();
        assert_eq!(columns, vec!["userID", "token", "bio"]);
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_empty_string_without_omit_is_kept() {
        let doc = document([("userID", "42"), ("token", "")]);
        let row = build_row(&users(), &TransformRegistry::new(), &doc).unwrap();
        assert_eq!(
            row.get("token"),
            Some(&ColumnValue::Value(SqlValue::Text(String::new())))
        );
    }

    #[test]
    fn test_missing_required_value_is_row_error() {
        let doc = document([("userID", "42")]);
        let err = build_row(&users(), &TransformRegistry::new(), &doc).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn test_coercion_failure_is_row_error() {
        let doc = document([("userID", "42"), ("token", "t"), ("views", "many")]);
        let err = build_row(&users(), &TransformRegistry::new(), &doc).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("views"));
    }

    #[test]
    fn test_insert_statement() {
        assert_eq!(
            insert_statement("users", &["userID", "token"]),
            "INSERT INTO \"users\" (\"userID\", \"token\") VALUES ($1, $2)"
        );
        assert_eq!(
            insert_statement("users", &[]),
            "INSERT INTO \"users\" DEFAULT VALUES"
        );
    }

    fn violation(constraint: Option<&str>, column: Option<&str>) -> SinkError {
        SinkError::UniqueViolation {
            constraint: constraint.map(str::to_string),
            column: column.map(str::to_string),
            message: "duplicate key".into(),
        }
    }

    #[test]
    fn test_identity_collision_detection() {
        let schema = users();
        assert!(is_identity_collision(&schema, &violation(Some("users_userID_key"), None)));
        assert!(!is_identity_collision(&schema, &violation(Some("users_email_key"), None)));
        assert!(is_identity_collision(&schema, &violation(None, Some("userID"))));
        assert!(!is_identity_collision(&schema, &violation(None, Some("userIDs"))));
        assert!(!is_identity_collision(&schema, &violation(None, None)));
        assert!(!is_identity_collision(
            &schema,
            &SinkError::ConstraintViolation("not null".into())
        ));
    }

    #[test]
    fn test_identity_collision_is_exact() {
        let schema = EntitySchema::builder("videos")
            .field(FieldMapping::text("id").identity())
            .field(FieldMapping::text("video_id").unique())
            .build()
            .unwrap();

        assert!(is_identity_collision(&schema, &violation(Some("videos_id_key"), None)));
        assert!(!is_identity_collision(&schema, &violation(Some("videos_video_id_key"), None)));
        assert!(!is_identity_collision(&schema, &violation(None, Some("video_id"))));
        assert!(!is_identity_collision(
            &schema,
            &violation(Some("videos_id_key"), Some("video_id"))
        ));
    }

    #[test]
    fn test_identity_collision_without_declared_identity() {
        let sole = EntitySchema::builder("cv")
            .field(FieldMapping::text("userID").unique())
            .field(FieldMapping::integer("views").default_value("0"))
            .build()
            .unwrap();
        assert!(is_identity_collision(&sole, &violation(None, Some("userID"))));

        let ambiguous = EntitySchema::builder("accounts")
            .field(FieldMapping::text("login").unique())
            .field(FieldMapping::text("email").unique())
            .build()
            .unwrap();
        assert!(!is_identity_collision(&ambiguous, &violation(None, Some("login"))));
        assert!(!is_identity_collision(&ambiguous, &violation(Some("accounts_login_key"), None)));
    }

    #[test]
    fn test_options_apply() {
        let options = BackupOptions::new()
            .rename_to("members")
            .index("token")
            .transform("token", |_| SourceValue::Null);
        let schema = options.apply(&users()).unwrap();
        assert_eq!(schema.table(), "members");
        assert_eq!(schema.index_columns(), ["token".to_string()]);

        let bad = BackupOptions::new().transform("nope", |_| SourceValue::Null);
        assert!(bad.apply(&users()).is_err());
    }

    #[test]
    fn test_report_caps_errors() {
        let mut report = BackupReport::new("users", "users");
        for _ in 0..(MAX_REPORTED_ERRORS + 5) {
            report.record(&RowOutcome::Failed("bad".into()));
        }
        report.record(&RowOutcome::Written);
        assert_eq!(report.failed, (MAX_REPORTED_ERRORS + 5) as u64);
        assert_eq!(report.errors.len(), MAX_REPORTED_ERRORS);
        assert_eq!(report.documents, (MAX_REPORTED_ERRORS + 6) as u64);
        assert!(report.success());
    }

    #[test]
    fn test_default_expr_is_kept_on_schema() {
        assert_eq!(
            users().field("views").unwrap().default,
            Some(DefaultExpr::Value(SqlValue::Integer(0)))
        );
    }
}
