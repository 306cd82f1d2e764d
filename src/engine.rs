//! The whole backup run.
//!
//! [`BackupEngine::run`] validates every schema, connects, materializes the
//! destination tables in declaration order, backs up each entity, then runs
//! migrations and repair passes. Entities are independent units of work; with
//! `parallel` set, entities on the same foreign-key level run concurrently.

use crate::backup::{
    BackupOptions, BackupPhase, BackupProgress, BackupReport, BackupRunner, ProgressCallback,
};
use crate::config::{BackupConfig, EntityConfig, SinkConfig};
use crate::error::{Error, Result};
use crate::materialize::{MaterializeReport, Materializer, plan_statements};
use crate::metrics::{Metrics, MetricsSnapshot, Timer};
use crate::migrate::{AppliedMigration, MigrationReport, MigrationRunner, MigrationStep};
use crate::repair::{self, RepairPass, RepairReport};
use crate::schema::{EntitySchema, SchemaCatalog};
use crate::sink::{Dialect, DuckDbSink, PostgresSink, Sink};
use crate::source::{MongoSource, Source};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// One entity to back up.
#[derive(Debug, Clone)]
pub struct EntityJob {
    /// Source collection
    pub collection: String,
    /// Declared schema
    pub schema: EntitySchema,
    /// Caller options
    pub options: BackupOptions,
}

impl EntityJob {
    /// Create a job.
    pub fn new(collection: impl Into<String>, schema: EntitySchema, options: BackupOptions) -> Self {
        Self {
            collection: collection.into(),
            schema,
            options,
        }
    }

    /// Build a job from its configuration.
    pub fn from_config(entity: &EntityConfig) -> Result<Self> {
        Ok(Self::new(
            &entity.collection,
            entity.to_schema()?,
            entity.to_options()?,
        ))
    }

    /// The schema as written: renamed and indexed per the options.
    pub fn effective_schema(&self) -> Result<EntitySchema> {
        self.options.apply(&self.schema)
    }
}

/// Validated catalog of the jobs' effective schemas, in job order.
pub fn build_catalog(jobs: &[EntityJob], external: &[String]) -> Result<SchemaCatalog> {
    let mut catalog = SchemaCatalog::new();
    for table in external {
        catalog.declare_external(table);
    }
    for job in jobs {
        catalog.register(job.effective_schema()?)?;
    }
    catalog.validate()?;
    Ok(catalog)
}

/// DDL that would create every table from scratch, without connecting.
pub fn plan(dialect: Dialect, jobs: &[EntityJob], external: &[String]) -> Result<Vec<String>> {
    let catalog = build_catalog(jobs, external)?;
    Ok(catalog
        .schemas()
        .iter()
        .flat_map(|schema| plan_statements(dialect, schema))
        .collect())
}

/// Dialect a sink configuration will speak.
pub fn config_dialect(config: &SinkConfig) -> Dialect {
    match config {
        SinkConfig::Postgres(_) => Dialect::Postgres,
        SinkConfig::DuckDb(_) => Dialect::DuckDb,
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Every entity completed and every migration and repair ran
    pub success: bool,
    /// Only materialization ran
    pub dry_run: bool,
    /// Materialization per table
    pub materialized: Vec<MaterializeReport>,
    /// Backup per entity
    pub entities: Vec<BackupReport>,
    /// Migrations, if they ran
    pub migrations: Option<MigrationReport>,
    /// Repair passes that ran
    pub repairs: Vec<RepairReport>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when the run completed
    pub completed_at: String,
    /// Counters collected during the run
    pub metrics: MetricsSnapshot,
    /// Why the run did not succeed
    pub error: Option<String>,
}

impl RunReport {
    /// Rows written over all entities.
    pub fn total_written(&self) -> u64 {
        self.entities.iter().map(|e| e.written).sum()
    }

    /// Rows skipped over all entities.
    pub fn total_skipped(&self) -> u64 {
        self.entities.iter().map(|e| e.skipped).sum()
    }

    /// Rows failed over all entities.
    pub fn total_failed(&self) -> u64 {
        self.entities.iter().map(|e| e.failed).sum()
    }
}

/// Runs backups from a source into a sink.
pub struct BackupEngine {
    source: Box<dyn Source>,
    sink: Box<dyn Sink>,
    jobs: Vec<EntityJob>,
    external: Vec<String>,
    migrations: Vec<Arc<dyn MigrationStep>>,
    repairs: Vec<Arc<dyn RepairPass>>,
    parallel: bool,
    continue_on_error: bool,
    skip_migrations: bool,
    skip_repairs: bool,
    dry_run: bool,
    metrics: Arc<Metrics>,
    progress: Option<ProgressCallback>,
}

impl BackupEngine {
    /// Create an engine over a source and a sink.
    pub fn new(source: impl Source + 'static, sink: impl Sink + 'static) -> Self {
        Self::from_parts(Box::new(source), Box::new(sink))
    }

    /// Create an engine over boxed collaborators.
    pub fn from_parts(source: Box<dyn Source>, sink: Box<dyn Sink>) -> Self {
        Self {
            source,
            sink,
            jobs: Vec::new(),
            external: Vec::new(),
            migrations: Vec::new(),
            repairs: Vec::new(),
            parallel: false,
            continue_on_error: false,
            skip_migrations: false,
            skip_repairs: false,
            dry_run: false,
            metrics: Arc::new(Metrics::new()),
            progress: None,
        }
    }

    /// Build an engine from configuration, opening the destination.
    #[instrument(skip(config), fields(sink = %config.sink.display_target()))]
    pub async fn from_config(config: &BackupConfig) -> Result<Self> {
        info!("Initializing backup engine...");

        let sink: Box<dyn Sink> = match &config.sink {
            SinkConfig::Postgres(pg) => Box::new(PostgresSink::connect(pg, &config.retry).await?),
            SinkConfig::DuckDb(duck) => Box::new(DuckDbSink::open(duck)?),
        };
        let source = Box::new(MongoSource::new(config.source.clone(), config.retry.clone()));

        let mut engine = Self::from_parts(source, sink).parallel(config.run.parallel);
        engine.continue_on_error = config.run.continue_on_error;
        engine.skip_migrations = config.run.skip_migrations;
        engine.skip_repairs = config.run.skip_repairs;
        engine.dry_run = config.run.dry_run;
        engine.external = config.external_tables.clone();

        for entity in &config.entities {
            engine.jobs.push(EntityJob::from_config(entity)?);
        }
        for migration in &config.migrations {
            engine = engine.migration(migration.clone());
        }
        for pass in &config.repairs {
            engine = engine.repair(pass.clone());
        }
        Ok(engine)
    }

    /// Add an entity.
    pub fn job(
        mut self,
        collection: impl Into<String>,
        schema: EntitySchema,
        options: BackupOptions,
    ) -> Self {
        self.jobs.push(EntityJob::new(collection, schema, options));
        self
    }

    /// Declare a table referenced by foreign keys but not backed up.
    pub fn external_table(mut self, table: impl Into<String>) -> Self {
        self.external.push(table.into());
        self
    }

    /// Add a migration, run after all backups.
    pub fn migration(mut self, step: impl MigrationStep + 'static) -> Self {
        self.migrations.push(Arc::new(step));
        self
    }

    /// Add a repair pass, run after migrations.
    pub fn repair(mut self, pass: impl RepairPass + 'static) -> Self {
        self.repairs.push(Arc::new(pass));
        self
    }

    /// Back up independent entities concurrently.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Keep going after an entity aborts; migrations are then skipped.
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Only materialize tables.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(BackupProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Destination in use.
    pub fn sink(&self) -> &dyn Sink {
        self.sink.as_ref()
    }

    /// Shared metrics.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// DDL for an empty destination of this engine's dialect.
    pub fn plan(&self) -> Result<Vec<String>> {
        plan(self.sink.dialect(), &self.jobs, &self.external)
    }

    /// Test connectivity to both stores.
    pub async fn test_connectivity(&mut self) -> Result<()> {
        info!("Testing connectivity...");

        self.source.connect().await?;
        info!("{}: OK", self.source.name());

        self.sink
            .ping()
            .await
            .map_err(|e| Error::sink_connection("ping failed", e))?;
        info!("{}: OK", self.sink.name());

        Ok(())
    }

    /// Migration history of the destination, or `None` before any
    /// migration run has created it.
    pub async fn migration_history(&self) -> Result<Option<Vec<AppliedMigration>>> {
        let runner = MigrationRunner::new(self.sink.as_ref());
        if !runner.history_exists().await? {
            return Ok(None);
        }
        runner.applied().await.map(Some)
    }

    /// Run everything.
    #[instrument(skip(self), fields(entities = self.jobs.len(), parallel = self.parallel))]
    pub async fn run(&mut self) -> Result<RunReport> {
        let timer = Timer::start("run");
        let catalog = build_catalog(&self.jobs, &self.external)?;

        self.source.connect().await?;
        self.sink
            .ping()
            .await
            .map_err(|e| Error::sink_connection("destination unavailable", e))?;

        let mut materialized = Vec::with_capacity(catalog.schemas().len());
        let materializer = Materializer::new(self.sink.as_ref());
        for (job, schema) in self.jobs.iter().zip(catalog.schemas()) {
            self.report_progress(&job.collection, BackupPhase::Materializing);
            materialized.push(materializer.reconcile(schema).await?);
        }

        let mut report = RunReport {
            success: true,
            dry_run: self.dry_run,
            materialized,
            entities: Vec::new(),
            migrations: None,
            repairs: Vec::new(),
            duration_ms: 0,
            completed_at: String::new(),
            metrics: self.metrics.snapshot(),
            error: None,
        };

        if self.dry_run {
            info!("Dry run: {} table(s) materialized", report.materialized.len());
            return Ok(self.finish(report, timer));
        }

        report.entities = self.backup_all(&catalog).await?;
        let failed: Vec<&str> = report
            .entities
            .iter()
            .filter(|e| !e.success())
            .map(|e| e.entity.as_str())
            .collect();
        if !failed.is_empty() {
            report.success = false;
            report.error = Some(format!("backup aborted for: {}", failed.join(", ")));
            warn!("Skipping migrations and repairs: {} entity backup(s) failed", failed.len());
            return Ok(self.finish(report, timer));
        }

        if !self.skip_migrations && !self.migrations.is_empty() {
            let runner =
                MigrationRunner::new(self.sink.as_ref()).with_metrics(Arc::clone(&self.metrics));
            report.migrations = Some(runner.run(&self.migrations).await?);
        }

        if !self.skip_repairs && !self.repairs.is_empty() {
            report.repairs = repair::run_all(
                &self.repairs,
                self.source.as_ref(),
                self.sink.as_ref(),
                Some(&self.metrics),
            )
            .await?;
        }

        Ok(self.finish(report, timer))
    }

    async fn backup_all(&self, catalog: &SchemaCatalog) -> Result<Vec<BackupReport>> {
        let mut results: Vec<Option<BackupReport>> = vec![None; self.jobs.len()];

        if self.parallel {
            let levels = catalog.dependency_levels();
            let deepest = levels.iter().copied().max().unwrap_or(0);
            for level in 0..=deepest {
                let batch: Vec<usize> = (0..self.jobs.len())
                    .filter(|&i| levels[i] == level)
                    .collect();
                info!("Backing up level {}: {} entities", level, batch.len());

                let outcomes =
                    join_all(batch.iter().map(|&i| self.backup_one(&self.jobs[i]))).await;
                for (i, outcome) in batch.into_iter().zip(outcomes) {
                    results[i] = Some(self.settle(&self.jobs[i], outcome)?);
                }
            }
        } else {
            for (i, job) in self.jobs.iter().enumerate() {
                let outcome = self.backup_one(job).await;
                results[i] = Some(self.settle(job, outcome)?);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    async fn backup_one(&self, job: &EntityJob) -> Result<BackupReport> {
        let mut runner = BackupRunner::new(self.source.as_ref(), self.sink.as_ref())
            .with_metrics(Arc::clone(&self.metrics));
        if let Some(progress) = &self.progress {
            runner = runner.with_progress(Arc::clone(progress));
        }
        runner.run(&job.collection, &job.schema, &job.options).await
    }

    /// Turn a fatal entity error into a failed report, or stop the run.
    fn settle(&self, job: &EntityJob, outcome: Result<BackupReport>) -> Result<BackupReport> {
        match outcome {
            Ok(report) => Ok(report),
            Err(e) if self.continue_on_error => {
                error!("Failed to back up {}: {}", job.collection, e);
                Ok(BackupReport {
                    entity: job.collection.clone(),
                    table: job
                        .options
                        .rename_to
                        .clone()
                        .unwrap_or_else(|| job.schema.table().to_string()),
                    error: Some(e.to_string()),
                    ..Default::default()
                })
            }
            Err(e) => Err(e),
        }
    }

    fn finish(&self, mut report: RunReport, timer: Timer) -> RunReport {
        report.duration_ms = timer.stop();
        report.completed_at = chrono::Utc::now().to_rfc3339();
        report.metrics = self.metrics.snapshot();

        if report.success {
            info!(
                "Backup completed in {}ms: {} written, {} skipped, {} failed across {} entities ({:.1} rows/s)",
                report.duration_ms,
                report.total_written(),
                report.total_skipped(),
                report.total_failed(),
                report.entities.len(),
                report.metrics.rows_per_second()
            );
        } else {
            warn!(
                "Backup completed with errors in {}ms: {}",
                report.duration_ms,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        report
    }

    fn report_progress(&self, entity: &str, phase: BackupPhase) {
        if let Some(callback) = &self.progress {
            callback(BackupProgress {
                entity: entity.to_string(),
                phase,
                documents: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldMapping;
    use crate::source::MemorySource;
    use crate::value::document;

    fn users() -> EntitySchema {
        EntitySchema::builder("users")
            .field(FieldMapping::text("userID").unique())
            .build()
            .unwrap()
    }

    fn cv() -> EntitySchema {
        EntitySchema::builder("cv")
            .field(FieldMapping::text("userID").unique().references("users", "userID"))
            .field(FieldMapping::integer("views").default_value("0"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_plan_orders_tables() {
        let jobs = vec![
            EntityJob::new("users", users(), BackupOptions::new()),
            EntityJob::new("cv", cv(), BackupOptions::new().index("views")),
        ];
        let ddl = plan(Dialect::Postgres, &jobs, &[]).unwrap();
        assert_eq!(ddl.len(), 3);
        assert!(ddl[0].starts_with("CREATE TABLE IF NOT EXISTS \"users\""));
        assert!(ddl[1].contains("REFERENCES \"users\""));
        assert!(ddl[2].contains("\"cv_views_idx\""));
    }

    #[test]
    fn test_plan_rejects_forward_reference() {
        let jobs = vec![
            EntityJob::new("cv", cv(), BackupOptions::new()),
            EntityJob::new("users", users(), BackupOptions::new()),
        ];
        let err = plan(Dialect::Postgres, &jobs, &[]).unwrap_err();
        assert!(err.to_string().contains("registered later"));

        let external = vec!["users".to_string()];
        assert!(plan(Dialect::Postgres, &jobs[..1], &external).is_ok());
    }

    #[tokio::test]
    async fn test_run_small_catalog() {
        let source = MemorySource::new()
            .with_collection("users", vec![document([("userID", "1")]), document([("userID", "2")])])
            .with_collection("cv", vec![document([("userID", "1")])]);

        let mut engine = BackupEngine::new(source, DuckDbSink::in_memory().unwrap())
            .job("users", users(), BackupOptions::new())
            .job("cv", cv(), BackupOptions::new());

        let report = engine.run().await.unwrap();
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.materialized.len(), 2);
        assert_eq!(report.total_written(), 3);
        assert_eq!(report.metrics.rows_written, 3);
        assert_eq!(report.metrics.backups_total, 2);
        assert!((report.metrics.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_dry_run_only_materializes() {
        let source = MemorySource::new().with_collection("users", vec![document([("userID", "1")])]);
        let mut engine = BackupEngine::new(source, DuckDbSink::in_memory().unwrap())
            .job("users", users(), BackupOptions::new())
            .dry_run(true);

        let report = engine.run().await.unwrap();
        assert!(report.dry_run);
        assert!(report.entities.is_empty());

        let count = engine
            .sink()
            .query_column("SELECT CAST(COUNT(*) AS VARCHAR) FROM users", &[])
            .await
            .unwrap();
        assert_eq!(count, vec!["0"]);
    }

    #[tokio::test]
    async fn test_history_is_absent_until_migrations_run() {
        let source = MemorySource::new().with_collection("users", vec![document([("userID", "1")])]);
        let mut engine = BackupEngine::new(source, DuckDbSink::in_memory().unwrap())
            .job("users", users(), BackupOptions::new());

        assert!(engine.migration_history().await.unwrap().is_none());
        assert!(engine.migration_history().await.unwrap().is_none());

        engine.run().await.unwrap();
        assert!(engine.migration_history().await.unwrap().is_none());

        engine = engine.migration(crate::migrate::SqlMigration::new("001_noop", "SELECT 1"));
        engine.run().await.unwrap();
        let history = engine.migration_history().await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].name, "001_noop");
    }
}
