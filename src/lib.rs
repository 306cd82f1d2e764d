//! # docshift
//!
//! Schema-driven backups of MongoDB collections into PostgreSQL or DuckDB.
//!
//! ## Features
//!
//! - **Declarative mappings**: one [`FieldMapping`] per destination column,
//!   built in code or parsed from `src:"a" dest:"b"` annotations
//! - **Forward-only materialization**: tables are created or extended, never dropped
//! - **Idempotent backups**: rows whose identity already exists are skipped
//! - **Per-column transforms**: computed values that always win over the source
//! - **Row-level fault tolerance**: one malformed document never aborts a collection
//! - **Migrations and repair passes**: run once after all backups
//! - **Progress tracking**: real-time progress updates via callbacks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docshift::{BackupEngine, BackupOptions, EntitySchema, FieldMapping, SourceValue};
//! use docshift::sink::DuckDbSink;
//! use docshift::source::MemorySource;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let users = EntitySchema::builder("users")
//!         .field(FieldMapping::text("userID").identity())
//!         .field(FieldMapping::text("token"))
//!         .field(FieldMapping::boolean("premium").default_value("false"))
//!         .build()?;
//!
//!     let options = BackupOptions::new()
//!         .transform("token", |_| SourceValue::String(docshift::transform::random_token(64)));
//!
//!     let mut engine = BackupEngine::new(MemorySource::new(), DuckDbSink::in_memory()?)
//!         .job("users", users, options);
//!
//!     let report = engine.run().await?;
//!     println!("Wrote {} rows", report.total_written());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod materialize;
pub mod metrics;
pub mod migrate;
pub mod repair;
pub mod schema;
pub mod sink;
pub mod source;
pub mod tags;
pub mod transform;
pub mod value;

// Re-exports for convenience
pub use backup::{BackupOptions, BackupPhase, BackupProgress, BackupReport, BackupRunner};
pub use config::{BackupConfig, BackupConfigBuilder, EntityConfig, SinkConfig};
pub use engine::{BackupEngine, EntityJob, RunReport};
pub use error::{Error, Result};
pub use materialize::{MaterializeReport, Materializer};
pub use migrate::{MigrationReport, MigrationRunner, MigrationStep, SqlMigration};
pub use repair::{NestedFirstElementRepair, RepairPass, RepairReport};
pub use schema::{DefaultExpr, EntitySchema, FieldMapping, FieldType, ForeignKey, SchemaCatalog};
pub use sink::{Dialect, Sink, SinkError};
pub use source::{DocumentStream, Source};
pub use transform::{Transform, TransformRegistry};
pub use value::{Document, SourceValue, SqlValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
