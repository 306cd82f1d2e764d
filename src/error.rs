//! Error types for docshift.

use crate::sink::SinkError;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for docshift operations.
///
/// Everything except [`Error::Row`] is fatal for the unit of work that raised
/// it: a row error skips one document, every other variant stops the entity
/// (or the whole run, for connectivity and migration failures).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Entity schema violates a build-time contract
    #[error("Schema error in '{entity}': {message}")]
    Schema {
        /// Entity (destination table) the schema belongs to
        entity: String,
        /// Error message
        message: String,
    },

    /// Document store connection error
    #[error("Source connection error: {message}")]
    SourceConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Document store query error
    #[error("Source query error on collection '{collection}': {message}")]
    SourceQuery {
        /// Collection name
        collection: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Destination connection error
    #[error("Sink connection error: {message}")]
    SinkConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<SinkError>,
    },

    /// Destination statement error
    #[error("Sink error on table '{table}': {message}")]
    Sink {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: SinkError,
    },

    /// A single document could not be turned into a destination row
    #[error("Row error: {message}")]
    Row {
        /// Error message
        message: String,
    },

    /// Destination table could not be reconciled with its schema
    #[error("Materialization of '{table}' failed: {message}")]
    Materialize {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<SinkError>,
    },

    /// A migration failed; earlier migrations stay applied
    #[error("Migration '{name}' failed: {message}")]
    Migration {
        /// Migration name
        name: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<SinkError>,
    },

    /// A repair pass failed
    #[error("Repair '{name}' failed: {message}")]
    Repair {
        /// Repair pass name
        name: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<Error>>,
    },

    /// Fatal error while backing up one entity
    #[error("Backup of '{entity}' aborted: {source}")]
    Backup {
        /// Collection being backed up
        entity: String,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a schema error.
    pub fn schema(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a source connection error.
    pub fn source_connection(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SourceConnection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a source connection error without an underlying cause.
    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::SourceConnection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a source query error.
    pub fn source_query(
        collection: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SourceQuery {
            collection: collection.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a sink connection error.
    pub fn sink_connection(message: impl Into<String>, source: SinkError) -> Self {
        Self::SinkConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a sink statement error.
    pub fn sink(table: impl Into<String>, message: impl Into<String>, source: SinkError) -> Self {
        Self::Sink {
            table: table.into(),
            message: message.into(),
            source,
        }
    }

    /// Create a row-level error.
    pub fn row(message: impl Into<String>) -> Self {
        Self::Row {
            message: message.into(),
        }
    }

    /// Create a materialization error.
    pub fn materialize(
        table: impl Into<String>,
        message: impl Into<String>,
        source: Option<SinkError>,
    ) -> Self {
        Self::Materialize {
            table: table.into(),
            message: message.into(),
            source,
        }
    }

    /// Create a migration error.
    pub fn migration(name: impl Into<String>, message: impl Into<String>, source: SinkError) -> Self {
        Self::Migration {
            name: name.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a repair error.
    pub fn repair(name: impl Into<String>, message: impl Into<String>, source: Error) -> Self {
        Self::Repair {
            name: name.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap a fatal error with the entity it aborted.
    pub fn backup(entity: impl Into<String>, source: Error) -> Self {
        Self::Backup {
            entity: entity.into(),
            source: Box::new(source),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Row-level errors skip one document; everything else stops the unit of work.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Row { .. })
    }

    /// Whether the error came from losing a connection.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::SourceConnection { .. } | Error::SinkConnection { .. } => true,
            Error::Sink { source, .. } => source.is_connection(),
            Error::Migration {
                source: Some(source),
                ..
            } => source.is_connection(),
            Error::Backup { source, .. } => source.is_connectivity(),
            _ => false,
        }
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Schema { .. } => "SCHEMA_ERROR",
            Error::SourceConnection { .. } => "SOURCE_CONNECTION_ERROR",
            Error::SourceQuery { .. } => "SOURCE_QUERY_ERROR",
            Error::SinkConnection { .. } => "SINK_CONNECTION_ERROR",
            Error::Sink { .. } => "SINK_ERROR",
            Error::Row { .. } => "ROW_ERROR",
            Error::Materialize { .. } => "MATERIALIZE_ERROR",
            Error::Migration { .. } => "MIGRATION_ERROR",
            Error::Repair { .. } => "REPAIR_ERROR",
            Error::Backup { .. } => "BACKUP_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

/// Error context extension trait.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::config_with_source(message, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::config_with_source(f(), e))
    }
}
