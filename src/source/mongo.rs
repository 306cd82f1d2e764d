//! MongoDB source.

use super::{DocumentStream, Source};
use crate::config::{MongoConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::value::{Document, SourceValue};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use mongodb::bson::{self, Bson, doc};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::Client;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Reads collections from a MongoDB database.
pub struct MongoSource {
    config: MongoConfig,
    retry: RetryConfig,
    client: Option<Client>,
}

impl MongoSource {
    /// Create an unconnected source.
    pub fn new(config: MongoConfig, retry: RetryConfig) -> Self {
        Self {
            config,
            retry,
            client: None,
        }
    }

    async fn ping(client: &Client, database: &str) -> mongodb::error::Result<()> {
        client
            .database(database)
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Source for MongoSource {
    #[instrument(skip(self), fields(database = %self.config.database))]
    async fn connect(&mut self) -> Result<()> {
        info!("Connecting to MongoDB...");

        let mut options = ClientOptions::parse(&self.config.url)
            .await
            .map_err(|e| Error::source_connection("Invalid MongoDB URL", e))?;
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        if options.app_name.is_none() {
            options.app_name = Some(self.config.app_name.clone());
        }

        let client = Client::with_options(options)
            .map_err(|e| Error::source_connection("Failed to create MongoDB client", e))?;

        let max_retries = self.retry.max_retries;
        let database = self.config.database.as_str();
        let mut attempt = 0u32;
        backoff::future::retry(self.retry.backoff(), || {
            attempt += 1;
            let current = attempt;
            let client = &client;
            async move {
                Self::ping(client, database).await.map_err(|e| {
                    if current > max_retries {
                        backoff::Error::permanent(e)
                    } else {
                        warn!(attempt = current, "MongoDB ping failed: {}", e);
                        backoff::Error::transient(e)
                    }
                })
            }
        })
        .await
        .map_err(|e| Error::source_connection("Failed to reach MongoDB", e))?;

        info!("Connected to MongoDB database: {}", self.config.database);
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&self, collection: &str) -> Result<DocumentStream> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::not_connected("MongoDB source is not connected"))?;

        if self.config.ignore_collections.iter().any(|c| c == collection) {
            warn!("Collection '{}' is ignored; reading nothing", collection);
            return Ok(futures::stream::empty().boxed());
        }

        debug!("Opening cursor on {}", collection);
        let cursor = client
            .database(&self.config.database)
            .collection::<bson::Document>(collection)
            .find(doc! {})
            .await
            .map_err(|e| Error::source_query(collection, "Failed to open cursor", e))?;

        let name = collection.to_string();
        let stream = cursor.map(move |item| match item {
            Ok(raw) => Ok(from_bson_document(raw)),
            Err(e) if matches!(*e.kind, ErrorKind::BsonDeserialization(_)) => {
                Err(Error::row(format!("undecodable document in {}: {}", name, e)))
            }
            Err(e) => Err(Error::source_query(&name, "Cursor failed", e)),
        });

        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "mongodb"
    }
}

/// Convert a BSON document into a source document.
pub fn from_bson_document(raw: bson::Document) -> Document {
    raw.into_iter()
        .map(|(k, v)| (k, SourceValue::from(v)))
        .collect()
}

impl From<Bson> for SourceValue {
    fn from(value: Bson) -> Self {
        match value {
            Bson::Null | Bson::Undefined => SourceValue::Null,
            Bson::Boolean(b) => SourceValue::Bool(b),
            Bson::Int32(i) => SourceValue::Int(i as i64),
            Bson::Int64(i) => SourceValue::Int(i),
            Bson::Double(f) => SourceValue::Float(f),
            Bson::String(s) | Bson::Symbol(s) => SourceValue::String(s),
            Bson::ObjectId(oid) => SourceValue::ObjectId(oid.to_hex()),
            Bson::DateTime(dt) => Utc
                .timestamp_millis_opt(dt.timestamp_millis())
                .single()
                .map(SourceValue::Timestamp)
                .unwrap_or(SourceValue::Null),
            Bson::Timestamp(ts) => Utc
                .timestamp_opt(ts.time as i64, 0)
                .single()
                .map(SourceValue::Timestamp)
                .unwrap_or(SourceValue::Null),
            Bson::Decimal128(d) => SourceValue::String(d.to_string()),
            Bson::Array(items) => SourceValue::Array(items.into_iter().map(Into::into).collect()),
            Bson::Document(doc) => SourceValue::Document(from_bson_document(doc)),
            other => SourceValue::String(other.to_string()),
        }
    }
}
