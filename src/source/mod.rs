//! Document sources.

pub mod memory;
pub mod mongo;

pub use memory::MemorySource;
pub use mongo::MongoSource;

use crate::error::Result;
use crate::value::Document;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Lazily produced documents of one collection.
///
/// An `Err` item carrying a row error skips that document; any other error
/// ends the read.
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// A document store.
#[async_trait]
pub trait Source: Send + Sync {
    /// Establish the connection. Fetching before this fails.
    async fn connect(&mut self) -> Result<()>;

    /// Stream every document of a collection.
    async fn fetch(&self, collection: &str) -> Result<DocumentStream>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
