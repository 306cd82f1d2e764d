//! In-memory source, used by tests and benchmarks.

use super::{DocumentStream, Source};
use crate::error::{Error, Result};
use crate::value::Document;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;

/// Collections held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    collections: HashMap<String, Vec<Document>>,
    failures: HashMap<String, usize>,
    connected: bool,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a collection.
    pub fn with_collection(
        mut self,
        name: impl Into<String>,
        documents: impl IntoIterator<Item = Document>,
    ) -> Self {
        self.collections
            .insert(name.into(), documents.into_iter().collect());
        self
    }

    /// Make reads of `name` fail fatally after `after` documents.
    pub fn failing_after(mut self, name: impl Into<String>, after: usize) -> Self {
        self.failures.insert(name.into(), after);
        self
    }

    /// Append a document to a collection.
    pub fn insert(&mut self, collection: &str, document: Document) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn fetch(&self, collection: &str) -> Result<DocumentStream> {
        if !self.connected {
            return Err(Error::not_connected("memory source is not connected"));
        }

        let documents = self.collections.get(collection).cloned().unwrap_or_default();
        let items: Vec<Result<Document>> = match self.failures.get(collection) {
            Some(&after) => documents
                .into_iter()
                .take(after)
                .map(Ok)
                .chain(std::iter::once(Err(Error::SourceQuery {
                    collection: collection.to_string(),
                    message: "simulated read failure".to_string(),
                    source: None,
                })))
                .collect(),
            None => documents.into_iter().map(Ok).collect(),
        };

        Ok(futures::stream::iter(items).boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::document;
    use futures::TryStreamExt;

    #[test]
    fn test_fetch_requires_connect() {
        let source = MemorySource::new().with_collection("users", vec![]);
        let err = tokio_test::block_on(source.fetch("users")).err().unwrap();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_fetch_streams_documents() {
        let mut source = MemorySource::new().with_collection(
            "users",
            vec![document([("userID", "a")]), document([("userID", "b")])],
        );
        source.connect().await.unwrap();

        let docs: Vec<Document> = source.fetch("users").await.unwrap().try_collect().await.unwrap();
        assert_eq!(docs.len(), 2);

        let empty: Vec<Document> = source.fetch("missing").await.unwrap().try_collect().await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_failing_after() {
        let mut source = MemorySource::new()
            .with_collection("users", (0..5).map(|i| document([("n", i as i64)])))
            .failing_after("users", 2);
        source.connect().await.unwrap();

        let items: Vec<Result<Document>> = source.fetch("users").await.unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[2].as_ref().unwrap_err().is_fatal());
    }
}
