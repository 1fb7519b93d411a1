//! Shared types used by the pgvector store and its callers.

use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::embedding::EmbeddingClientError;
use crate::knowledge::{Document, KnowledgeFilters};

/// Errors returned while interacting with the vector store.
#[derive(Debug, Error)]
pub enum VectorDbError {
    /// Schema or table name is not a plain SQL identifier.
    #[error("Invalid identifier '{0}': only ASCII letters, digits and underscores are allowed")]
    InvalidIdentifier(String),
    /// Postgres rejected a statement or the connection failed.
    #[error("Database request failed: {0}")]
    Database(#[from] sqlx::Error),
    /// Embedding provider failed while vectorizing documents or queries.
    #[error("Failed to embed content: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Produced vector does not fit the table's vector column.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension of the table's vector column.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },
}

/// Ranking strategy applied by [`VectorDb::search`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Cosine distance between the query embedding and stored embeddings.
    Vector,
    /// Postgres full-text rank of the content against the query.
    Keyword,
    /// Weighted blend of vector similarity and full-text rank.
    #[default]
    Hybrid,
}

impl FromStr for SearchType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vector" => Ok(Self::Vector),
            "keyword" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(()),
        }
    }
}

/// Storage backend for knowledge documents.
///
/// [`crate::pgvector::PgVector`] is the production implementation; the knowledge base only talks
/// to this trait so it can be exercised against in-memory stores.
#[async_trait]
pub trait VectorDb: Send + Sync {
    /// Create the extension, schema, table and indexes when missing.
    async fn create(&self) -> Result<(), VectorDbError>;

    /// Report whether the backing table exists.
    async fn exists(&self) -> Result<bool, VectorDbError>;

    /// Drop the backing table.
    async fn drop_table(&self) -> Result<(), VectorDbError>;

    /// Remove every stored document while keeping the table.
    async fn delete(&self) -> Result<(), VectorDbError>;

    /// Report whether a document with this content hash is stored.
    async fn content_hash_exists(&self, content_hash: &str) -> Result<bool, VectorDbError>;

    /// Number of stored documents.
    async fn count(&self) -> Result<u64, VectorDbError>;

    /// Insert documents, leaving existing ids untouched. Returns the number of new rows.
    async fn insert(
        &self,
        documents: Vec<Document>,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<usize, VectorDbError>;

    /// Insert documents, replacing rows that share an id. Returns the number of written rows.
    async fn upsert(
        &self,
        documents: Vec<Document>,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<usize, VectorDbError>;

    /// Return up to `limit` documents ranked against `query`, restricted by `filters`.
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<Vec<Document>, VectorDbError>;

    /// Distinct filter keys present in stored rows.
    async fn filter_keys(&self) -> Result<BTreeSet<String>, VectorDbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_type_parses_known_values() {
        assert_eq!("Hybrid".parse(), Ok(SearchType::Hybrid));
        assert_eq!("vector".parse(), Ok(SearchType::Vector));
        assert_eq!(" keyword ".parse(), Ok(SearchType::Keyword));
        assert_eq!("bm25".parse::<SearchType>(), Err(()));
        assert_eq!(SearchType::default(), SearchType::Hybrid);
    }
}
