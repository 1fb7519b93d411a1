//! PostgreSQL + pgvector implementation of [`VectorDb`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::embedding::EmbeddingClient;
use crate::knowledge::{Document, KnowledgeFilters, clean_content};

use super::sql::{
    TABLE_EXISTS_SQL, TableRef, content_hash_exists_sql, count_sql, create_statements,
    delete_sql, drop_sql, filter_keys_sql, filter_operand, insert_sql, merge_meta_data,
    search_sql,
};
use super::types::{SearchType, VectorDb, VectorDbError};

/// Table layout and ranking settings for a [`PgVector`] store.
#[derive(Debug, Clone)]
pub struct PgVectorConfig {
    /// Schema that owns the table.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Ranking strategy for searches.
    pub search_type: SearchType,
    /// Weight of vector similarity in hybrid ranking.
    pub vector_score_weight: f32,
}

impl PgVectorConfig {
    /// Hybrid search over `schema.table` with an even vector/keyword split.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            search_type: SearchType::Hybrid,
            vector_score_weight: 0.5,
        }
    }
}

/// Knowledge store backed by a single pgvector table.
///
/// Each row holds a document's content, metadata (JSONB), the filters it was loaded with
/// (JSONB), a content hash and its embedding. Call [`VectorDb::create`] before first use.
pub struct PgVector {
    pool: PgPool,
    table: TableRef,
    search_type: SearchType,
    vector_score_weight: f32,
    embedder: Arc<dyn EmbeddingClient>,
}

impl PgVector {
    /// Wrap an existing pool.
    pub fn new(
        pool: PgPool,
        config: PgVectorConfig,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Result<Self, VectorDbError> {
        let table = TableRef::new(&config.schema, &config.table)?;
        Ok(Self {
            pool,
            table,
            search_type: config.search_type,
            vector_score_weight: config.vector_score_weight.clamp(0.0, 1.0),
            embedder,
        })
    }

    /// Open a small connection pool to `database_url` and wrap it.
    pub async fn connect(
        database_url: &str,
        config: PgVectorConfig,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Result<Self, VectorDbError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        tracing::debug!(
            schema = %config.schema,
            table = %config.table,
            search_type = ?config.search_type,
            "Connected to pgvector store"
        );
        Self::new(pool, config, embedder)
    }

    /// Ranking strategy applied to searches.
    pub fn search_type(&self) -> SearchType {
        self.search_type
    }

    /// Validated table reference.
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    async fn embed_missing(&self, documents: &mut [Document]) -> Result<(), VectorDbError> {
        let missing: Vec<usize> = documents
            .iter()
            .enumerate()
            .filter(|(_, document)| document.embedding.is_none())
            .map(|(index, _)| index)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let texts = missing
            .iter()
            .map(|&index| clean_content(&documents[index].content))
            .collect();
        let vectors = self.embedder.generate_embeddings(texts).await?;
        for (index, vector) in missing.into_iter().zip(vectors) {
            documents[index].embedding = Some(vector);
        }
        Ok(())
    }

    async fn embed_query(&self, query: &str) -> Result<Vector, VectorDbError> {
        let vector = self
            .embedder
            .generate_embeddings(vec![query.to_string()])
            .await?
            .pop()
            .unwrap_or_default();
        self.check_dimension(&vector)?;
        Ok(Vector::from(vector))
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), VectorDbError> {
        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(VectorDbError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    async fn write(
        &self,
        mut documents: Vec<Document>,
        filters: Option<&KnowledgeFilters>,
        upsert: bool,
    ) -> Result<usize, VectorDbError> {
        if documents.is_empty() {
            return Ok(0);
        }

        self.embed_missing(&mut documents).await?;

        let sql = insert_sql(&self.table, upsert);
        let filters_json = Value::Object(filters.cloned().unwrap_or_default());
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;

        for document in documents {
            let embedding = document.embedding.clone().unwrap_or_default();
            self.check_dimension(&embedding)?;
            let meta_data = Value::Object(merge_meta_data(&document.meta_data, filters));
            let result = sqlx::query(&sql)
                .bind(document.storage_id())
                .bind(document.name.as_deref())
                .bind(&meta_data)
                .bind(&filters_json)
                .bind(clean_content(&document.content))
                .bind(Vector::from(embedding))
                .bind(document.usage.as_ref())
                .bind(document.content_hash())
                .execute(&mut *tx)
                .await?;
            written += result.rows_affected() as usize;
        }

        tx.commit().await?;
        tracing::debug!(
            table = %self.table.qualified(),
            written,
            upsert,
            "Wrote documents"
        );
        Ok(written)
    }
}

#[async_trait]
impl VectorDb for PgVector {
    async fn create(&self) -> Result<(), VectorDbError> {
        for statement in create_statements(&self.table, self.embedder.dimension()) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        tracing::info!(table = %self.table.qualified(), "Knowledge table ready");
        Ok(())
    }

    async fn exists(&self) -> Result<bool, VectorDbError> {
        let exists: bool = sqlx::query_scalar(TABLE_EXISTS_SQL)
            .bind(self.table.schema())
            .bind(self.table.table())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn drop_table(&self) -> Result<(), VectorDbError> {
        sqlx::query(&drop_sql(&self.table))
            .execute(&self.pool)
            .await?;
        tracing::info!(table = %self.table.qualified(), "Dropped knowledge table");
        Ok(())
    }

    async fn delete(&self) -> Result<(), VectorDbError> {
        let result = sqlx::query(&delete_sql(&self.table))
            .execute(&self.pool)
            .await?;
        tracing::info!(
            table = %self.table.qualified(),
            removed = result.rows_affected(),
            "Cleared knowledge table"
        );
        Ok(())
    }

    async fn content_hash_exists(&self, content_hash: &str) -> Result<bool, VectorDbError> {
        let exists: bool = sqlx::query_scalar(&content_hash_exists_sql(&self.table))
            .bind(content_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn count(&self) -> Result<u64, VectorDbError> {
        let count: i64 = sqlx::query_scalar(&count_sql(&self.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert(
        &self,
        documents: Vec<Document>,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<usize, VectorDbError> {
        self.write(documents, filters, false).await
    }

    async fn upsert(
        &self,
        documents: Vec<Document>,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<usize, VectorDbError> {
        self.write(documents, filters, true).await
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<Vec<Document>, VectorDbError> {
        let filter = filter_operand(filters);
        let sql = search_sql(&self.table, self.search_type, filter.is_some());
        let limit = limit.max(1) as i64;

        let mut statement = sqlx::query(&sql);
        statement = match self.search_type {
            SearchType::Keyword => statement.bind(query),
            SearchType::Vector => statement.bind(self.embed_query(query).await?),
            SearchType::Hybrid => statement
                .bind(self.embed_query(query).await?)
                .bind(query)
                .bind(f64::from(self.vector_score_weight)),
        };
        if let Some(filter) = filter {
            statement = statement.bind(filter);
        }

        let rows = statement.bind(limit).fetch_all(&self.pool).await?;
        let documents = rows
            .iter()
            .map(row_to_document)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            table = %self.table.qualified(),
            search_type = ?self.search_type,
            results = documents.len(),
            "Knowledge search completed"
        );
        Ok(documents)
    }

    async fn filter_keys(&self) -> Result<BTreeSet<String>, VectorDbError> {
        let keys: Vec<String> = sqlx::query_scalar(&filter_keys_sql(&self.table))
            .fetch_all(&self.pool)
            .await?;
        Ok(keys.into_iter().collect())
    }
}

fn row_to_document(row: &PgRow) -> Result<Document, VectorDbError> {
    let meta_data = match row.try_get::<Value, _>("meta_data")? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Document {
        id: Some(row.try_get("id")?),
        name: row.try_get("name")?,
        content: row.try_get("content")?,
        meta_data,
        embedding: None,
        usage: row.try_get("usage")?,
        score: Some(row.try_get("score")?),
    })
}
