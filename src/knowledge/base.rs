//! Knowledge base over a directory of JSON files and a vector store.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::embedding::{EmbeddingClient, get_embedding_client};
use crate::metrics::{KnowledgeMetrics, MetricsSnapshot};
use crate::pgvector::{PgVector, PgVectorConfig, VectorDb, VectorDbError};
use crate::posts::PostsError;

use super::chunking::{ChunkingError, SemanticChunking};
use super::document::{Document, KnowledgeFilters};
use super::filters::{track_metadata_structure, validate_filters};
use super::reader::read_json_documents;

/// Number of documents a search returns when the caller does not ask for a specific count.
pub const DEFAULT_NUM_DOCUMENTS: usize = 5;

/// Errors surfaced while loading or searching knowledge.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// Required settings are missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The vector store rejected an operation.
    #[error(transparent)]
    VectorDb(#[from] VectorDbError),
    /// A document could not be chunked.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    /// Post files could not be read.
    #[error(transparent)]
    Posts(#[from] PostsError),
    /// A knowledge file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// A knowledge file does not hold valid JSON.
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        /// File being parsed.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
}

/// How documents are written during a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Replace rows that share an id instead of inserting.
    pub upsert: bool,
    /// Skip chunks whose content hash is already stored. Ignored when upserting.
    pub skip_existing: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            upsert: false,
            skip_existing: true,
        }
    }
}

/// Outcome of a load call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Source documents handed to the load.
    pub documents: usize,
    /// Chunks produced from those documents.
    pub chunks: usize,
    /// Rows written to the store.
    pub written: usize,
    /// Chunks left out because identical content was already stored.
    pub skipped: usize,
}

impl LoadSummary {
    fn absorb(&mut self, other: LoadSummary) {
        self.documents += other.documents;
        self.chunks += other.chunks;
        self.written += other.written;
        self.skipped += other.skipped;
    }
}

/// Search surface the agent needs from a knowledge base.
#[async_trait]
pub trait KnowledgeApi: Send + Sync {
    /// Return documents relevant to `query`, honouring the valid subset of `filters`.
    async fn search(
        &self,
        query: &str,
        num_documents: Option<usize>,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<Vec<Document>, KnowledgeError>;

    /// Split `filters` into known entries and unknown keys.
    fn validate_filters(&self, filters: &KnowledgeFilters) -> (KnowledgeFilters, Vec<String>);
}

/// Knowledge base reading JSON files from `path` and storing chunks in a [`VectorDb`].
pub struct JsonKnowledgeBase {
    path: PathBuf,
    vector_db: Box<dyn VectorDb>,
    chunking: Option<SemanticChunking>,
    num_documents: usize,
    valid_metadata_filters: RwLock<Option<BTreeSet<String>>>,
    metrics: KnowledgeMetrics,
}

impl JsonKnowledgeBase {
    /// Knowledge base without chunking that returns [`DEFAULT_NUM_DOCUMENTS`] per search.
    pub fn new(path: impl Into<PathBuf>, vector_db: Box<dyn VectorDb>) -> Self {
        Self {
            path: path.into(),
            vector_db,
            chunking: None,
            num_documents: DEFAULT_NUM_DOCUMENTS,
            valid_metadata_filters: RwLock::new(None),
            metrics: KnowledgeMetrics::new(),
        }
    }

    /// Knowledge base over the configured pgvector table, with semantic chunking.
    ///
    /// Requires `DATABASE_URL`, plus `OPENAI_API_KEY` for the OpenAI embedder.
    pub async fn from_config(config: &Config) -> Result<Self, KnowledgeError> {
        let database_url = config.require_database_url()?;
        let embedder: Arc<dyn EmbeddingClient> = Arc::from(get_embedding_client(config)?);
        let store = PgVector::connect(
            database_url,
            PgVectorConfig {
                schema: config.pgvector_schema.clone(),
                table: config.pgvector_table.clone(),
                search_type: config.search_type,
                vector_score_weight: config.vector_score_weight,
            },
            Arc::clone(&embedder),
        )
        .await?;
        let chunking = SemanticChunking::new(
            embedder,
            config.semantic_chunk_size,
            config.semantic_similarity_threshold,
        )?;
        Ok(Self::new(&config.knowledge_dir, Box::new(store))
            .with_chunking(chunking)
            .with_num_documents(config.search_limit))
    }

    /// Split documents with `chunking` before they are stored.
    pub fn with_chunking(mut self, chunking: SemanticChunking) -> Self {
        self.chunking = Some(chunking);
        self
    }

    /// Default number of search results.
    pub fn with_num_documents(mut self, num_documents: usize) -> Self {
        self.num_documents = num_documents.max(1);
        self
    }

    /// Directory read by [`JsonKnowledgeBase::load`].
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backing vector store.
    pub fn vector_db(&self) -> &dyn VectorDb {
        self.vector_db.as_ref()
    }

    /// Known filter keys, if any have been registered.
    pub fn valid_metadata_filters(&self) -> Option<BTreeSet<String>> {
        self.valid_metadata_filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register `key` as a valid search filter.
    pub fn add_valid_filter(&self, key: &str) {
        self.valid_metadata_filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(BTreeSet::new)
            .insert(key.to_string());
    }

    /// Record the keys of `filters` as valid search filters.
    pub fn track_metadata_structure(&self, filters: &KnowledgeFilters) {
        let mut guard = self
            .valid_metadata_filters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        track_metadata_structure(&mut guard, filters);
    }

    /// Pick up filter keys stored by earlier runs.
    pub async fn refresh_valid_filters(&self) -> Result<(), KnowledgeError> {
        if !self.vector_db.exists().await? {
            return Ok(());
        }
        let keys = self.vector_db.filter_keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut guard = self
            .valid_metadata_filters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.get_or_insert_with(BTreeSet::new).extend(keys);
        tracing::debug!(keys = ?guard, "Refreshed valid filter keys");
        Ok(())
    }

    /// Loading counters accumulated since construction.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn prepare_table(&self, recreate: bool) -> Result<(), KnowledgeError> {
        if recreate {
            tracing::info!("Dropping knowledge table");
            self.vector_db.drop_table().await?;
        }
        if !self.vector_db.exists().await? {
            self.vector_db.create().await?;
        }
        Ok(())
    }

    async fn chunk(&self, document: &Document) -> Result<Vec<Document>, KnowledgeError> {
        match &self.chunking {
            Some(chunking) => Ok(chunking.chunk(document).await?),
            None => Ok(vec![document.clone()]),
        }
    }

    /// Chunk `documents` and write them, tagging every row with `filters`.
    ///
    /// Creates the table when missing. Without `upsert`, chunks whose content is already stored
    /// (or repeated within this call) are skipped when `skip_existing` is set.
    pub async fn load_documents(
        &self,
        documents: Vec<Document>,
        filters: Option<&KnowledgeFilters>,
        options: LoadOptions,
    ) -> Result<LoadSummary, KnowledgeError> {
        let mut summary = LoadSummary {
            documents: documents.len(),
            ..LoadSummary::default()
        };
        if documents.is_empty() {
            return Ok(summary);
        }

        self.prepare_table(false).await?;

        let mut chunks = Vec::new();
        for document in &documents {
            chunks.extend(self.chunk(document).await?);
        }
        summary.chunks = chunks.len();

        if options.upsert {
            summary.written = self.vector_db.upsert(chunks, filters).await?;
        } else {
            let mut pending = Vec::with_capacity(chunks.len());
            let mut seen = HashSet::new();
            for chunk in chunks {
                let hash = chunk.content_hash();
                let duplicate = !seen.insert(hash.clone());
                if options.skip_existing
                    && (duplicate || self.vector_db.content_hash_exists(&hash).await?)
                {
                    summary.skipped += 1;
                    continue;
                }
                pending.push(chunk);
            }
            summary.written = self.vector_db.insert(pending, filters).await?;
        }

        if let Some(filters) = filters {
            self.track_metadata_structure(filters);
        }
        self.metrics.record_load(
            summary.documents as u64,
            summary.written as u64,
            summary.skipped as u64,
        );
        tracing::debug!(
            documents = summary.documents,
            chunks = summary.chunks,
            written = summary.written,
            skipped = summary.skipped,
            "Loaded documents"
        );
        Ok(summary)
    }

    /// Load document/filters pairs one at a time, stopping at the first failure.
    pub async fn load_posts(
        &self,
        pairs: Vec<(Document, KnowledgeFilters)>,
        options: LoadOptions,
    ) -> Result<LoadSummary, KnowledgeError> {
        let mut summary = LoadSummary::default();
        if pairs.is_empty() {
            tracing::warn!("No documents to load");
            return Ok(summary);
        }

        let total = pairs.len();
        for (document, filters) in pairs {
            let name = document.name.clone().unwrap_or_default();
            match self
                .load_documents(vec![document], Some(&filters), options)
                .await
            {
                Ok(loaded) => {
                    tracing::info!(name = %name, filters = ?filters, "Loaded document");
                    summary.absorb(loaded);
                }
                Err(error) => {
                    tracing::error!(name = %name, error = %error, "Error loading documents");
                    return Err(error);
                }
            }
        }

        tracing::info!(total, written = summary.written, "Loaded all documents");
        Ok(summary)
    }

    /// Read every JSON file under [`JsonKnowledgeBase::path`] and load it.
    ///
    /// `recreate` drops the table once every file has been read and parsed.
    pub async fn load(&self, recreate: bool, upsert: bool) -> Result<LoadSummary, KnowledgeError> {
        let documents = read_json_documents(&self.path)?;
        self.prepare_table(recreate).await?;
        tracing::info!(
            count = documents.len(),
            path = %self.path.display(),
            "Loading knowledge files"
        );
        self.load_documents(
            documents,
            None,
            LoadOptions {
                upsert,
                skip_existing: true,
            },
        )
        .await
    }

    /// Search the store, dropping unknown filter keys with a warning.
    ///
    /// When none of the requested keys is known the search runs unfiltered.
    pub async fn search(
        &self,
        query: &str,
        num_documents: Option<usize>,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<Vec<Document>, KnowledgeError> {
        let limit = num_documents.unwrap_or(self.num_documents).max(1);
        let valid = match filters.filter(|filters| !filters.is_empty()) {
            Some(requested) => {
                let (valid, invalid) = KnowledgeApi::validate_filters(self, requested);
                if valid.is_empty() {
                    tracing::warn!(invalid = ?invalid, "No valid filters remain; searching without filters");
                    None
                } else {
                    Some(valid)
                }
            }
            None => None,
        };

        let documents = self.vector_db.search(query, limit, valid.as_ref()).await?;
        tracing::info!(query, limit, results = documents.len(), "Searched knowledge base");
        Ok(documents)
    }
}

#[async_trait]
impl KnowledgeApi for JsonKnowledgeBase {
    async fn search(
        &self,
        query: &str,
        num_documents: Option<usize>,
        filters: Option<&KnowledgeFilters>,
    ) -> Result<Vec<Document>, KnowledgeError> {
        JsonKnowledgeBase::search(self, query, num_documents, filters).await
    }

    fn validate_filters(&self, filters: &KnowledgeFilters) -> (KnowledgeFilters, Vec<String>) {
        let guard = self
            .valid_metadata_filters
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        validate_filters(guard.as_ref(), filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::filters::initialize_knowledge_filters;
    use crate::pgvector::merge_meta_data;
    use serde_json::{Map, Value, json};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryState {
        exists: bool,
        rows: Vec<(Document, KnowledgeFilters)>,
        searches: Vec<Option<KnowledgeFilters>>,
    }

    /// Vector store that keeps rows in memory and returns them in insertion order.
    #[derive(Default)]
    struct MemoryDb {
        state: Mutex<MemoryState>,
    }

    #[async_trait]
    impl VectorDb for MemoryDb {
        async fn create(&self) -> Result<(), VectorDbError> {
            self.state.lock().unwrap().exists = true;
            Ok(())
        }

        async fn exists(&self) -> Result<bool, VectorDbError> {
            Ok(self.state.lock().unwrap().exists)
        }

        async fn drop_table(&self) -> Result<(), VectorDbError> {
            let mut state = self.state.lock().unwrap();
            state.exists = false;
            state.rows.clear();
            Ok(())
        }

        async fn delete(&self) -> Result<(), VectorDbError> {
            self.state.lock().unwrap().rows.clear();
            Ok(())
        }

        async fn content_hash_exists(&self, content_hash: &str) -> Result<bool, VectorDbError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .rows
                .iter()
                .any(|(doc, _)| doc.content_hash() == content_hash))
        }

        async fn count(&self) -> Result<u64, VectorDbError> {
            Ok(self.state.lock().unwrap().rows.len() as u64)
        }

        async fn insert(
            &self,
            documents: Vec<Document>,
            filters: Option<&KnowledgeFilters>,
        ) -> Result<usize, VectorDbError> {
            let mut state = self.state.lock().unwrap();
            let count = documents.len();
            for mut document in documents {
                document.meta_data = merge_meta_data(&document.meta_data, filters);
                state.rows.push((document, filters.cloned().unwrap_or_default()));
            }
            Ok(count)
        }

        async fn upsert(
            &self,
            documents: Vec<Document>,
            filters: Option<&KnowledgeFilters>,
        ) -> Result<usize, VectorDbError> {
            {
                let mut state = self.state.lock().unwrap();
                let ids: Vec<String> = documents.iter().map(Document::storage_id).collect();
                state.rows.retain(|(doc, _)| !ids.contains(&doc.storage_id()));
            }
            self.insert(documents, filters).await
        }

        async fn search(
            &self,
            _query: &str,
            limit: usize,
            filters: Option<&KnowledgeFilters>,
        ) -> Result<Vec<Document>, VectorDbError> {
            let mut state = self.state.lock().unwrap();
            state.searches.push(filters.cloned());
            Ok(state
                .rows
                .iter()
                .filter(|(doc, _)| {
                    filters.is_none_or(|filters| {
                        filters
                            .iter()
                            .all(|(key, value)| doc.meta_data.get(key) == Some(value))
                    })
                })
                .take(limit)
                .map(|(doc, _)| doc.clone())
                .collect())
        }

        async fn filter_keys(&self) -> Result<BTreeSet<String>, VectorDbError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .rows
                .iter()
                .flat_map(|(_, filters)| filters.keys().cloned())
                .collect())
        }
    }

    fn filters(value: Value) -> KnowledgeFilters {
        value.as_object().cloned().unwrap_or_default()
    }

    fn post(body: &str, user_id: u64) -> (Document, KnowledgeFilters) {
        (
            Document::new(body, Some(format!("post by {user_id}")), Map::new()),
            filters(json!({ "user_id": user_id })),
        )
    }

    fn knowledge() -> JsonKnowledgeBase {
        JsonKnowledgeBase::new("unused", Box::new(MemoryDb::default()))
    }

    #[tokio::test]
    async fn load_posts_creates_table_and_tracks_filters() {
        let kb = knowledge();
        let summary = kb
            .load_posts(vec![post("first", 1), post("second", 2)], LoadOptions::default())
            .await
            .expect("load");

        assert_eq!(summary.documents, 2);
        assert_eq!(summary.written, 2);
        assert!(kb.vector_db().exists().await.expect("exists"));
        assert_eq!(kb.vector_db().count().await.expect("count"), 2);
        assert_eq!(
            kb.valid_metadata_filters(),
            Some(BTreeSet::from(["user_id".to_string()]))
        );
        assert_eq!(kb.metrics().documents_loaded, 2);
    }

    #[tokio::test]
    async fn load_posts_with_nothing_is_a_no_op() {
        let kb = knowledge();
        let summary = kb.load_posts(Vec::new(), LoadOptions::default()).await.expect("load");
        assert_eq!(summary, LoadSummary::default());
        assert!(!kb.vector_db().exists().await.expect("exists"));
    }

    #[tokio::test]
    async fn repeated_content_is_skipped_unless_upserting() {
        let kb = knowledge();
        kb.load_posts(vec![post("same", 1)], LoadOptions::default())
            .await
            .expect("first");
        let again = kb
            .load_posts(vec![post("same", 1), post("same", 1)], LoadOptions::default())
            .await
            .expect("second");
        assert_eq!(again.written, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(kb.vector_db().count().await.expect("count"), 1);

        let upserted = kb
            .load_posts(
                vec![post("same", 1)],
                LoadOptions {
                    upsert: true,
                    skip_existing: true,
                },
            )
            .await
            .expect("upsert");
        assert_eq!(upserted.written, 1);
        assert_eq!(kb.vector_db().count().await.expect("count"), 1);
        assert_eq!(kb.metrics().chunks_skipped, 2);
    }

    #[tokio::test]
    async fn search_keeps_only_valid_filters() {
        let kb = knowledge();
        kb.load_posts(vec![post("first", 1), post("second", 2)], LoadOptions::default())
            .await
            .expect("load");

        let results = kb
            .search("anything", None, Some(&filters(json!({ "user_id": 2, "mood": "happy" }))))
            .await
            .expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "second");
    }

    #[tokio::test]
    async fn search_without_valid_filters_runs_unfiltered() {
        let kb = knowledge();
        kb.load_posts(vec![post("first", 1), post("second", 2)], LoadOptions::default())
            .await
            .expect("load");

        let results = kb
            .search("anything", Some(1), Some(&filters(json!({ "mood": "happy" }))))
            .await
            .expect("search");
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn initialize_registers_user_id_before_any_load() {
        let kb = knowledge();
        assert!(kb.valid_metadata_filters().is_none());
        initialize_knowledge_filters(&kb);
        initialize_knowledge_filters(&kb);
        assert_eq!(
            kb.valid_metadata_filters(),
            Some(BTreeSet::from(["user_id".to_string()]))
        );
    }

    #[tokio::test]
    async fn refresh_picks_up_stored_filter_keys() {
        let db = MemoryDb::default();
        db.create().await.expect("create");
        db.insert(
            vec![Document::new("stored", None, Map::new())],
            Some(&filters(json!({ "user_id": 3, "lang": "en" }))),
        )
        .await
        .expect("insert");

        let kb = JsonKnowledgeBase::new("unused", Box::new(db));
        kb.refresh_valid_filters().await.expect("refresh");
        assert_eq!(
            kb.valid_metadata_filters(),
            Some(BTreeSet::from(["lang".to_string(), "user_id".to_string()]))
        );
    }

    #[tokio::test]
    async fn load_reads_json_directory() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("post_1.json"), r#"{"id": 1}"#).expect("write");

        let kb = JsonKnowledgeBase::new(dir.path(), Box::new(MemoryDb::default()));
        let summary = kb.load(true, false).await.expect("load");
        assert_eq!(summary.written, 1);
    }

    async fn seeded_knowledge(path: &Path) -> JsonKnowledgeBase {
        let kb = JsonKnowledgeBase::new(path, Box::new(MemoryDb::default()));
        kb.load_posts(vec![post("kept", 1)], LoadOptions::default())
            .await
            .expect("seed");
        kb
    }

    #[tokio::test]
    async fn recreate_keeps_rows_when_directory_is_missing() {
        let dir = TempDir::new().expect("tempdir");
        let kb = seeded_knowledge(&dir.path().join("missing")).await;

        let result = kb.load(true, false).await;
        assert!(matches!(result, Err(KnowledgeError::Io { .. })));
        assert_eq!(kb.vector_db().count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn recreate_keeps_rows_when_a_file_is_malformed() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("good.json"), r#"{"id": 1}"#).expect("write");
        std::fs::write(dir.path().join("bad.json"), "{ not json").expect("write");
        let kb = seeded_knowledge(dir.path()).await;

        let result = kb.load(true, false).await;
        assert!(matches!(result, Err(KnowledgeError::Json { .. })));
        assert_eq!(kb.vector_db().count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn dotted_and_plain_filter_keys_find_the_same_rows() {
        let kb = knowledge();
        kb.load_posts(vec![post("first", 1), post("second", 2)], LoadOptions::default())
            .await
            .expect("load");

        let plain = kb
            .search("anything", None, Some(&filters(json!({ "user_id": 2 }))))
            .await
            .expect("plain");
        let dotted = kb
            .search("anything", None, Some(&filters(json!({ "meta_data.user_id": 2 }))))
            .await
            .expect("dotted");

        assert_eq!(plain.len(), 1);
        assert_eq!(plain, dotted);
    }
}
