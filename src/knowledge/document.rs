//! Knowledge documents and the mapping from posts to documents plus filters.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::posts::{Post, PostsError, read_post_files};

/// Query-time restriction fields, e.g. `{"user_id": 97}`.
pub type KnowledgeFilters = Map<String, Value>;

/// A unit of knowledge: text plus descriptive metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier; storage falls back to the content hash when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable name, e.g. the post title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Text that gets chunked, embedded and searched.
    pub content: String,
    /// Descriptive context stored alongside the content.
    #[serde(default)]
    pub meta_data: Map<String, Value>,
    /// Embedding vector, filled in just before storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Provider usage information attached to the embedding, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    /// Relevance score assigned by a search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Document {
    /// Build a document from content, name and metadata.
    pub fn new(
        content: impl Into<String>,
        name: Option<String>,
        meta_data: Map<String, Value>,
    ) -> Self {
        Self {
            content: content.into(),
            name,
            meta_data,
            ..Self::default()
        }
    }

    /// Hash of the cleaned content; identical content always maps to the same hash.
    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }

    /// Identifier used for storage.
    pub fn storage_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.content_hash())
    }

    /// Compact view handed to the language model as search results.
    pub fn to_reference(&self) -> Value {
        json!({
            "name": self.name,
            "meta_data": self.meta_data,
            "content": self.content,
        })
    }
}

/// Content with NUL bytes replaced, as Postgres text columns reject them.
pub fn clean_content(content: &str) -> String {
    content.replace('\0', "\u{FFFD}")
}

/// SHA-256 hex digest of the cleaned content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(clean_content(content).as_bytes());
    hex::encode(hasher.finalize())
}

/// Turn a post into a knowledge document and the filters it should be searchable by.
///
/// Metadata carries tags, reactions and views as served, with `[]`, `{}` and `0` when absent.
/// The author id is kept separate as a filter. A post without a `body` or `title` string is
/// an error.
pub fn create_document_metadata(
    post: &Post,
) -> Result<(Document, KnowledgeFilters), PostsError> {
    let body = post.body().ok_or(PostsError::MissingField("body"))?;
    let title = post.title().ok_or(PostsError::MissingField("title"))?;

    let mut meta_data = Map::new();
    meta_data.insert("tags".into(), post.tags());
    meta_data.insert("reactions".into(), post.reactions());
    meta_data.insert("views".into(), post.views());

    let mut filters = Map::new();
    filters.insert("user_id".into(), post.user_id());

    Ok((Document::new(body, Some(title.to_string()), meta_data), filters))
}

/// Read every post file in `dir` and map it into a document/filters pair.
///
/// Files that fail to parse are logged and skipped.
pub fn generate_documents(dir: &Path) -> Result<Vec<(Document, KnowledgeFilters)>, PostsError> {
    let files = read_post_files(dir)?;
    tracing::info!(count = files.len(), dir = %dir.display(), "Found JSON files to process");

    let mut documents = Vec::with_capacity(files.len());
    for file in files {
        let name = file.file_name();
        match file.post.and_then(|post| create_document_metadata(&post)) {
            Ok((document, filters)) => {
                tracing::info!(
                    file = %name,
                    title = document.name.as_deref().unwrap_or_default(),
                    "Generated document"
                );
                documents.push((document, filters));
            }
            Err(error) => {
                tracing::warn!(file = %name, error = %error, "Error processing post file");
            }
        }
    }

    tracing::info!(count = documents.len(), "Generated documents");
    Ok(documents)
}
