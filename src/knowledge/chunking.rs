//! Semantic chunking of knowledge documents.
//!
//! A document is cleaned, split into sentences and every sentence is embedded. Consecutive
//! sentences stay in the same chunk while they remain similar to the chunk's centroid and the
//! chunk fits the token budget. Highlights:
//!
//! - Token counting: prefer `tiktoken-rs` encodings for the embedding model; fall back to a
//!   whitespace counter when no encoding can be loaded.
//! - Oversized sentences: a single sentence above the budget is split with `semchunk-rs` before
//!   grouping, so no chunk ever exceeds the budget.
//! - Chunk documents inherit the parent's name and metadata and gain `chunk` (1-based) and
//!   `chunk_size` (characters) entries.

use std::sync::Arc;

use anyhow::Error as TokenizerError;
use semchunk_rs::Chunker;
use serde_json::json;
use thiserror::Error;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

use crate::embedding::{EmbeddingClient, EmbeddingClientError, cosine_similarity};

use super::document::Document;

pub(crate) type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Errors produced while turning documents into semantic chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Chunking was configured with an impossible token budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Similarity threshold outside `[0, 1]`.
    #[error("similarity threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f32),
    /// Sentence embeddings could not be produced.
    #[error("Failed to embed sentences: {0}")]
    Embedding(#[from] EmbeddingClientError),
}

/// Groups sentences into chunks by embedding similarity.
pub struct SemanticChunking {
    embedder: Arc<dyn EmbeddingClient>,
    chunk_size: usize,
    similarity_threshold: f32,
    token_counter: TokenCounter,
}

impl SemanticChunking {
    /// Build a chunker that embeds sentences with `embedder`.
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        chunk_size: usize,
        similarity_threshold: f32,
    ) -> Result<Self, ChunkingError> {
        let token_counter = build_token_counter(embedder.model());
        Self::with_token_counter(embedder, chunk_size, similarity_threshold, token_counter)
    }

    pub(crate) fn with_token_counter(
        embedder: Arc<dyn EmbeddingClient>,
        chunk_size: usize,
        similarity_threshold: f32,
        token_counter: TokenCounter,
    ) -> Result<Self, ChunkingError> {
        if chunk_size == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        if !(0.0..=1.0).contains(&similarity_threshold) {
            return Err(ChunkingError::InvalidThreshold(similarity_threshold));
        }
        Ok(Self {
            embedder,
            chunk_size,
            similarity_threshold,
            token_counter,
        })
    }

    /// Token budget per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Minimum similarity for a sentence to join the current chunk.
    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
    }

    /// Split a document into semantically coherent chunk documents.
    ///
    /// Documents with blank content are returned unchanged.
    pub async fn chunk(&self, document: &Document) -> Result<Vec<Document>, ChunkingError> {
        let cleaned = clean_text(&document.content);
        if cleaned.is_empty() {
            return Ok(vec![document.clone()]);
        }

        let pieces: Vec<String> = split_sentences(&cleaned)
            .into_iter()
            .flat_map(|sentence| {
                if (self.token_counter)(&sentence) > self.chunk_size {
                    split_to_budget(&sentence, self.chunk_size, &self.token_counter)
                } else {
                    vec![sentence]
                }
            })
            .collect();

        let groups = if pieces.len() <= 1 {
            vec![pieces.join(" ")]
        } else {
            let embeddings = self.embedder.generate_embeddings(pieces.clone()).await?;
            if embeddings.len() != pieces.len() {
                return Err(EmbeddingClientError::InvalidResponse(format!(
                    "expected {} sentence embeddings, got {}",
                    pieces.len(),
                    embeddings.len()
                ))
                .into());
            }
            group_sentences(
                &pieces,
                &embeddings,
                self.similarity_threshold,
                self.chunk_size,
                &self.token_counter,
            )
        };

        tracing::debug!(
            name = document.name.as_deref().unwrap_or_default(),
            sentences = pieces.len(),
            chunks = groups.len(),
            "Chunked document"
        );

        Ok(groups
            .into_iter()
            .enumerate()
            .map(|(index, text)| chunk_document(document, index + 1, text))
            .collect())
    }
}

fn chunk_document(parent: &Document, number: usize, text: String) -> Document {
    let mut meta_data = parent.meta_data.clone();
    meta_data.insert("chunk".into(), json!(number));
    meta_data.insert("chunk_size".into(), json!(text.chars().count()));
    Document {
        id: parent.id.as_ref().map(|id| format!("{id}_{number}")),
        name: parent.name.clone(),
        content: text,
        meta_data,
        usage: parent.usage.clone(),
        ..Document::default()
    }
}

/// Collapse every whitespace run into a single space and trim the ends.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split cleaned text after `.`, `!` or `?` when followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().is_none_or(|next| next.is_whitespace());
        if at_boundary {
            push_trimmed(&mut sentences, &current);
            current.clear();
        }
    }
    push_trimmed(&mut sentences, &current);
    sentences
}

fn push_trimmed(sentences: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
}

/// Greedily group consecutive sentences while they stay similar to the running centroid.
pub(crate) fn group_sentences(
    sentences: &[String],
    embeddings: &[Vec<f32>],
    threshold: f32,
    chunk_size: usize,
    token_counter: &TokenCounter,
) -> Vec<String> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut centroid: Vec<f32> = Vec::new();
    let mut members = 0usize;

    for (sentence, embedding) in sentences.iter().zip(embeddings) {
        if members > 0 {
            let candidate = format!("{current} {sentence}");
            let similar = cosine_similarity(embedding, &centroid) >= threshold;
            if similar && token_counter.as_ref()(&candidate) <= chunk_size {
                current = candidate;
                let weight = members as f32;
                for (slot, value) in centroid.iter_mut().zip(embedding) {
                    *slot = (*slot * weight + value) / (weight + 1.0);
                }
                members += 1;
                continue;
            }
            groups.push(std::mem::take(&mut current));
        }
        current = sentence.clone();
        centroid = embedding.clone();
        members = 1;
    }

    if members > 0 {
        groups.push(current);
    }
    groups
}

/// Split text into pieces that each respect the token budget.
fn split_to_budget(text: &str, chunk_size: usize, token_counter: &TokenCounter) -> Vec<String> {
    let counter = token_counter.clone();
    let chunker = Chunker::new(
        chunk_size,
        Box::new(move |segment: &str| counter.as_ref()(segment)),
    );
    chunker.chunk(text)
}

/// Build a token counter for the given embedding model.
///
/// Uses OpenAI encodings when possible and falls back to whitespace tokenization when no
/// encoding can be loaded.
pub(crate) fn build_token_counter(model: &str) -> TokenCounter {
    match resolve_encoding(model) {
        Ok(encoding) => {
            let encoding = Arc::new(encoding);
            Arc::new(move |segment: &str| encoding.encode_ordinary(segment).len())
        }
        Err(error) => {
            tracing::warn!(
                model,
                error = %error,
                "Tokenizer unavailable; falling back to whitespace counter"
            );
            default_token_counter()
        }
    }
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    let target = model.trim();
    match get_bpe_from_model(target) {
        Ok(encoding) => Ok(encoding),
        Err(model_err) => {
            tracing::debug!(
                model = target,
                error = %model_err,
                "Tokenizer model lookup failed; trying encoding name"
            );
            match target {
                "o200k_base" => o200k_base(),
                "p50k_base" => p50k_base(),
                "p50k_edit" => p50k_edit(),
                "r50k_base" | "gpt2" => r50k_base(),
                _ => cl100k_base(),
            }
        }
    }
}

pub(crate) fn default_token_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}
