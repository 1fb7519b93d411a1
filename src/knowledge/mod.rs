//! Knowledge documents, chunking, filters and the knowledge base that ties them to a store.

pub mod base;
pub mod chunking;
pub mod document;
pub mod filters;
pub mod reader;

pub use base::{DEFAULT_NUM_DOCUMENTS, JsonKnowledgeBase, KnowledgeApi, KnowledgeError, LoadOptions, LoadSummary};
pub use chunking::{ChunkingError, SemanticChunking};
pub use document::{
    Document, KnowledgeFilters, clean_content, content_hash, create_document_metadata,
    generate_documents,
};
pub use filters::{initialize_knowledge_filters, validate_filters};
pub use reader::read_json_documents;
