#![deny(missing_docs)]

//! Core library for postrag: retrieval-augmented answers over social media posts.

/// Tool-calling agent and chat model clients.
pub mod agent;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Documents, chunking, filters and the knowledge base.
pub mod knowledge;
/// Structured logging and tracing setup.
pub mod logging;
/// Knowledge loading metrics helpers.
pub mod metrics;
/// PostgreSQL + pgvector knowledge store.
pub mod pgvector;
/// Fetching and storing source posts.
pub mod posts;
