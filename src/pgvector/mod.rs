//! PostgreSQL + pgvector knowledge store.

pub mod client;
pub mod sql;
pub mod types;

pub use client::{PgVector, PgVectorConfig};
pub use sql::{TableRef, filter_operand, merge_meta_data, validate_identifier};
pub use types::{SearchType, VectorDb, VectorDbError};
