//! SQL text and JSON helpers for the pgvector store.
//!
//! Identifiers are validated once and then interpolated; every value travels as a bind
//! parameter.

use serde_json::{Map, Value};

use super::types::{SearchType, VectorDbError};

/// Text search configuration used for both indexing and querying.
const TEXT_SEARCH_CONFIG: &str = "english";

/// Validated `schema.table` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    schema: String,
    table: String,
}

impl TableRef {
    /// Validate both identifiers and build the reference.
    pub fn new(schema: &str, table: &str) -> Result<Self, VectorDbError> {
        validate_identifier(schema)?;
        validate_identifier(table)?;
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    /// Schema name.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Bare table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Schema-qualified name for use in statements.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Accept ASCII alphanumerics and underscores, not starting with a digit.
pub fn validate_identifier(name: &str) -> Result<(), VectorDbError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(VectorDbError::InvalidIdentifier(name.to_string()))
    }
}

/// Statements that bring the extension, schema, table and indexes into existence.
pub(crate) fn create_statements(table: &TableRef, dimension: usize) -> Vec<String> {
    let qualified = table.qualified();
    let name = table.table();
    vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        format!("CREATE SCHEMA IF NOT EXISTS {}", table.schema()),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {qualified} (
                id TEXT PRIMARY KEY,
                name TEXT,
                meta_data JSONB NOT NULL DEFAULT '{{}}',
                filters JSONB DEFAULT '{{}}',
                content TEXT NOT NULL,
                embedding vector({dimension}),
                usage JSONB,
                content_hash TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#
        ),
        format!("CREATE INDEX IF NOT EXISTS {name}_content_hash_idx ON {qualified} (content_hash)"),
        format!("CREATE INDEX IF NOT EXISTS {name}_name_idx ON {qualified} (name)"),
        format!(
            "CREATE INDEX IF NOT EXISTS {name}_embedding_idx ON {qualified} \
             USING hnsw (embedding vector_cosine_ops) WITH (m = 16, ef_construction = 64)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {name}_content_fts_idx ON {qualified} \
             USING GIN (to_tsvector('{TEXT_SEARCH_CONFIG}', content))"
        ),
    ]
}

/// Insert statement; `upsert` replaces rows that share an id.
pub(crate) fn insert_sql(table: &TableRef, upsert: bool) -> String {
    let conflict = if upsert {
        "ON CONFLICT (id) DO UPDATE SET \
         name = EXCLUDED.name, \
         meta_data = EXCLUDED.meta_data, \
         filters = EXCLUDED.filters, \
         content = EXCLUDED.content, \
         embedding = EXCLUDED.embedding, \
         usage = EXCLUDED.usage, \
         content_hash = EXCLUDED.content_hash, \
         updated_at = now()"
    } else {
        "ON CONFLICT (id) DO NOTHING"
    };
    format!(
        "INSERT INTO {} (id, name, meta_data, filters, content, embedding, usage, content_hash) \
         VALUES ($1, $2, $3, $4, $5, $6::vector, $7, $8) {conflict}",
        table.qualified()
    )
}

/// Search statement for the given ranking strategy.
///
/// Bind order:
/// - vector: embedding, [filters], limit
/// - keyword: query, [filters], limit
/// - hybrid: embedding, query, vector weight, [filters], limit
pub(crate) fn search_sql(table: &TableRef, search_type: SearchType, with_filters: bool) -> String {
    let qualified = table.qualified();
    let columns = "id, name, meta_data, content, usage";
    let document = format!("to_tsvector('{TEXT_SEARCH_CONFIG}', content)");
    match search_type {
        SearchType::Vector => {
            let filter = if with_filters {
                "WHERE meta_data @> $2::jsonb "
            } else {
                ""
            };
            let limit = if with_filters { 3 } else { 2 };
            format!(
                "SELECT {columns}, (1 - (embedding <=> $1::vector))::float8 AS score \
                 FROM {qualified} {filter}\
                 ORDER BY embedding <=> $1::vector LIMIT ${limit}"
            )
        }
        SearchType::Keyword => {
            let query = format!("websearch_to_tsquery('{TEXT_SEARCH_CONFIG}', $1)");
            let filter = if with_filters {
                "AND meta_data @> $2::jsonb "
            } else {
                ""
            };
            let limit = if with_filters { 3 } else { 2 };
            format!(
                "SELECT {columns}, ts_rank_cd({document}, {query})::float8 AS score \
                 FROM {qualified} WHERE {document} @@ {query} {filter}\
                 ORDER BY score DESC LIMIT ${limit}"
            )
        }
        SearchType::Hybrid => {
            let query = format!("websearch_to_tsquery('{TEXT_SEARCH_CONFIG}', $2)");
            let filter = if with_filters {
                "WHERE meta_data @> $4::jsonb "
            } else {
                ""
            };
            let limit = if with_filters { 5 } else { 4 };
            format!(
                "SELECT {columns}, \
                 ($3::float8 * (1 - (embedding <=> $1::vector)) \
                 + (1 - $3::float8) * ts_rank_cd({document}, {query}))::float8 AS score \
                 FROM {qualified} {filter}\
                 ORDER BY score DESC LIMIT ${limit}"
            )
        }
    }
}

/// Existence probe for the backing table; binds schema then table.
pub(crate) const TABLE_EXISTS_SQL: &str = "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
     WHERE table_schema = $1 AND table_name = $2)";

pub(crate) fn content_hash_exists_sql(table: &TableRef) -> String {
    format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE content_hash = $1)",
        table.qualified()
    )
}

pub(crate) fn count_sql(table: &TableRef) -> String {
    format!("SELECT COUNT(*) FROM {}", table.qualified())
}

pub(crate) fn drop_sql(table: &TableRef) -> String {
    format!("DROP TABLE IF EXISTS {}", table.qualified())
}

pub(crate) fn delete_sql(table: &TableRef) -> String {
    format!("DELETE FROM {}", table.qualified())
}

pub(crate) fn filter_keys_sql(table: &TableRef) -> String {
    format!(
        "SELECT DISTINCT jsonb_object_keys(filters) AS key FROM {} \
         WHERE jsonb_typeof(filters) = 'object'",
        table.qualified()
    )
}

/// Stored metadata: document metadata with filters layered on top so containment matches them.
pub fn merge_meta_data(meta_data: &Map<String, Value>, filters: Option<&Map<String, Value>>) -> Map<String, Value> {
    let mut merged = meta_data.clone();
    if let Some(filters) = filters {
        for (key, value) in filters {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// JSON containment operand for a search, or `None` when nothing restricts the query.
pub fn filter_operand(filters: Option<&Map<String, Value>>) -> Option<Value> {
    filters
        .filter(|filters| !filters.is_empty())
        .map(|filters| Value::Object(filters.clone()))
}
