use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

use crate::pgvector::SearchType;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_SCHEMA: &str = "rag_demo";
const DEFAULT_TABLE: &str = "posts";
const DEFAULT_VECTOR_SCORE_WEIGHT: f32 = 0.5;
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.3;
const DEFAULT_SEMANTIC_CHUNK_SIZE: usize = 5000;
const DEFAULT_SEARCH_LIMIT: usize = 5;
const DEFAULT_KNOWLEDGE_DIR: &str = "knowledge/files";
const DEFAULT_POSTS_API_URL: &str = "https://dummyjson.com/posts";

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration shared by the CLI commands.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// PostgreSQL connection string; only the load and ask commands need it.
    pub database_url: Option<String>,
    /// API key for the OpenAI-compatible endpoints.
    pub openai_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible API, without a trailing slash.
    pub openai_base_url: String,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Chat model used by the agent.
    pub chat_model: String,
    /// Postgres schema that owns the knowledge table.
    pub pgvector_schema: String,
    /// Knowledge table name.
    pub pgvector_table: String,
    /// Ranking strategy used by knowledge searches.
    pub search_type: SearchType,
    /// Weight of the vector score in hybrid ranking.
    pub vector_score_weight: f32,
    /// Minimum cosine similarity for a sentence to join the current semantic chunk.
    pub semantic_similarity_threshold: f32,
    /// Token budget for a single semantic chunk.
    pub semantic_chunk_size: usize,
    /// Number of documents returned per knowledge search.
    pub search_limit: usize,
    /// Directory holding one JSON file per post.
    pub knowledge_dir: PathBuf,
    /// Endpoint serving paginated post records.
    pub posts_api_url: String,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Hosted OpenAI embeddings API.
    OpenAI,
    /// Deterministic local hashing, useful offline and in tests.
    Hash,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vector_score_weight =
            load_parsed("VECTOR_SCORE_WEIGHT", DEFAULT_VECTOR_SCORE_WEIGHT)?;
        if !(0.0..=1.0).contains(&vector_score_weight) {
            return Err(ConfigError::InvalidValue("VECTOR_SCORE_WEIGHT".into()));
        }
        let semantic_similarity_threshold = load_parsed(
            "SEMANTIC_SIMILARITY_THRESHOLD",
            DEFAULT_SIMILARITY_THRESHOLD,
        )?;
        if !(0.0..=1.0).contains(&semantic_similarity_threshold) {
            return Err(ConfigError::InvalidValue(
                "SEMANTIC_SIMILARITY_THRESHOLD".into(),
            ));
        }
        let embedding_dimension = load_parsed("EMBEDDING_DIMENSION", DEFAULT_EMBEDDING_DIMENSION)?;
        if embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }
        let semantic_chunk_size = load_parsed("SEMANTIC_CHUNK_SIZE", DEFAULT_SEMANTIC_CHUNK_SIZE)?;
        if semantic_chunk_size == 0 {
            return Err(ConfigError::InvalidValue("SEMANTIC_CHUNK_SIZE".into()));
        }
        let search_limit = load_parsed("SEARCH_LIMIT", DEFAULT_SEARCH_LIMIT)?;
        if search_limit == 0 {
            return Err(ConfigError::InvalidValue("SEARCH_LIMIT".into()));
        }

        Ok(Self {
            database_url: load_env_optional("DATABASE_URL"),
            openai_api_key: load_env_optional("OPENAI_API_KEY"),
            openai_base_url: load_env_or("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            embedding_provider: load_env_or("EMBEDDING_PROVIDER", "openai")
                .parse()
                .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".into()))?,
            embedding_model: load_env_or("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            embedding_dimension,
            chat_model: load_env_or("CHAT_MODEL", DEFAULT_CHAT_MODEL),
            pgvector_schema: load_env_or("PGVECTOR_SCHEMA", DEFAULT_SCHEMA),
            pgvector_table: load_env_or("PGVECTOR_TABLE", DEFAULT_TABLE),
            search_type: load_env_or("SEARCH_TYPE", "hybrid")
                .parse()
                .map_err(|()| ConfigError::InvalidValue("SEARCH_TYPE".into()))?,
            vector_score_weight,
            semantic_similarity_threshold,
            semantic_chunk_size,
            search_limit,
            knowledge_dir: PathBuf::from(load_env_or("KNOWLEDGE_DIR", DEFAULT_KNOWLEDGE_DIR)),
            posts_api_url: load_env_or("POSTS_API_URL", DEFAULT_POSTS_API_URL),
        })
    }

    /// Emit the non-secret settings at debug level. Call once tracing is installed.
    pub fn log_summary(&self) {
        tracing::debug!(
            schema = %self.pgvector_schema,
            table = %self.pgvector_table,
            embedding_provider = ?self.embedding_provider,
            embedding_model = %self.embedding_model,
            search_type = ?self.search_type,
            knowledge_dir = %self.knowledge_dir.display(),
            "Loaded configuration"
        );
    }

    /// Return the database URL or report it as missing.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVariable("DATABASE_URL".into()))
    }

    /// Return the OpenAI API key or report it as missing.
    pub fn require_openai_api_key(&self) -> Result<&str, ConfigError> {
        self.openai_api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVariable("OPENAI_API_KEY".into()))
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_env_or(key: &str, default: &str) -> String {
    load_env_optional(key).unwrap_or_else(|| default.to_string())
}

fn load_parsed<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "hash" => Ok(Self::Hash),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
///
/// Calling this more than once keeps the first configuration.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    if let Some(existing) = CONFIG.get() {
        return Ok(existing);
    }
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    Ok(CONFIG.get_or_init(|| config))
}
