//! Shared types for post records and their failure modes.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while fetching or persisting posts.
#[derive(Debug, Error)]
pub enum PostsError {
    /// Endpoint URL failed to parse.
    #[error("Invalid posts endpoint: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The API responded with a non-success status.
    #[error("Unexpected posts API response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the API.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Pagination was requested with an empty page.
    #[error("page size must be greater than zero")]
    InvalidPageSize,
    /// Reading or writing a post file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
    /// A post record lacks a text field every document needs.
    #[error("Post is missing a `{0}` string")]
    MissingField(&'static str),
    /// A post file did not contain a valid post record.
    #[error("Invalid post JSON in {path}: {source}")]
    Json {
        /// File that failed to decode or encode.
        path: PathBuf,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// A single social media post as served by the posts API.
///
/// The record is kept exactly as received so saved files round-trip untouched. Accessors read
/// the fields the pipeline uses and fall back to defaults when a field is missing or has an
/// unexpected shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Post(Map<String, Value>);

impl Post {
    /// Wrap a raw JSON record.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Every field of the record.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Upstream identifier rendered for file names, when it is a number or a string.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::Number(id) => Some(id.to_string()),
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            _ => None,
        }
    }

    /// Post title, used as the document name.
    pub fn title(&self) -> Option<&str> {
        self.0.get("title").and_then(Value::as_str)
    }

    /// Post text, used as the document content.
    pub fn body(&self) -> Option<&str> {
        self.0.get("body").and_then(Value::as_str)
    }

    /// Topic tags, `[]` when absent.
    pub fn tags(&self) -> Value {
        self.field_or("tags", || Value::Array(Vec::new()))
    }

    /// Reaction counters as served, `{}` when absent.
    pub fn reactions(&self) -> Value {
        self.field_or("reactions", || Value::Object(Map::new()))
    }

    /// View count, `0` when absent.
    pub fn views(&self) -> Value {
        self.field_or("views", || Value::from(0))
    }

    /// Author identifier (`userId`), `0` when absent.
    pub fn user_id(&self) -> Value {
        self.field_or("userId", || Value::from(0))
    }

    fn field_or(&self, key: &str, default: impl FnOnce() -> Value) -> Value {
        match self.0.get(key) {
            Some(Value::Null) | None => default(),
            Some(value) => value.clone(),
        }
    }
}

impl From<Map<String, Value>> for Post {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// One page of the paginated posts listing.
#[derive(Debug, Clone, Deserialize)]
pub struct PostsPage {
    /// Posts contained in this page.
    #[serde(default)]
    pub posts: Vec<Post>,
    /// Total number of posts available upstream.
    #[serde(default)]
    pub total: u64,
    /// Offset of the first post in this page.
    #[serde(default)]
    pub skip: u64,
    /// Page size applied by the server.
    #[serde(default)]
    pub limit: u64,
}
