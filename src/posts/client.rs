//! HTTP client for the paginated posts API.

use std::path::{Path, PathBuf};

use reqwest::Client;

use super::files::save_posts;
use super::types::{Post, PostsError, PostsPage};

/// Lightweight HTTP client for the posts listing endpoint.
pub struct PostsClient {
    pub(crate) client: Client,
    pub(crate) endpoint: String,
}

impl PostsClient {
    /// Construct a client for the given listing endpoint (e.g. `https://dummyjson.com/posts`).
    pub fn new(endpoint: &str) -> Result<Self, PostsError> {
        let client = Client::builder().user_agent("postrag/0.1").build()?;
        let endpoint = normalize_endpoint(endpoint).map_err(PostsError::InvalidUrl)?;
        tracing::debug!(endpoint = %endpoint, "Initialized posts client");
        Ok(Self { client, endpoint })
    }

    /// Fetch the first page using the server's default page size.
    pub async fn fetch_posts(&self) -> Result<Vec<Post>, PostsError> {
        let page = self.get_page(&[]).await?;
        tracing::info!(count = page.posts.len(), total = page.total, "Fetched posts");
        Ok(page.posts)
    }

    /// Fetch a single page starting at `skip`.
    pub async fn fetch_page(&self, skip: u64, limit: u64) -> Result<PostsPage, PostsError> {
        if limit == 0 {
            return Err(PostsError::InvalidPageSize);
        }
        self.get_page(&[("limit", limit), ("skip", skip)]).await
    }

    /// Walk every page until the reported total is reached.
    pub async fn fetch_all(&self, page_size: u64) -> Result<Vec<Post>, PostsError> {
        if page_size == 0 {
            return Err(PostsError::InvalidPageSize);
        }

        let mut posts = Vec::new();
        let mut skip = 0;
        loop {
            let page = self.fetch_page(skip, page_size).await?;
            let received = page.posts.len() as u64;
            tracing::debug!(skip, received, total = page.total, "Fetched posts page");
            posts.extend(page.posts);
            skip += received;
            if received == 0 || skip >= page.total {
                break;
            }
        }

        tracing::info!(count = posts.len(), "Fetched all posts");
        Ok(posts)
    }

    async fn get_page(&self, query: &[(&str, u64)]) -> Result<PostsPage, PostsError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = PostsError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Posts request failed");
            return Err(error);
        }

        Ok(response.json().await?)
    }
}

/// Fetch posts and write each one to `output_dir`, returning the written paths.
pub async fn fetch_and_save_posts(
    client: &PostsClient,
    output_dir: &Path,
    all_pages: bool,
    page_size: u64,
) -> Result<Vec<PathBuf>, PostsError> {
    let posts = if all_pages {
        client.fetch_all(page_size).await?
    } else {
        client.fetch_posts().await?
    };

    save_posts(output_dir, &posts)
}

fn normalize_endpoint(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}
