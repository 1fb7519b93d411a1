//! Post records: fetching them from the public API and keeping one JSON file per post.

pub mod client;
pub mod files;
pub mod types;

pub use client::{PostsClient, fetch_and_save_posts};
pub use files::{PostFile, post_file_name, read_post_files, save_posts};
pub use types::{Post, PostsError, PostsPage};
