//! One-file-per-post storage on the local filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::types::{Post, PostsError};

/// A post file read from disk, kept even when parsing failed so callers can report it.
#[derive(Debug)]
pub struct PostFile {
    /// Location of the file.
    pub path: PathBuf,
    /// Parsed post, or the reason it could not be read.
    pub post: Result<Post, PostsError>,
}

impl PostFile {
    /// File name component for log lines.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// File name used for a post with the given identifier.
pub fn post_file_name(id: &str) -> String {
    format!("post_{id}.json")
}

/// Write each post verbatim as pretty-printed JSON into `dir`, creating the directory when
/// missing. Posts without a usable `id` are logged and skipped.
pub fn save_posts(dir: &Path, posts: &[Post]) -> Result<Vec<PathBuf>, PostsError> {
    fs::create_dir_all(dir).map_err(|source| PostsError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::with_capacity(posts.len());
    for post in posts {
        let Some(id) = post.id() else {
            tracing::warn!(title = ?post.title(), "Skipping post without an id");
            continue;
        };
        let path = dir.join(post_file_name(&id));
        let json = serde_json::to_string_pretty(post).map_err(|source| PostsError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| PostsError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::info!(post_id = %id, path = %path.display(), "Saved post");
        written.push(path);
    }
    Ok(written)
}

/// Read every `*.json` file directly inside `dir`, sorted by file name.
pub fn read_post_files(dir: &Path) -> Result<Vec<PostFile>, PostsError> {
    if !dir.is_dir() {
        return Err(PostsError::Io {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "directory not found"),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|error| PostsError::Io {
            path: dir.to_path_buf(),
            source: error.into(),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some("json")
        {
            continue;
        }
        files.push(PostFile {
            path: path.to_path_buf(),
            post: read_post(path),
        });
    }
    Ok(files)
}

fn read_post(path: &Path) -> Result<Post, PostsError> {
    let raw = fs::read_to_string(path).map_err(|source| PostsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| PostsError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn sample_post(id: u64) -> Post {
        let raw = json!({
            "id": id,
            "title": format!("Café {id}"),
            "body": "He never looked down on those who were less fortunate.",
            "tags": ["history"],
            "reactions": { "likes": 192, "dislikes": 25 },
            "views": 305,
            "userId": 121
        });
        serde_json::from_value(raw).expect("post")
    }

    #[test]
    fn save_posts_writes_pretty_utf8_files() {
        let root = TempDir::new().expect("tempdir");
        let dir = root.path().join("nested");
        let paths = save_posts(&dir, &[sample_post(1), sample_post(2)]).expect("save");

        assert_eq!(paths, vec![dir.join("post_1.json"), dir.join("post_2.json")]);
        let raw = fs::read_to_string(&paths[0]).expect("read");
        assert!(raw.contains("Café 1"));
        assert!(raw.contains("\n  \"id\": 1"));
        assert!(raw.contains("\"userId\": 121"));
    }

    #[test]
    fn save_posts_keeps_records_verbatim_and_skips_missing_ids() {
        let dir = TempDir::new().expect("tempdir");
        let legacy = json!({ "id": 5, "title": "t", "body": "b", "reactions": 7, "extra": [1, 2] });
        let posts = vec![
            serde_json::from_value(legacy.clone()).expect("post"),
            serde_json::from_value(json!({ "title": "no id", "body": "b" })).expect("post"),
        ];

        let paths = save_posts(dir.path(), &posts).expect("save");
        assert_eq!(paths, vec![dir.path().join("post_5.json")]);
        let saved: Value =
            serde_json::from_str(&fs::read_to_string(&paths[0]).expect("read")).expect("json");
        assert_eq!(saved, legacy);
    }

    #[test]
    fn read_post_files_keeps_failures_and_ignores_other_files() {
        let dir = TempDir::new().expect("tempdir");
        save_posts(dir.path(), &[sample_post(2), sample_post(1)]).expect("save");
        fs::write(dir.path().join("post_3.json"), "{ not json").expect("write");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write");
        fs::create_dir_all(dir.path().join("sub.json")).expect("dir");

        let files = read_post_files(dir.path()).expect("read");
        let names: Vec<String> = files.iter().map(PostFile::file_name).collect();
        assert_eq!(names, vec!["post_1.json", "post_2.json", "post_3.json"]);
        assert_eq!(files[0].post.as_ref().expect("post").id().as_deref(), Some("1"));
        assert!(matches!(files[2].post, Err(PostsError::Json { .. })));
    }

    #[test]
    fn read_post_files_requires_directory() {
        let dir = TempDir::new().expect("tempdir");
        let error = read_post_files(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(error, PostsError::Io { .. }));
    }
}
