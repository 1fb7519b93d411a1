//! Reads JSON files from a directory into knowledge documents.

use std::fs;
use std::path::Path;

use serde_json::{Map, Value, json};
use walkdir::WalkDir;

use super::base::KnowledgeError;
use super::document::Document;

/// Read every `*.json` file directly inside `dir`.
///
/// A file holding an object yields one document; a file holding an array yields one document per
/// element. Documents are named after the file stem, carry a 1-based `page` and use the
/// element's compact JSON text as content. A missing or unreadable directory is an error.
pub fn read_json_documents(dir: &Path) -> Result<Vec<Document>, KnowledgeError> {
    if !dir.is_dir() {
        return Err(KnowledgeError::Io {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "directory not found"),
        });
    }

    let mut documents = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|error| KnowledgeError::Io {
            path: dir.to_path_buf(),
            source: error.into(),
        })?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "json") {
            documents.extend(read_json_file(path)?);
        }
    }
    Ok(documents)
}

fn read_json_file(path: &Path) -> Result<Vec<Document>, KnowledgeError> {
    let raw = fs::read_to_string(path).map_err(|source| KnowledgeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: Value = serde_json::from_str(&raw).map_err(|source| KnowledgeError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let items = match parsed {
        Value::Array(items) => items,
        other => vec![other],
    };

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let page = index + 1;
            let mut meta_data = Map::new();
            meta_data.insert("page".into(), json!(page));
            let mut document = Document::new(item.to_string(), Some(stem.clone()), meta_data);
            document.id = Some(format!("{stem}_{page}"));
            document
        })
        .collect())
}
