//! Filter key bookkeeping: which metadata keys a knowledge base can be searched by.

use std::collections::BTreeSet;

use super::base::JsonKnowledgeBase;
use super::document::KnowledgeFilters;

/// Filter key every post carries.
pub const USER_ID_FILTER: &str = "user_id";

/// Split `filters` into the entries whose key is known and the keys that are not.
///
/// A dotted key such as `meta_data.user_id` is accepted when either the full key or its last
/// segment is known. Keys accepted through their last segment are rewritten to that segment so
/// they match the stored metadata. Without any known keys every requested key is invalid.
pub fn validate_filters(
    valid_keys: Option<&BTreeSet<String>>,
    filters: &KnowledgeFilters,
) -> (KnowledgeFilters, Vec<String>) {
    let mut valid = KnowledgeFilters::new();
    let mut invalid = Vec::new();
    if filters.is_empty() {
        return (valid, invalid);
    }

    let Some(known) = valid_keys.filter(|keys| !keys.is_empty()) else {
        invalid.extend(filters.keys().cloned());
        tracing::warn!(keys = ?invalid, "No valid filter keys registered; ignoring filters");
        return (valid, invalid);
    };

    for (key, value) in filters {
        let base_key = key.rsplit('.').next().unwrap_or(key);
        if known.contains(key) {
            valid.insert(key.clone(), value.clone());
        } else if known.contains(base_key) {
            valid.insert(base_key.to_string(), value.clone());
        } else {
            invalid.push(key.clone());
        }
    }

    if !invalid.is_empty() {
        tracing::warn!(keys = ?invalid, known = ?known, "Invalid filter keys ignored");
    }
    (valid, invalid)
}

/// Record the keys of `filters` as valid search filters.
pub fn track_metadata_structure(valid_keys: &mut Option<BTreeSet<String>>, filters: &KnowledgeFilters) {
    if filters.is_empty() {
        return;
    }
    valid_keys
        .get_or_insert_with(BTreeSet::new)
        .extend(filters.keys().cloned());
}

/// Make sure `user_id` is searchable on `knowledge`, creating the key set when needed.
pub fn initialize_knowledge_filters(knowledge: &JsonKnowledgeBase) {
    knowledge.add_valid_filter(USER_ID_FILTER);
    tracing::debug!(
        keys = ?knowledge.valid_metadata_filters(),
        "Initialized knowledge filters"
    );
}
