use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing knowledge loading activity.
#[derive(Default)]
pub struct KnowledgeMetrics {
    documents_loaded: AtomicU64,
    chunks_inserted: AtomicU64,
    chunks_skipped: AtomicU64,
}

impl KnowledgeMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a load call: source documents plus the chunks written and skipped for them.
    pub fn record_load(&self, documents: u64, inserted: u64, skipped: u64) {
        self.documents_loaded.fetch_add(documents, Ordering::Relaxed);
        self.chunks_inserted.fetch_add(inserted, Ordering::Relaxed);
        self.chunks_skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_loaded: self.documents_loaded.load(Ordering::Relaxed),
            chunks_inserted: self.chunks_inserted.load(Ordering::Relaxed),
            chunks_skipped: self.chunks_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of loading counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Number of source documents loaded since startup.
    pub documents_loaded: u64,
    /// Chunks written to the vector store.
    pub chunks_inserted: u64,
    /// Chunks skipped because identical content was already stored.
    pub chunks_skipped: u64,
}
