//! Storage trait definitions

use crate::index::{ExamRecord, HierarchicalTree};
use crate::model::IndexEntry;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt index file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Date parsing error: {0}")]
    DateParse(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence boundary for the index.
///
/// Entries are the source of truth; the tree is written only as a derived
/// snapshot for readers. Implementations must be thread-safe.
pub trait IndexPersistence: Send + Sync {
    /// All entries, in stored order. A store that has never been written is empty.
    fn load_entries(&self) -> StorageResult<Vec<IndexEntry>>;

    /// Replace the stored entry list
    fn save_entries(&self, entries: &[IndexEntry]) -> StorageResult<()>;

    /// Write the latest reconciled tree
    fn save_tree(&self, tree: &HierarchicalTree) -> StorageResult<()>;

    /// Latest tree written, if any
    fn load_tree(&self) -> StorageResult<Option<HierarchicalTree>>;

    fn load_exam_records(&self) -> StorageResult<Vec<ExamRecord>>;

    /// Insert or replace the record for its document pair
    fn save_exam_record(&self, record: &ExamRecord) -> StorageResult<()>;
}

/// Trait for stores that can be opened from a path
pub trait OpenStore: IndexPersistence + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
