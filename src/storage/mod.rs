//! Storage backends for the exam index
//!
//! Both backends implement `IndexPersistence`. `JsonFileStore` writes the
//! plain JSON files other tools read; `SqliteStore` keeps the same data in a
//! single database with tree snapshot history.

mod json_file;
mod sqlite;
mod traits;

pub use json_file::{JsonFileLayout, JsonFileStore};
pub use sqlite::SqliteStore;
pub use traits::{IndexPersistence, OpenStore, StorageError, StorageResult};
