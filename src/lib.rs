//! examindex: exam paper alignment and index reconciliation
//!
//! Turns OCR'd question papers and mark schemes into structured question
//! trees, and keeps a hierarchical index of the documents consistent as
//! they arrive and get reprocessed.
//!
//! # Core Pieces
//!
//! - **Alignment**: a sliding window walks a question paper and its mark
//!   scheme at independent paces, asking an LLM to pair what it sees and
//!   merging the replies into complete question trees
//! - **Index**: flat per-document entries, question paper / mark scheme
//!   pairing, and the subject → year → qualification → unit tree built
//!   from them
//! - **Pipeline**: ingest, batch alignment and specification tagging on
//!   top of a JSON-file or SQLite store
//!
//! # Example
//!
//! ```
//! use examindex::{DocumentType, HierarchicalIndexReconciler, IndexEntry, RelationshipResolver};
//!
//! let mut entries = vec![
//!     IndexEntry::new("s23-2500u20-1a", DocumentType::QuestionPaper, 2023, "GCSE", "Computer Science"),
//!     IndexEntry::new("s23-2500u20-1-ms", DocumentType::MarkScheme, 2023, "GCSE", "Computer Science"),
//! ];
//! RelationshipResolver::new().resolve(&mut entries);
//! let tree = HierarchicalIndexReconciler::new().reconcile(&entries).tree;
//! assert_eq!(tree.unit_count(), 1);
//! ```

pub mod align;
pub mod batch;
pub mod config;
pub mod index;
pub mod llm;
pub mod metadata;
pub mod model;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod tagging;

pub use align::{
    AlignmentCursor, AlignmentOutcome, AssembleError, AssemblerResult, ContentWindowBuilder,
    MediaAssociator, ResponseAssembler, RetryPolicy, SkippedWindow, SlidingWindowAligner,
};
pub use batch::{BatchReport, BatchRunner, CancellationToken, JobOutcome};
pub use config::{Config, ConfigError};
pub use index::{
    ExamRecord, HierarchicalIndexReconciler, HierarchicalTree, IndexSearcher, IndexStore,
    RelationshipResolver, SearchQuery,
};
pub use llm::{LlmClient, LlmError, MockClient, SubprocessClient};
pub use metadata::{DocumentMetadata, MetadataError, MetadataExtractor};
pub use model::{DocumentType, ImageRef, IndexEntry, Page, Question, UnitSlot};
pub use pipeline::{AlignedExam, ExamPipeline, PipelineError, PipelineResult};
pub use source::{DocumentError, DocumentSource, FsDocumentSource};
pub use storage::{IndexPersistence, JsonFileStore, OpenStore, SqliteStore, StorageError, StorageResult};
pub use tagging::SpecTagger;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
