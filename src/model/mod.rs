//! Core data structures: pages, question trees and index entries

mod entry;
mod page;
mod question;

pub(crate) use entry::{deserialize_unit_number, deserialize_year};
pub use entry::{normalize_unit_number, DocumentType, IndexEntry, UnitSlot, UNASSIGNED_UNIT};
pub use page::{ImageRef, Page};
pub use question::{
    normalize_number, number_segments, parent_number, top_level_number,
    CompositeContent, LeafContent, Question, QuestionError, QuestionKind, QuestionRecord,
};
