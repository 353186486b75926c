//! Flat index entries, pairing and the hierarchical tree
//!
//! Entries are the source of truth. `RelationshipResolver` links question
//! papers with mark schemes, `HierarchicalIndexReconciler` folds the entries
//! into the subject/year/qualification/unit tree, and `IndexStore` holds
//! the shared state with snapshot reads.

mod reconciler;
mod resolver;
mod search;
mod store;
mod tree;
mod unit;

pub use reconciler::{
    AmbiguousUnit, HierarchicalIndexReconciler, MetadataConflict, Reconciliation, UnitConflict,
};
pub use resolver::{
    partners_by_question_paper, PairingHeuristic, RelationshipConflict, RelationshipResolver,
    ResolveReport, ResolvedLink,
};
pub use search::{ExamPair, IndexSearcher, SearchQuery};
pub use store::{IndexStore, ReconcileSummary};
pub use tree::{
    reconcile_to_entries, DocumentRef, ExamRecord, HierarchicalTree, QualificationMap, UnitMap,
    UnitNode, YearMap,
};
pub use unit::{derive_unit, unit_from_code, unit_from_title, UnitDerivation, UnitSource};
