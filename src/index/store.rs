//! Shared index state
//!
//! `IndexStore` owns the entry collection, the exam records and the current
//! tree. Readers take an `Arc` snapshot of the tree; a reconciliation builds
//! a fresh tree off to the side and swaps the pointer when done, so a reader
//! never sees a partly folded tree. One writer at a time.

use super::reconciler::{
    AmbiguousUnit, HierarchicalIndexReconciler, MetadataConflict, Reconciliation, UnitConflict,
};
use super::resolver::{RelationshipResolver, ResolveReport};
use super::tree::{ExamRecord, HierarchicalTree};
use crate::model::{IndexEntry, UnitSlot};
use crate::storage::{IndexPersistence, StorageResult};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// What a reconciliation pass reported, without the tree itself.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub units: usize,
    pub documents: usize,
    pub unit_conflicts: Vec<UnitConflict>,
    pub ambiguous: Vec<AmbiguousUnit>,
    pub metadata_conflicts: Vec<MetadataConflict>,
}

impl From<&Reconciliation> for ReconcileSummary {
    fn from(r: &Reconciliation) -> Self {
        Self {
            units: r.tree.unit_count(),
            documents: r.tree.document_count(),
            unit_conflicts: r.unit_conflicts.clone(),
            ambiguous: r.ambiguous.clone(),
            metadata_conflicts: r.metadata_conflicts.clone(),
        }
    }
}

pub struct IndexStore {
    persistence: Arc<dyn IndexPersistence>,
    entries: RwLock<Vec<IndexEntry>>,
    records: RwLock<BTreeMap<String, ExamRecord>>,
    tree: RwLock<Arc<HierarchicalTree>>,
    writer: Mutex<()>,
    resolver: RelationshipResolver,
    reconciler: HierarchicalIndexReconciler,
}

impl IndexStore {
    /// Empty store backed by `persistence`. Nothing is read.
    pub fn new(persistence: Arc<dyn IndexPersistence>) -> Self {
        Self {
            persistence,
            entries: RwLock::new(Vec::new()),
            records: RwLock::new(BTreeMap::new()),
            tree: RwLock::new(Arc::new(HierarchicalTree::new())),
            writer: Mutex::new(()),
            resolver: RelationshipResolver::new(),
            reconciler: HierarchicalIndexReconciler::new(),
        }
    }

    /// Load entries and exam records, then rebuild the tree from them.
    ///
    /// A stored tree is never trusted over the entries it was derived from.
    pub fn load(persistence: Arc<dyn IndexPersistence>) -> StorageResult<Self> {
        let entries = persistence.load_entries()?;
        let records = persistence.load_exam_records()?;
        info!(entries = entries.len(), exam_records = records.len(), "loaded index");

        let store = Self::new(persistence);
        *store.entries.write().unwrap() = entries;
        *store.records.write().unwrap() = records.into_iter().map(|r| (r.key(), r)).collect();
        store.reconcile();
        Ok(store)
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        self.entries.read().unwrap().clone()
    }

    pub fn entry(&self, id: &str) -> Option<IndexEntry> {
        self.entries.read().unwrap().iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an entry, or supersede the existing one with the same id.
    ///
    /// Links already recorded for the id survive; the resolver then runs
    /// over the whole collection to pick up new pairings.
    pub fn upsert_entry(&self, entry: IndexEntry) -> ResolveReport {
        let _writer = self.writer.lock().unwrap();
        let mut entries = self.entries.write().unwrap();
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                debug!(entry_id = %entry.id, "superseding index entry");
                existing.supersede(entry);
            }
            None => {
                debug!(entry_id = %entry.id, "adding index entry");
                entries.push(entry);
            }
        }
        self.resolver.resolve(&mut entries)
    }

    /// Run the relationship resolver over every entry.
    pub fn resolve(&self) -> ResolveReport {
        let _writer = self.writer.lock().unwrap();
        let mut entries = self.entries.write().unwrap();
        self.resolver.resolve(&mut entries)
    }

    /// Rebuild the tree from the current entries and records and swap it in.
    pub fn reconcile(&self) -> ReconcileSummary {
        let _writer = self.writer.lock().unwrap();
        let entries = self.entries.read().unwrap().clone();
        let records: Vec<ExamRecord> = self.records.read().unwrap().values().cloned().collect();

        let reconciliation = self.reconciler.reconcile_with_records(&entries, &records);
        let summary = ReconcileSummary::from(&reconciliation);
        for record in self.records.write().unwrap().values_mut() {
            if let Some(slot) = reconciliation.tree.locate(&record.question_paper_id) {
                record.slot = slot;
            }
        }
        *self.tree.write().unwrap() = Arc::new(reconciliation.tree);
        summary
    }

    /// Upsert an entry, reconcile and persist.
    pub fn commit_entry(&self, entry: IndexEntry) -> StorageResult<(ResolveReport, ReconcileSummary)> {
        let links = self.upsert_entry(entry);
        let summary = self.reconcile();
        self.save()?;
        Ok((links, summary))
    }

    /// Re-run pairing and reconciliation over every entry and persist.
    pub fn rebuild(&self) -> StorageResult<(ResolveReport, ReconcileSummary)> {
        let links = self.resolve();
        let summary = self.reconcile();
        self.save()?;
        Ok((links, summary))
    }

    /// Current tree. Stays valid, and unchanged, across later reconciliations.
    pub fn snapshot(&self) -> Arc<HierarchicalTree> {
        Arc::clone(&self.tree.read().unwrap())
    }

    /// Slot of a document in the current tree
    pub fn locate(&self, document_id: &str) -> Option<UnitSlot> {
        self.snapshot().locate(document_id)
    }

    /// Store the questions aligned for a document pair and persist them.
    ///
    /// The tree picks them up at the next `reconcile`, under whatever slot
    /// the question paper occupies then.
    pub fn record_exam(&self, record: ExamRecord) -> StorageResult<()> {
        self.persistence.save_exam_record(&record)?;
        self.records.write().unwrap().insert(record.key(), record);
        Ok(())
    }

    /// Record whose question paper sat in `slot` at the last reconciliation
    pub fn exam_record(&self, slot: &UnitSlot) -> Option<ExamRecord> {
        self.records.read().unwrap().values().find(|r| &r.slot == slot).cloned()
    }

    pub fn exam_records(&self) -> Vec<ExamRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }

    /// Write entries and the current tree.
    pub fn save(&self) -> StorageResult<()> {
        let _writer = self.writer.lock().unwrap();
        let entries = self.entries.read().unwrap().clone();
        self.persistence.save_entries(&entries)?;
        self.persistence.save_tree(&self.snapshot())?;
        debug!(entries = entries.len(), "saved index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentType, Question};
    use crate::storage::{OpenStore, SqliteStore};

    fn store() -> IndexStore {
        IndexStore::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    fn qp(id: &str) -> IndexEntry {
        IndexEntry::new(id, DocumentType::QuestionPaper, 2023, "GCSE", "Computer Science").with_unit("2")
    }

    fn ms(id: &str) -> IndexEntry {
        IndexEntry::new(id, DocumentType::MarkScheme, 2023, "GCSE", "Computer Science")
    }

    #[test]
    fn upsert_links_and_supersede_keeps_links() {
        let store = store();
        store.upsert_entry(qp("s23-2500u20-1a"));
        let report = store.upsert_entry(ms("s23-2500u20-1-ms"));
        assert_eq!(report.links.len(), 1);

        store.upsert_entry(qp("s23-2500u20-1a").with_season("Summer"));
        let entry = store.entry("s23-2500u20-1a").unwrap();
        assert_eq!(entry.exam_season, "Summer");
        assert!(entry.related_documents.contains("s23-2500u20-1-ms"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn readers_keep_their_snapshot_across_reconcile() {
        let store = store();
        let before = store.snapshot();
        store.upsert_entry(qp("s23-2500u20-1a"));
        let summary = store.reconcile();

        assert_eq!(summary.units, 1);
        assert_eq!(before.unit_count(), 0);
        assert_eq!(store.snapshot().unit_count(), 1);
    }

    #[test]
    fn records_attach_on_reconcile_and_survive_reload() {
        let persistence: Arc<dyn IndexPersistence> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = IndexStore::new(Arc::clone(&persistence));
        store.upsert_entry(qp("s23-2500u20-1a"));
        store.upsert_entry(ms("s23-2500u20-1-ms"));
        store.reconcile();

        let slot = store.locate("s23-2500u20-1a").unwrap();
        store
            .record_exam(ExamRecord {
                slot: slot.clone(),
                question_paper_id: "s23-2500u20-1a".into(),
                mark_scheme_id: "s23-2500u20-1-ms".into(),
                questions: vec![Question::leaf("1", "Q", "A", 2, ["AO1"])],
            })
            .unwrap();
        assert!(store.snapshot().get(&slot).unwrap().questions.is_none());
        store.reconcile();
        assert_eq!(store.snapshot().get(&slot).unwrap().questions.as_ref().unwrap().len(), 1);
        store.save().unwrap();

        let reloaded = IndexStore::load(persistence).unwrap();
        assert_eq!(reloaded.entries(), store.entries());
        assert_eq!(*reloaded.snapshot(), *store.snapshot());
        assert!(reloaded.exam_record(&slot).is_some());
    }
}
