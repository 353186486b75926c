//! Read-side queries over the index

use super::resolver::partners_by_question_paper;
use super::store::IndexStore;
use super::tree::HierarchicalTree;
use super::unit::derive_unit;
use crate::model::{normalize_unit_number, DocumentType, IndexEntry, UnitSlot};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Criteria for `IndexSearcher::search`. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub subject: Option<String>,
    pub year: Option<i32>,
    pub qualification: Option<String>,
    pub unit: Option<String>,
    pub doc_type: Option<DocumentType>,
    /// Case-insensitive substring of the id or exam paper title
    pub text: Option<String>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_qualification(mut self, qualification: impl Into<String>) -> Self {
        self.qualification = Some(qualification.into());
        self
    }

    pub fn with_unit(mut self, unit: impl AsRef<str>) -> Self {
        self.unit = normalize_unit_number(unit.as_ref());
        self
    }

    pub fn with_type(mut self, doc_type: DocumentType) -> Self {
        self.doc_type = Some(doc_type);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    fn matches(&self, entry: &IndexEntry) -> bool {
        let eq = |want: &Option<String>, have: &str| {
            want.as_ref().map_or(true, |w| w.eq_ignore_ascii_case(have))
        };
        if !eq(&self.subject, &entry.subject) || !eq(&self.qualification, &entry.qualification) {
            return false;
        }
        if self.year.is_some_and(|y| y != entry.year) {
            return false;
        }
        if self.doc_type.is_some_and(|t| t != entry.doc_type) {
            return false;
        }
        if let Some(unit) = &self.unit {
            if derive_unit(entry).unit != *unit {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let in_id = entry.id.to_lowercase().contains(&needle);
            let in_title = entry
                .exam_paper
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains(&needle));
            if !in_id && !in_title {
                return false;
            }
        }
        true
    }
}

/// A question paper and the mark scheme it is aligned against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamPair {
    pub slot: UnitSlot,
    pub question_paper: IndexEntry,
    pub mark_scheme: IndexEntry,
}

/// Queries against a fixed view of the index: the entries and tree
/// captured when the searcher was built.
pub struct IndexSearcher {
    entries: Vec<IndexEntry>,
    tree: Arc<HierarchicalTree>,
}

impl IndexSearcher {
    pub fn new(entries: Vec<IndexEntry>, tree: Arc<HierarchicalTree>) -> Self {
        Self { entries, tree }
    }

    pub fn from_store(store: &IndexStore) -> Self {
        Self::new(store.entries(), store.snapshot())
    }

    /// Matching entries in id order
    pub fn search(&self, query: &SearchQuery) -> Vec<&IndexEntry> {
        let mut hits: Vec<&IndexEntry> = self.entries.iter().filter(|e| query.matches(e)).collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    pub fn find_document(&self, id: &str) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .or_else(|| self.entries.iter().find(|e| e.id.eq_ignore_ascii_case(id)))
    }

    /// Entries linked to `id`; links to ids not in the index are skipped.
    pub fn find_related(&self, id: &str) -> Vec<&IndexEntry> {
        let Some(entry) = self.find_document(id) else {
            return Vec::new();
        };
        entry
            .related_documents
            .iter()
            .filter_map(|rid| self.find_document(rid))
            .collect()
    }

    pub fn locate_slot(&self, document_id: &str) -> Option<UnitSlot> {
        let id = self.find_document(document_id).map_or(document_id, |e| e.id.as_str());
        self.tree.locate(id)
    }

    pub fn tree(&self) -> &HierarchicalTree {
        &self.tree
    }

    /// One (question paper, mark scheme) pair per unit slot.
    ///
    /// A resolver-linked pair is preferred; otherwise the first question
    /// paper and first mark scheme of the slot are paired. Slots lacking
    /// either type, and the unassigned bucket, are left out.
    pub fn exam_pairs(&self) -> Vec<ExamPair> {
        let by_id: HashMap<&str, &IndexEntry> = self.entries.iter().map(|e| (e.id.as_str(), e)).collect();
        let partners = partners_by_question_paper(&self.entries);
        let mut pairs: BTreeMap<UnitSlot, ExamPair> = BTreeMap::new();

        for (slot, node) in self.tree.units() {
            if slot.is_unassigned() {
                continue;
            }
            let papers = node.documents_of(DocumentType::QuestionPaper);
            let schemes = node.documents_of(DocumentType::MarkScheme);

            let linked = papers.iter().find_map(|p| {
                partners
                    .get(&p.id)?
                    .iter()
                    .find(|m| schemes.iter().any(|s| &s.id == *m))
                    .map(|m| (p.id.as_str(), m.as_str()))
            });
            let chosen = linked.or_else(|| Some((papers.first()?.id.as_str(), schemes.first()?.id.as_str())));

            if let Some((qp, ms)) = chosen {
                if let (Some(qp), Some(ms)) = (by_id.get(qp), by_id.get(ms)) {
                    pairs.insert(
                        slot.clone(),
                        ExamPair {
                            slot,
                            question_paper: (*qp).clone(),
                            mark_scheme: (*ms).clone(),
                        },
                    );
                }
            }
        }
        pairs.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{HierarchicalIndexReconciler, RelationshipResolver};

    fn searcher() -> IndexSearcher {
        let mut entries = vec![
            IndexEntry::new("s23-2500u20-1a", DocumentType::QuestionPaper, 2023, "GCSE", "Computer Science")
                .with_exam_paper("Unit 2: Computational Thinking"),
            IndexEntry::new("s23-2500u20-1-ms", DocumentType::MarkScheme, 2023, "GCSE", "Computer Science"),
            IndexEntry::new("s22-1500u30-1", DocumentType::QuestionPaper, 2022, "GCE A Level", "Computer Science")
                .with_unit("3"),
            IndexEntry::new("w22-9999-1", DocumentType::MarkScheme, 2022, "GCSE", "Physics"),
        ];
        RelationshipResolver::new().resolve(&mut entries);
        let tree = HierarchicalIndexReconciler::new().reconcile(&entries).tree;
        IndexSearcher::new(entries, Arc::new(tree))
    }

    #[test]
    fn search_filters_combine() {
        let s = searcher();
        let ids = |q: SearchQuery| s.search(&q).iter().map(|e| e.id.clone()).collect::<Vec<_>>();

        assert_eq!(ids(SearchQuery::new().with_subject("computer science").with_year(2023)).len(), 2);
        assert_eq!(ids(SearchQuery::new().with_unit("Unit 3")), vec!["s22-1500u30-1"]);
        assert_eq!(
            ids(SearchQuery::new().with_type(DocumentType::MarkScheme).with_subject("Physics")),
            vec!["w22-9999-1"]
        );
        assert_eq!(ids(SearchQuery::new().with_text("computational")), vec!["s23-2500u20-1a"]);
    }

    #[test]
    fn related_and_slot_lookups() {
        let s = searcher();
        let related = s.find_related("s23-2500u20-1a");
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, "s23-2500u20-1-ms");
        assert!(s.find_related("missing").is_empty());

        let slot = s.locate_slot("S23-2500U20-1-MS").unwrap();
        assert_eq!(slot, UnitSlot::new("Computer Science", 2023, "GCSE", "2"));
    }

    #[test]
    fn exam_pairs_skip_incomplete_slots() {
        let pairs = searcher().exam_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].question_paper.id, "s23-2500u20-1a");
        assert_eq!(pairs[0].mark_scheme.id, "s23-2500u20-1-ms");
    }
}
