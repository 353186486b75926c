//! Hierarchical index: subject → year → qualification → unit
//!
//! Serializes to the nested layout consumers read directly:
//!
//! ```json
//! {"Computer Science": {"2023": {"GCSE": {"2": {
//!     "unit_name": "Unit 2: Computer Science",
//!     "exam_length": "2 hours", "total_marks": 100,
//!     "documents": {"Question Paper": [...], "Mark Scheme": [...]},
//!     "questions": [...]}}}}}
//! ```

use crate::model::{DocumentType, IndexEntry, Question, UnitSlot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type UnitMap = BTreeMap<String, UnitNode>;
pub type QualificationMap = BTreeMap<String, UnitMap>;
pub type YearMap = BTreeMap<String, QualificationMap>;

/// Document as listed under a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub content_path: String,
    pub metadata_path: String,
    #[serde(default)]
    pub exam_season: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_paper: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_length: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_marks: Option<u32>,
    #[serde(default)]
    pub related_documents: Vec<String>,
}

impl DocumentRef {
    pub fn from_entry(entry: &IndexEntry) -> Self {
        Self {
            id: entry.id.clone(),
            content_path: entry.content_path.clone(),
            metadata_path: entry.metadata_path.clone(),
            exam_season: entry.exam_season.clone(),
            exam_paper: entry.exam_paper.clone(),
            exam_length: entry.exam_length.clone(),
            total_marks: entry.total_marks,
            related_documents: entry.related_documents.iter().cloned().collect(),
        }
    }
}

/// Leaf of the tree: one exam unit sitting.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitNode {
    pub unit_name: String,
    #[serde(default)]
    pub exam_length: Option<String>,
    #[serde(default)]
    pub total_marks: Option<u32>,
    #[serde(default)]
    pub documents: BTreeMap<DocumentType, Vec<DocumentRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<Question>>,
}

impl UnitNode {
    pub fn documents_of(&self, doc_type: DocumentType) -> &[DocumentRef] {
        self.documents.get(&doc_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All documents, question papers first
    pub fn all_documents(&self) -> impl Iterator<Item = (DocumentType, &DocumentRef)> {
        self.documents
            .iter()
            .flat_map(|(doc_type, docs)| docs.iter().map(move |d| (*doc_type, d)))
    }
}

/// The reconciled tree. Rebuilt from entries, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HierarchicalTree {
    pub subjects: BTreeMap<String, YearMap>,
}

impl HierarchicalTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: &UnitSlot) -> Option<&UnitNode> {
        self.subjects
            .get(&slot.subject)?
            .get(&slot.year)?
            .get(&slot.qualification)?
            .get(&slot.unit)
    }

    pub fn get_mut(&mut self, slot: &UnitSlot) -> Option<&mut UnitNode> {
        self.subjects
            .get_mut(&slot.subject)?
            .get_mut(&slot.year)?
            .get_mut(&slot.qualification)?
            .get_mut(&slot.unit)
    }

    /// Node for `slot`, creating every missing level on the way.
    pub fn upsert(&mut self, slot: &UnitSlot) -> &mut UnitNode {
        self.subjects
            .entry(slot.subject.clone())
            .or_default()
            .entry(slot.year.clone())
            .or_default()
            .entry(slot.qualification.clone())
            .or_default()
            .entry(slot.unit.clone())
            .or_default()
    }

    /// Every unit node with its slot, in key order
    pub fn units(&self) -> impl Iterator<Item = (UnitSlot, &UnitNode)> {
        self.subjects.iter().flat_map(|(subject, years)| {
            years.iter().flat_map(move |(year, quals)| {
                quals.iter().flat_map(move |(qualification, units)| {
                    units.iter().map(move |(unit, node)| {
                        (UnitSlot::new(subject.clone(), year.clone(), qualification.clone(), unit.clone()), node)
                    })
                })
            })
        })
    }

    /// Slot holding the given document id
    pub fn locate(&self, document_id: &str) -> Option<UnitSlot> {
        self.units()
            .find(|(_, node)| node.all_documents().any(|(_, d)| d.id == document_id))
            .map(|(slot, _)| slot)
    }

    pub fn unit_count(&self) -> usize {
        self.units().count()
    }

    pub fn document_count(&self) -> usize {
        self.units().map(|(_, n)| n.all_documents().count()).sum()
    }
}

/// Aligned questions for one document pair, the persisted output of an alignment.
///
/// A record belongs to its pair, not to a slot: reconciliation attaches it
/// wherever the question paper currently sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamRecord {
    /// Slot the question paper was in when the record was last placed
    pub slot: UnitSlot,
    pub question_paper_id: String,
    pub mark_scheme_id: String,
    pub questions: Vec<Question>,
}

impl ExamRecord {
    /// Storage key: the aligned document pair
    pub fn key(&self) -> String {
        format!("{}|{}", self.question_paper_id, self.mark_scheme_id)
    }

    pub fn total_marks(&self) -> u32 {
        self.questions.iter().map(Question::max_marks).sum()
    }
}

/// Flatten a tree back into the entries it was built from.
///
/// The unit slot becomes the entry's unit number; the `unassigned` bucket
/// becomes `None`.
pub fn reconcile_to_entries(tree: &HierarchicalTree) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    for (slot, node) in tree.units() {
        let year = slot.year.parse().unwrap_or_default();
        for (doc_type, doc) in node.all_documents() {
            entries.push(IndexEntry {
                id: doc.id.clone(),
                doc_type,
                year,
                qualification: slot.qualification.clone(),
                subject: slot.subject.clone(),
                unit_number: (!slot.is_unassigned()).then(|| slot.unit.clone()),
                exam_paper: doc.exam_paper.clone(),
                exam_season: doc.exam_season.clone(),
                exam_length: doc.exam_length.clone(),
                total_marks: doc.total_marks,
                content_path: doc.content_path.clone(),
                metadata_path: doc.metadata_path.clone(),
                related_documents: doc.related_documents.iter().cloned().collect::<BTreeSet<_>>(),
            });
        }
    }
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_levels_and_serializes_nested() {
        let mut tree = HierarchicalTree::new();
        let slot = UnitSlot::new("Computer Science", 2023, "GCSE", "2");
        let entry = IndexEntry::new("s23-3500u20-1", DocumentType::QuestionPaper, 2023, "GCSE", "Computer Science");
        let node = tree.upsert(&slot);
        node.unit_name = "Unit 2".into();
        node.documents
            .entry(DocumentType::QuestionPaper)
            .or_default()
            .push(DocumentRef::from_entry(&entry));

        let json = serde_json::to_value(&tree).unwrap();
        let unit = &json["Computer Science"]["2023"]["GCSE"]["2"];
        assert_eq!(unit["unit_name"], "Unit 2");
        assert_eq!(unit["documents"]["Question Paper"][0]["id"], "s23-3500u20-1");
        assert!(unit.get("questions").is_none());

        let back: HierarchicalTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
        assert_eq!(tree.locate("s23-3500u20-1"), Some(slot));
    }
}
