//! Folding flat entries into the hierarchical tree
//!
//! `reconcile` is a pure function of its inputs: entries are visited in id
//! order, every map is ordered, and nothing time-based is recorded. The
//! same entries always give the same tree, whatever order they came in.
//!
//! Unit placement: each entry gets its own derived unit first. A linked
//! partner whose unit came from metadata then overrides a pattern-derived
//! or missing unit, so a pair lands in one slot. Disagreements that
//! precedence cannot settle are logged and both entries keep their own
//! placement.

use super::tree::{DocumentRef, ExamRecord, HierarchicalTree, UnitNode};
use super::unit::{derive_unit, UnitDerivation, UnitSource};
use crate::model::{DocumentType, IndexEntry, UnitSlot, UNASSIGNED_UNIT};
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Two linked entries disagreed about their unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitConflict {
    pub entry_id: String,
    pub partner_id: String,
    pub entry_unit: String,
    pub entry_source: UnitSource,
    pub partner_unit: String,
    pub partner_source: UnitSource,
    /// Unit the entry was placed under
    pub placed_unit: String,
    /// False when both sides had equal standing and kept their own units
    pub resolved: bool,
}

/// Entry placed in the `unassigned` bucket for manual follow-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousUnit {
    pub entry_id: String,
    pub slot: UnitSlot,
}

/// Documents in one unit disagreed about a unit-level value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataConflict {
    pub slot: UnitSlot,
    pub field: &'static str,
    pub kept: String,
    pub ignored: String,
    pub from_document: String,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub tree: HierarchicalTree,
    pub unit_conflicts: Vec<UnitConflict>,
    pub ambiguous: Vec<AmbiguousUnit>,
    pub metadata_conflicts: Vec<MetadataConflict>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchicalIndexReconciler;

impl HierarchicalIndexReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Build the tree from entries alone.
    pub fn reconcile(&self, entries: &[IndexEntry]) -> Reconciliation {
        self.reconcile_with_records(entries, &[])
    }

    /// Build the tree and attach the questions of each exam record to its slot.
    pub fn reconcile_with_records(&self, entries: &[IndexEntry], records: &[ExamRecord]) -> Reconciliation {
        let mut sorted: Vec<&IndexEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| duplicate_rank(a).cmp(&duplicate_rank(b))));
        sorted.dedup_by(|b, a| {
            let duplicate = a.id == b.id;
            if duplicate {
                warn!(entry_id = %a.id, kept = %a.content_path, dropped = %b.content_path, "duplicate entry id");
            }
            duplicate
        });

        let mut reconciliation = Reconciliation::default();
        let placements = place_units(&sorted, &mut reconciliation.unit_conflicts);

        let mut tree = HierarchicalTree::new();
        for (entry, unit) in sorted.iter().zip(&placements) {
            let slot = UnitSlot::new(
                entry.subject.clone(),
                entry.year,
                entry.qualification.clone(),
                unit.clone(),
            );
            if slot.is_unassigned() {
                warn!(entry_id = %entry.id, slot = %slot, "unit could not be determined; placed in unassigned bucket");
                reconciliation.ambiguous.push(AmbiguousUnit {
                    entry_id: entry.id.clone(),
                    slot: slot.clone(),
                });
            }
            tree.upsert(&slot)
                .documents
                .entry(entry.doc_type)
                .or_default()
                .push(DocumentRef::from_entry(entry));
        }

        let slots: Vec<UnitSlot> = tree.units().map(|(slot, _)| slot).collect();
        for slot in slots {
            if let Some(node) = tree.get_mut(&slot) {
                merge_unit_metadata(&slot, node, &mut reconciliation.metadata_conflicts);
            }
        }

        for record in records {
            let Some(slot) = tree.locate(&record.question_paper_id) else {
                warn!(
                    question_paper = %record.question_paper_id,
                    mark_scheme = %record.mark_scheme_id,
                    "exam record's question paper is not in the index; not attached"
                );
                continue;
            };
            if slot != record.slot {
                debug!(question_paper = %record.question_paper_id, from = %record.slot, to = %slot, "exam record follows its question paper");
            }
            if let Some(node) = tree.get_mut(&slot) {
                if node.questions.is_some() {
                    warn!(slot = %slot, mark_scheme = %record.mark_scheme_id, "unit already has aligned questions; keeping the later record");
                }
                node.questions = Some(record.questions.clone());
            }
        }

        debug!(
            units = tree.unit_count(),
            documents = tree.document_count(),
            "reconciled hierarchical index"
        );
        reconciliation.tree = tree;
        reconciliation
    }
}

/// Ordering among entries sharing an id: the most complete metadata first,
/// then every remaining field, so the survivor never depends on arrival order.
fn duplicate_rank(entry: &IndexEntry) -> impl Ord + '_ {
    let completeness = [
        entry.unit_number.is_some(),
        entry.exam_paper.is_some(),
        entry.exam_length.is_some(),
        entry.total_marks.is_some(),
        !entry.exam_season.trim().is_empty(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    (
        Reverse(completeness),
        (&entry.content_path, &entry.metadata_path),
        (entry.doc_type, entry.year, &entry.qualification, &entry.subject),
        (&entry.unit_number, &entry.exam_paper, &entry.exam_length, entry.total_marks),
        (&entry.exam_season, &entry.related_documents),
    )
}

/// Final unit for each entry, index-aligned with `entries`.
fn place_units(entries: &[&IndexEntry], conflicts: &mut Vec<UnitConflict>) -> Vec<String> {
    let derived: Vec<UnitDerivation> = entries.iter().map(|e| derive_unit(e)).collect();
    let by_id: HashMap<String, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.to_lowercase(), i))
        .collect();

    let mut placed: Vec<String> = derived.iter().map(|d| d.unit.clone()).collect();
    for (i, entry) in entries.iter().enumerate() {
        let own = &derived[i];
        let partners = entry
            .related_documents
            .iter()
            .filter_map(|id| by_id.get(&id.to_lowercase()).copied())
            .filter(|&j| j != i && entries[j].doc_type == entry.doc_type.counterpart());

        for j in partners {
            let partner = &derived[j];
            if partner.unit == own.unit || !partner.is_assigned() {
                continue;
            }
            let partner_wins = !own.is_assigned()
                || (partner.source.is_explicit() && !own.source.is_explicit());
            let own_wins = !partner.is_assigned()
                || (own.source.is_explicit() && !partner.source.is_explicit());

            if partner_wins {
                placed[i] = partner.unit.clone();
            }
            if own.is_assigned() && (partner_wins || (!own_wins && entry.id < entries[j].id)) {
                let conflict = UnitConflict {
                    entry_id: entry.id.clone(),
                    partner_id: entries[j].id.clone(),
                    entry_unit: own.unit.clone(),
                    entry_source: own.source,
                    partner_unit: partner.unit.clone(),
                    partner_source: partner.source,
                    placed_unit: placed[i].clone(),
                    resolved: partner_wins,
                };
                if conflict.resolved {
                    warn!(
                        entry_id = %conflict.entry_id,
                        partner_id = %conflict.partner_id,
                        derived = %conflict.entry_unit,
                        explicit = %conflict.partner_unit,
                        "unit conflict resolved in favour of metadata"
                    );
                } else {
                    warn!(
                        entry_id = %conflict.entry_id,
                        partner_id = %conflict.partner_id,
                        entry_unit = %conflict.entry_unit,
                        partner_unit = %conflict.partner_unit,
                        "unresolved unit conflict; both documents keep their own unit"
                    );
                }
                conflicts.push(conflict);
            }
            if partner_wins {
                break;
            }
        }
    }
    placed
}

/// Unit name, exam length and total marks from the unit's documents.
///
/// Question papers are consulted first, then mark schemes, each in id
/// order; the first value found is kept.
fn merge_unit_metadata(slot: &UnitSlot, node: &mut UnitNode, conflicts: &mut Vec<MetadataConflict>) {
    let ordered: Vec<DocumentRef> = [DocumentType::QuestionPaper, DocumentType::MarkScheme]
        .iter()
        .flat_map(|t| node.documents_of(*t).iter().cloned())
        .collect();

    let title = ordered.iter().find_map(|d| d.exam_paper.clone().filter(|t| !t.trim().is_empty()));
    node.unit_name = match title {
        Some(title) => title,
        None if slot.unit == UNASSIGNED_UNIT => "Unassigned".to_string(),
        None => format!("Unit {}", slot.unit),
    };

    node.exam_length = first_consistent(slot, "exam_length", &ordered, |d| d.exam_length.clone(), conflicts);
    node.total_marks = first_consistent(slot, "total_marks", &ordered, |d| d.total_marks, conflicts);
}

fn first_consistent<T>(
    slot: &UnitSlot,
    field: &'static str,
    documents: &[DocumentRef],
    value: impl Fn(&DocumentRef) -> Option<T>,
    conflicts: &mut Vec<MetadataConflict>,
) -> Option<T>
where
    T: PartialEq + ToString,
{
    let mut kept: Option<T> = None;
    for doc in documents {
        let Some(v) = value(doc) else { continue };
        match &kept {
            None => kept = Some(v),
            Some(k) if *k != v => {
                warn!(slot = %slot, field, kept = %k.to_string(), ignored = %v.to_string(), document = %doc.id, "unit metadata conflict");
                conflicts.push(MetadataConflict {
                    slot: slot.clone(),
                    field,
                    kept: k.to_string(),
                    ignored: v.to_string(),
                    from_document: doc.id.clone(),
                });
            }
            Some(_) => {}
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tree::reconcile_to_entries;
    use crate::model::Question;

    fn entry(id: &str, doc_type: DocumentType) -> IndexEntry {
        IndexEntry::new(id, doc_type, 2023, "GCSE", "Computer Science")
    }

    fn linked(mut qp: IndexEntry, mut ms: IndexEntry) -> Vec<IndexEntry> {
        qp.related_documents.insert(ms.id.clone());
        ms.related_documents.insert(qp.id.clone());
        vec![qp, ms]
    }

    #[test]
    fn title_unit_is_used_when_metadata_is_missing() {
        let e = entry("cs-paper", DocumentType::QuestionPaper).with_exam_paper("Unit 3: Programming");
        let result = HierarchicalIndexReconciler::new().reconcile(&[e]);
        let slot = UnitSlot::new("Computer Science", 2023, "GCSE", "3");
        let node = result.tree.get(&slot).unwrap();
        assert_eq!(node.unit_name, "Unit 3: Programming");
        assert!(result.ambiguous.is_empty());
    }

    #[test]
    fn undeterminable_unit_goes_to_unassigned() {
        let e = entry("mystery", DocumentType::MarkScheme);
        let result = HierarchicalIndexReconciler::new().reconcile(&[e]);
        let slot = UnitSlot::new("Computer Science", 2023, "GCSE", UNASSIGNED_UNIT);
        assert_eq!(result.tree.get(&slot).unwrap().unit_name, "Unassigned");
        assert_eq!(result.ambiguous.len(), 1);
    }

    #[test]
    fn explicit_unit_wins_over_derived_partner() {
        let entries = linked(
            entry("s23-3500u30-1", DocumentType::QuestionPaper).with_unit("2"),
            entry("s23-3500u30-1-ms", DocumentType::MarkScheme),
        );
        let result = HierarchicalIndexReconciler::new().reconcile(&entries);

        let slot = UnitSlot::new("Computer Science", 2023, "GCSE", "2");
        let node = result.tree.get(&slot).unwrap();
        assert_eq!(node.documents_of(DocumentType::MarkScheme)[0].id, "s23-3500u30-1-ms");
        assert!(result.tree.get(&UnitSlot::new("Computer Science", 2023, "GCSE", "3")).is_none());

        assert_eq!(result.unit_conflicts.len(), 1);
        let conflict = &result.unit_conflicts[0];
        assert!(conflict.resolved);
        assert_eq!(conflict.entry_id, "s23-3500u30-1-ms");
        assert_eq!((conflict.entry_unit.as_str(), conflict.placed_unit.as_str()), ("3", "2"));
    }

    #[test]
    fn equal_standing_conflict_is_logged_once_and_not_overwritten() {
        let entries = linked(
            entry("qp", DocumentType::QuestionPaper).with_unit("1"),
            entry("ms", DocumentType::MarkScheme).with_unit("4"),
        );
        let result = HierarchicalIndexReconciler::new().reconcile(&entries);
        assert_eq!(result.unit_conflicts.len(), 1);
        assert!(!result.unit_conflicts[0].resolved);
        assert!(result.tree.get(&UnitSlot::new("Computer Science", 2023, "GCSE", "1")).is_some());
        assert!(result.tree.get(&UnitSlot::new("Computer Science", 2023, "GCSE", "4")).is_some());
    }

    #[test]
    fn metadata_prefers_question_paper_and_logs_disagreement() {
        let mut qp = entry("b-qp", DocumentType::QuestionPaper).with_unit("1");
        qp.exam_length = Some("1 hour 30 minutes".into());
        qp.total_marks = Some(80);
        let mut ms = entry("a-ms", DocumentType::MarkScheme).with_unit("1");
        ms.total_marks = Some(75);

        let result = HierarchicalIndexReconciler::new().reconcile(&[ms, qp]);
        let node = result.tree.get(&UnitSlot::new("Computer Science", 2023, "GCSE", "1")).unwrap();
        assert_eq!(node.unit_name, "Unit 1");
        assert_eq!(node.total_marks, Some(80));
        assert_eq!(node.exam_length.as_deref(), Some("1 hour 30 minutes"));
        assert_eq!(result.metadata_conflicts.len(), 1);
        assert_eq!(result.metadata_conflicts[0].field, "total_marks");
    }

    #[test]
    fn records_attach_questions_to_their_slot() {
        let entries = linked(
            entry("s23-3500u20-1", DocumentType::QuestionPaper).with_unit("2"),
            entry("s23-3500u20-1-ms", DocumentType::MarkScheme).with_unit("2"),
        );
        let slot = UnitSlot::new("Computer Science", 2023, "GCSE", "2");
        let record = ExamRecord {
            slot: slot.clone(),
            question_paper_id: "s23-3500u20-1".into(),
            mark_scheme_id: "s23-3500u20-1-ms".into(),
            questions: vec![Question::leaf("1", "Q", "A", 1, ["AO1"])],
        };
        let result = HierarchicalIndexReconciler::new().reconcile_with_records(&entries, &[record]);
        assert_eq!(result.tree.get(&slot).unwrap().questions.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_ids_keep_the_most_complete_entry_in_any_order() {
        let sparse = entry("s23-3500u20-1", DocumentType::QuestionPaper).with_paths("b/ocr.json", "b/meta.json");
        let full = entry("s23-3500u20-1", DocumentType::QuestionPaper)
            .with_unit("4")
            .with_exam_paper("Unit 4: Networks")
            .with_paths("a/ocr.json", "a/meta.json");
        let twin = full.clone().with_paths("c/ocr.json", "c/meta.json");

        let reconciler = HierarchicalIndexReconciler::new();
        let forward = reconciler.reconcile(&[sparse.clone(), full.clone(), twin.clone()]).tree;
        let backward = reconciler.reconcile(&[twin, full, sparse]).tree;
        assert_eq!(forward, backward);

        let slot = UnitSlot::new("Computer Science", 2023, "GCSE", "4");
        let kept = forward.get(&slot).unwrap().documents_of(DocumentType::QuestionPaper);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content_path, "a/ocr.json");
        assert_eq!(forward.document_count(), 1);
    }

    #[test]
    fn records_follow_their_question_paper_not_their_stored_slot() {
        let entries = linked(
            entry("s23-3500u20-1", DocumentType::QuestionPaper).with_unit("2"),
            entry("s23-3500u20-1-ms", DocumentType::MarkScheme),
        );
        let stale = UnitSlot::new("Computer Science", 2023, "GCSE", UNASSIGNED_UNIT);
        let record = ExamRecord {
            slot: stale.clone(),
            question_paper_id: "s23-3500u20-1".into(),
            mark_scheme_id: "s23-3500u20-1-ms".into(),
            questions: vec![Question::leaf("1", "Q", "A", 1, ["AO1"])],
        };
        let orphan = ExamRecord {
            question_paper_id: "gone".into(),
            ..record.clone()
        };
        let result = HierarchicalIndexReconciler::new().reconcile_with_records(&entries, &[record, orphan]);

        let slot = UnitSlot::new("Computer Science", 2023, "GCSE", "2");
        assert_eq!(result.tree.get(&slot).unwrap().questions.as_ref().unwrap().len(), 1);
        assert!(result.tree.get(&stale).is_none());
        assert_eq!(result.tree.unit_count(), 1);
    }

    #[test]
    fn reconcile_after_flatten_gives_the_same_tree() {
        let mut entries = linked(
            entry("s23-3500u30-1", DocumentType::QuestionPaper).with_unit("2"),
            entry("s23-3500u30-1-ms", DocumentType::MarkScheme),
        );
        entries.push(entry("orphan", DocumentType::QuestionPaper));
        entries.push(entry("w22-1500u10-1", DocumentType::QuestionPaper).with_exam_paper("Unit 1: Fundamentals"));

        let reconciler = HierarchicalIndexReconciler::new();
        let first = reconciler.reconcile(&entries).tree;
        let second = reconciler.reconcile(&reconcile_to_entries(&first)).tree;
        assert_eq!(first, second);
    }
}
