//! Accumulating question trees across alignment windows
//!
//! Each window yields whole or partial question subtrees. The accumulator
//! places every incoming node by its number: `1a(i)` goes under `1a`, which
//! goes under `1`, creating empty-stem ancestors on first sight. A number
//! seen again is merged into the existing node; differing values are
//! resolved last-wins and recorded as `MergeConflict`s.
//!
//! Half-seen leaves (text without mark scheme, or the reverse) wait in a
//! pending buffer keyed by number and only enter the tree once completed.

use super::assembler::{DropReason, QuestionFragment};
use crate::model::{parent_number, Question, QuestionKind};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Two windows disagreed about a question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub number: String,
    pub field: &'static str,
    pub previous: String,
    pub current: String,
}

/// A question still half-seen when both documents were exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteAlignment {
    pub number: String,
    pub missing: DropReason,
    pub fragment: QuestionFragment,
}

#[derive(Debug, Default)]
pub struct QuestionAccumulator {
    roots: Vec<Question>,
    pending: BTreeMap<String, QuestionFragment>,
    conflicts: Vec<MergeConflict>,
}

impl QuestionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a node with this number is already in the tree
    fn contains(&self, number: &str) -> bool {
        self.roots.iter().any(|r| r.find(number).is_some())
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn conflicts(&self) -> &[MergeConflict] {
        &self.conflicts
    }

    /// Add a complete question subtree seen on `source_page`.
    pub fn insert(&mut self, mut question: Question, source_page: usize) {
        stamp_source_page(&mut question, source_page);
        for number in question.question_numbers() {
            if self.pending.remove(&number).is_some() {
                debug!(number = %number, "pending fragment superseded by complete question");
            }
        }

        let mut chain = Vec::new();
        let mut cursor = parent_number(&question.number);
        while let Some(ancestor) = cursor {
            cursor = parent_number(&ancestor);
            chain.push(ancestor);
        }
        chain.reverse();

        let Some((top, rest)) = chain.split_first() else {
            match self.roots.iter_mut().find(|r| r.number == question.number) {
                Some(existing) => merge_into(existing, question, &mut self.conflicts),
                None => self.roots.push(question),
            }
            return;
        };

        let root = match self.roots.iter().position(|r| &r.number == top) {
            Some(i) => &mut self.roots[i],
            None => {
                debug!(number = %top, "creating placeholder for unseen parent");
                self.roots
                    .push(Question::composite(top.clone(), "", Vec::new()).with_source_page(source_page));
                let last = self.roots.len() - 1;
                &mut self.roots[last]
            }
        };

        let mut node = root;
        for ancestor in rest {
            node = child_or_placeholder(node, ancestor, source_page, &mut self.conflicts);
        }
        adopt(node, question, &mut self.conflicts);
    }

    /// Hold half a leaf until its counterpart arrives.
    ///
    /// Fragments for numbers already complete in the tree are ignored.
    pub fn hold(&mut self, fragment: QuestionFragment, source_page: usize) {
        if self.contains(&fragment.number) {
            debug!(number = %fragment.number, "fragment for completed question ignored");
            return;
        }
        let number = fragment.number.clone();
        let entry = self.pending.entry(number.clone());
        let merged = match entry {
            std::collections::btree_map::Entry::Occupied(mut held) => {
                held.get_mut().absorb(fragment);
                if !held.get().is_complete() {
                    return;
                }
                held.remove()
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                if !fragment.is_complete() {
                    slot.insert(fragment);
                    return;
                }
                fragment
            }
        };
        if let Some(leaf) = merged.into_leaf() {
            debug!(number = %number, "pending fragment completed");
            self.insert(leaf, source_page);
        }
    }

    /// Finished top-level trees plus every fragment that never completed.
    pub fn finish(self) -> (Vec<Question>, Vec<IncompleteAlignment>, Vec<MergeConflict>) {
        let incomplete = self
            .pending
            .into_iter()
            .map(|(number, fragment)| {
                let missing = if fragment.question_text.trim().is_empty() {
                    DropReason::MissingText
                } else {
                    DropReason::MissingMarkScheme
                };
                warn!(number = %number, missing = %missing, "question left incomplete");
                IncompleteAlignment {
                    number,
                    missing,
                    fragment,
                }
            })
            .collect();
        (self.roots, incomplete, self.conflicts)
    }
}

fn stamp_source_page(question: &mut Question, page: usize) {
    if question.source_page.is_none() {
        question.source_page = Some(page);
    }
    if let Some(children) = question.sub_questions_mut() {
        for child in children {
            stamp_source_page(child, page);
        }
    }
}

/// Make `node` a composite, converting a leaf if needed, and return its children.
fn ensure_composite<'a>(node: &'a mut Question, conflicts: &mut Vec<MergeConflict>) -> &'a mut Vec<Question> {
    if node.is_leaf() {
        conflicts.push(MergeConflict {
            number: node.number.clone(),
            field: "structure",
            previous: "leaf".to_string(),
            current: "composite".to_string(),
        });
        warn!(number = %node.number, "leaf question gained sub-questions; converting to composite");
    }
    node.make_composite()
}

fn child_or_placeholder<'a>(
    node: &'a mut Question,
    number: &str,
    source_page: usize,
    conflicts: &mut Vec<MergeConflict>,
) -> &'a mut Question {
    let children = ensure_composite(node, conflicts);
    let index = match children.iter().position(|c| c.number == number) {
        Some(i) => i,
        None => {
            children.push(Question::composite(number, "", Vec::new()).with_source_page(source_page));
            children.len() - 1
        }
    };
    &mut children[index]
}

/// Put `question` under `parent`, merging with a same-numbered child.
fn adopt(parent: &mut Question, question: Question, conflicts: &mut Vec<MergeConflict>) {
    let children = ensure_composite(parent, conflicts);
    match children.iter_mut().position(|c| c.number == question.number) {
        Some(i) => merge_into(&mut children[i], question, conflicts),
        None => children.push(question),
    }
}

fn record(conflicts: &mut Vec<MergeConflict>, number: &str, field: &'static str, previous: String, current: String) {
    if previous != current {
        warn!(number, field, previous = %previous, current = %current, "conflicting values across windows; keeping latest");
        conflicts.push(MergeConflict {
            number: number.to_string(),
            field,
            previous,
            current,
        });
    }
}

/// Merge a newly seen node into an existing one with the same number.
fn merge_into(existing: &mut Question, incoming: Question, conflicts: &mut Vec<MergeConflict>) {
    let number = existing.number.clone();
    for image in incoming.media_refs {
        if !existing.media_refs.contains(&image) {
            existing.media_refs.push(image);
        }
    }

    if existing.is_leaf() && !matches!(incoming.kind, QuestionKind::Leaf(_)) {
        ensure_composite(existing, conflicts);
    }

    match (&mut existing.kind, incoming.kind) {
        (QuestionKind::Leaf(old), QuestionKind::Leaf(new)) => {
            record(conflicts, &number, "question_text", old.question_text.clone(), new.question_text.clone());
            record(conflicts, &number, "mark_scheme", old.mark_scheme.clone(), new.mark_scheme.clone());
            record(conflicts, &number, "max_marks", old.max_marks.to_string(), new.max_marks.to_string());
            record(
                conflicts,
                &number,
                "assessment_objectives",
                join(&old.assessment_objectives),
                join(&new.assessment_objectives),
            );
            *old = new;
        }
        (QuestionKind::Composite(old), QuestionKind::Composite(new)) => {
            merge_text(conflicts, &number, "question_text", &mut old.stem, new.stem);
            merge_text(conflicts, &number, "mark_scheme", &mut old.mark_scheme, new.mark_scheme);
            for child in new.sub_questions {
                match old.sub_questions.iter_mut().find(|c| c.number == child.number) {
                    Some(existing_child) => merge_into(existing_child, child, conflicts),
                    None => old.sub_questions.push(child),
                }
            }
        }
        // Converted to a composite above.
        (QuestionKind::Leaf(_), QuestionKind::Composite(_)) => {}
        (QuestionKind::Composite(old), QuestionKind::Leaf(new)) => {
            // Children already seen carry the marks; the leaf view only fills an empty stem.
            record(conflicts, &number, "structure", "composite".to_string(), "leaf".to_string());
            if old.stem.trim().is_empty() {
                old.stem = new.question_text;
            }
            if old.mark_scheme.trim().is_empty() {
                old.mark_scheme = new.mark_scheme;
            }
        }
    }
}

fn merge_text(conflicts: &mut Vec<MergeConflict>, number: &str, field: &'static str, old: &mut String, new: String) {
    if new.trim().is_empty() {
        return;
    }
    if !old.trim().is_empty() {
        record(conflicts, number, field, old.clone(), new.clone());
    }
    *old = new;
}

fn join(set: &std::collections::BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(number: &str, text: &str, ms: &str) -> QuestionFragment {
        QuestionFragment {
            number: number.to_string(),
            question_text: text.to_string(),
            mark_scheme: ms.to_string(),
            max_marks: None,
            assessment_objectives: Default::default(),
        }
    }

    #[test]
    fn sub_question_returned_at_top_level_goes_under_parent() {
        let mut acc = QuestionAccumulator::new();
        acc.insert(Question::leaf("1a", "A [1]", "a", 1, ["AO1"]), 0);
        acc.insert(Question::leaf("1b(i)", "B [2]", "b", 2, ["AO2"]), 1);

        let (questions, incomplete, _) = acc.finish();
        assert!(incomplete.is_empty());
        assert_eq!(questions.len(), 1);
        let q1 = &questions[0];
        assert_eq!(q1.question_numbers(), vec!["1", "1a", "1b", "1b(i)"]);
        assert_eq!(q1.max_marks(), 3);
        assert_eq!(q1.question_text(), "");
        assert_eq!(q1.find("1b(i)").unwrap().source_page, Some(1));
    }

    #[test]
    fn repeated_number_last_value_wins_and_is_logged() {
        let mut acc = QuestionAccumulator::new();
        acc.insert(Question::leaf("2", "Q [3]", "ms", 3, ["AO1"]), 0);
        acc.insert(Question::leaf("2", "Q [3]", "ms", 4, ["AO1"]), 1);

        let (questions, _, conflicts) = acc.finish();
        assert_eq!(questions[0].max_marks(), 4);
        assert_eq!(questions[0].source_page, Some(0));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "max_marks");
        assert_eq!((conflicts[0].previous.as_str(), conflicts[0].current.as_str()), ("3", "4"));
    }

    #[test]
    fn composites_merge_children_from_both_windows() {
        let mut acc = QuestionAccumulator::new();
        acc.insert(
            Question::composite("3", "Stem", vec![Question::leaf("3a", "A", "a", 1, ["AO1"])]),
            0,
        );
        acc.insert(
            Question::composite("3", "", vec![Question::leaf("3b", "B", "b", 2, ["AO1"])]),
            2,
        );
        let (questions, _, conflicts) = acc.finish();
        assert_eq!(questions[0].question_numbers(), vec!["3", "3a", "3b"]);
        assert_eq!(questions[0].question_text(), "Stem");
        assert!(conflicts.is_empty());
    }

    #[test]
    fn fragments_complete_across_windows() {
        let mut acc = QuestionAccumulator::new();
        acc.hold(fragment("4", "Describe. [6]", ""), 2);
        assert_eq!(acc.pending_count(), 1);
        assert!(!acc.contains("4"));

        acc.hold(fragment("4", "", "Level 3: AO3 detailed"), 3);
        assert_eq!(acc.pending_count(), 0);

        let (questions, incomplete, _) = acc.finish();
        assert!(incomplete.is_empty());
        let q = &questions[0];
        assert_eq!(q.max_marks(), 6);
        assert!(q.assessment_objectives().unwrap().contains("AO3"));
        assert_eq!(q.source_page, Some(3));
    }

    #[test]
    fn unfinished_fragments_are_reported() {
        let mut acc = QuestionAccumulator::new();
        acc.hold(fragment("5", "", "only the scheme"), 0);
        let (questions, incomplete, _) = acc.finish();
        assert!(questions.is_empty());
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].missing, DropReason::MissingText);
    }

    #[test]
    fn complete_question_clears_pending_fragment() {
        let mut acc = QuestionAccumulator::new();
        acc.hold(fragment("6", "Text", ""), 0);
        acc.insert(Question::leaf("6", "Text", "Scheme", 1, ["AO1"]), 1);
        assert_eq!(acc.pending_count(), 0);
        acc.hold(fragment("6", "", "Late scheme"), 2);
        let (questions, incomplete, _) = acc.finish();
        assert!(incomplete.is_empty());
        assert_eq!(questions[0].mark_scheme(), "Scheme");
    }
}
