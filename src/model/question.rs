//! Question trees
//!
//! A question is either a leaf (text, mark scheme, marks and assessment
//! objectives all known) or a composite whose marks are the sum of its
//! sub-questions. The stored JSON shape is the flat record the extractor
//! emits; it is validated into the sum type on the way in.

use super::page::ImageRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors raised when a stored question record does not form a valid tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuestionError {
    #[error("question number is empty")]
    EmptyNumber,

    #[error("question {0} has no question text")]
    MissingText(String),

    #[error("question {0} has no mark scheme")]
    MissingMarkScheme(String),
}

/// Content of a leaf question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafContent {
    pub question_text: String,
    pub mark_scheme: String,
    pub max_marks: u32,
    pub assessment_objectives: BTreeSet<String>,
}

/// Content of a composite question.
///
/// `stem` and `mark_scheme` may be empty; marks are always derived from
/// the children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeContent {
    pub stem: String,
    pub mark_scheme: String,
    pub sub_questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionKind {
    Leaf(LeafContent),
    Composite(CompositeContent),
}

/// A node in a question tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuestionRecord", into = "QuestionRecord")]
pub struct Question {
    /// Normalized question number (`1`, `1a`, `1a(i)`)
    pub number: String,
    pub kind: QuestionKind,
    /// Images associated with this node
    pub media_refs: Vec<ImageRef>,
    /// Curriculum specification references
    pub spec_tags: Vec<String>,
    /// Question paper page the node was first seen on
    pub source_page: Option<usize>,
}

impl Question {
    /// Create a leaf question
    pub fn leaf(
        number: impl Into<String>,
        question_text: impl Into<String>,
        mark_scheme: impl Into<String>,
        max_marks: u32,
        assessment_objectives: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            number: number.into(),
            kind: QuestionKind::Leaf(LeafContent {
                question_text: question_text.into(),
                mark_scheme: mark_scheme.into(),
                max_marks,
                assessment_objectives: assessment_objectives.into_iter().map(Into::into).collect(),
            }),
            media_refs: Vec::new(),
            spec_tags: Vec::new(),
            source_page: None,
        }
    }

    /// Create a composite question from its children
    pub fn composite(
        number: impl Into<String>,
        stem: impl Into<String>,
        sub_questions: Vec<Question>,
    ) -> Self {
        Self {
            number: number.into(),
            kind: QuestionKind::Composite(CompositeContent {
                stem: stem.into(),
                mark_scheme: String::new(),
                sub_questions,
            }),
            media_refs: Vec::new(),
            spec_tags: Vec::new(),
            source_page: None,
        }
    }

    /// Set the mark scheme text (a composite's general guidance, or a leaf's scheme).
    pub fn with_mark_scheme(mut self, mark_scheme: impl Into<String>) -> Self {
        match &mut self.kind {
            QuestionKind::Leaf(leaf) => leaf.mark_scheme = mark_scheme.into(),
            QuestionKind::Composite(c) => c.mark_scheme = mark_scheme.into(),
        }
        self
    }

    pub fn with_source_page(mut self, page: usize) -> Self {
        self.source_page = Some(page);
        self
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, QuestionKind::Leaf(_))
    }

    /// Question text for a leaf, stem for a composite
    pub fn question_text(&self) -> &str {
        match &self.kind {
            QuestionKind::Leaf(leaf) => &leaf.question_text,
            QuestionKind::Composite(c) => &c.stem,
        }
    }

    pub fn mark_scheme(&self) -> &str {
        match &self.kind {
            QuestionKind::Leaf(leaf) => &leaf.mark_scheme,
            QuestionKind::Composite(c) => &c.mark_scheme,
        }
    }

    /// Marks for this node; composites sum their children.
    pub fn max_marks(&self) -> u32 {
        match &self.kind {
            QuestionKind::Leaf(leaf) => leaf.max_marks,
            QuestionKind::Composite(c) => c.sub_questions.iter().map(Question::max_marks).sum(),
        }
    }

    pub fn assessment_objectives(&self) -> Option<&BTreeSet<String>> {
        match &self.kind {
            QuestionKind::Leaf(leaf) => Some(&leaf.assessment_objectives),
            QuestionKind::Composite(_) => None,
        }
    }

    pub fn sub_questions(&self) -> &[Question] {
        match &self.kind {
            QuestionKind::Leaf(_) => &[],
            QuestionKind::Composite(c) => &c.sub_questions,
        }
    }

    pub fn sub_questions_mut(&mut self) -> Option<&mut Vec<Question>> {
        match &mut self.kind {
            QuestionKind::Leaf(_) => None,
            QuestionKind::Composite(c) => Some(&mut c.sub_questions),
        }
    }

    /// Turn a leaf into a composite so it can take children.
    ///
    /// The leaf's text and mark scheme become the stem; its own marks and
    /// objectives are discarded because composite marks come from children.
    /// Returns the (possibly new) child list.
    pub fn make_composite(&mut self) -> &mut Vec<Question> {
        if let QuestionKind::Leaf(leaf) = &mut self.kind {
            let stem = std::mem::take(&mut leaf.question_text);
            let mark_scheme = std::mem::take(&mut leaf.mark_scheme);
            self.kind = QuestionKind::Composite(CompositeContent {
                stem,
                mark_scheme,
                sub_questions: Vec::new(),
            });
        }
        match &mut self.kind {
            QuestionKind::Composite(c) => &mut c.sub_questions,
            QuestionKind::Leaf(_) => unreachable!("leaf was converted above"),
        }
    }

    /// Find a node by number anywhere in this subtree
    pub fn find(&self, number: &str) -> Option<&Question> {
        if self.number == number {
            return Some(self);
        }
        self.sub_questions().iter().find_map(|q| q.find(number))
    }

    /// All question numbers in this subtree, pre-order
    pub fn question_numbers(&self) -> Vec<String> {
        let mut out = vec![self.number.clone()];
        for child in self.sub_questions() {
            out.extend(child.question_numbers());
        }
        out
    }

    /// Visit every leaf in this subtree, pre-order
    pub fn for_each_leaf_mut(&mut self, f: &mut dyn FnMut(&mut Question)) {
        if self.is_leaf() {
            f(self);
            return;
        }
        if let Some(children) = self.sub_questions_mut() {
            for child in children {
                child.for_each_leaf_mut(f);
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        match &self.kind {
            QuestionKind::Leaf(_) => 1,
            QuestionKind::Composite(c) => c.sub_questions.iter().map(Question::leaf_count).sum(),
        }
    }
}

/// Stored/wire shape of a question node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub question_number: String,
    #[serde(default)]
    pub question_text: String,
    #[serde(default)]
    pub mark_scheme: String,
    #[serde(default)]
    pub max_marks: u32,
    #[serde(default)]
    pub assessment_objectives: Vec<String>,
    #[serde(default)]
    pub sub_questions: Vec<QuestionRecord>,
    #[serde(default)]
    pub media_refs: Vec<ImageRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spec_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_page: Option<usize>,
}

impl From<Question> for QuestionRecord {
    fn from(q: Question) -> Self {
        let max_marks = q.max_marks();
        let (question_text, mark_scheme, assessment_objectives, sub_questions) = match q.kind {
            QuestionKind::Leaf(leaf) => (
                leaf.question_text,
                leaf.mark_scheme,
                leaf.assessment_objectives.into_iter().collect(),
                Vec::new(),
            ),
            QuestionKind::Composite(c) => (
                c.stem,
                c.mark_scheme,
                Vec::new(),
                c.sub_questions.into_iter().map(QuestionRecord::from).collect(),
            ),
        };
        Self {
            question_number: q.number,
            question_text,
            mark_scheme,
            max_marks,
            assessment_objectives,
            sub_questions,
            media_refs: q.media_refs,
            spec_tags: q.spec_tags,
            source_page: q.source_page,
        }
    }
}

impl TryFrom<QuestionRecord> for Question {
    type Error = QuestionError;

    fn try_from(record: QuestionRecord) -> Result<Self, Self::Error> {
        let number = normalize_number(&record.question_number);
        if number.is_empty() {
            return Err(QuestionError::EmptyNumber);
        }

        let kind = if record.sub_questions.is_empty() {
            if record.question_text.trim().is_empty() {
                return Err(QuestionError::MissingText(number));
            }
            if record.mark_scheme.trim().is_empty() {
                return Err(QuestionError::MissingMarkScheme(number));
            }
            QuestionKind::Leaf(LeafContent {
                question_text: record.question_text,
                mark_scheme: record.mark_scheme,
                max_marks: record.max_marks,
                assessment_objectives: record.assessment_objectives.into_iter().collect(),
            })
        } else {
            let sub_questions = record
                .sub_questions
                .into_iter()
                .map(Question::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            QuestionKind::Composite(CompositeContent {
                stem: record.question_text,
                mark_scheme: record.mark_scheme,
                sub_questions,
            })
        };

        Ok(Self {
            number,
            kind,
            media_refs: record.media_refs,
            spec_tags: record.spec_tags,
            source_page: record.source_page,
        })
    }
}

/// Normalize a question number as printed on a paper.
///
/// `"Q1"` → `"1"`, `"1 (a)"` → `"1a"`, `"1(a)(i)"` → `"1a(i)"`, `"2."` → `"2"`.
pub fn normalize_number(raw: &str) -> String {
    let mut compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    for prefix in ["question", "q"] {
        if let Some(rest) = compact.strip_prefix(prefix) {
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                compact = rest.to_string();
                break;
            }
        }
    }
    let compact = compact.trim_end_matches('.').to_string();

    // The first parenthesised letter straight after the digits is the part letter.
    let digits_end = compact
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(compact.len());
    if digits_end > 0 && compact[digits_end..].starts_with('(') {
        if let Some(close) = compact[digits_end..].find(')') {
            let inner = &compact[digits_end + 1..digits_end + close];
            if inner.len() == 1 && inner.chars().all(|c| c.is_ascii_alphabetic()) {
                return format!(
                    "{}{}{}",
                    &compact[..digits_end],
                    inner,
                    &compact[digits_end + close + 1..]
                );
            }
        }
    }
    compact
}

/// Split a normalized number into its hierarchy segments.
///
/// `"1a(ii)"` → `["1", "a", "(ii)"]`; dotted numbers split on `.`.
pub fn number_segments(number: &str) -> Vec<&str> {
    if number.contains('.') {
        return number.split('.').filter(|s| !s.is_empty()).collect();
    }

    let mut segments = Vec::new();
    let bytes = number.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        let c = bytes[start];
        let end = if c.is_ascii_digit() {
            start + bytes[start..].iter().take_while(|b| b.is_ascii_digit()).count()
        } else if c.is_ascii_alphabetic() {
            start + bytes[start..].iter().take_while(|b| b.is_ascii_alphabetic()).count()
        } else if c == b'(' {
            match number[start..].find(')') {
                Some(close) => start + close + 1,
                None => bytes.len(),
            }
        } else {
            start + number[start..].chars().next().map_or(1, char::len_utf8)
        };
        segments.push(&number[start..end]);
        start = end;
    }
    segments
}

/// Number of the parent node, if this number has one.
pub fn parent_number(number: &str) -> Option<String> {
    let segments = number_segments(number);
    if segments.len() < 2 {
        return None;
    }
    let parent = &segments[..segments.len() - 1];
    Some(if number.contains('.') {
        parent.join(".")
    } else {
        parent.concat()
    })
}

/// Top-level question number (`"3b(i)"` → `"3"`).
pub fn top_level_number(number: &str) -> String {
    number_segments(number)
        .first()
        .map(|s| s.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_unwraps_part_letter() {
        assert_eq!(normalize_number("1(a)"), "1a");
        assert_eq!(normalize_number("1 (a) (i)"), "1a(i)");
        assert_eq!(normalize_number("Q3"), "3");
        assert_eq!(normalize_number("2."), "2");
        assert_eq!(normalize_number("1a(ii)"), "1a(ii)");
        assert_eq!(normalize_number("1.2"), "1.2");
    }

    #[test]
    fn segments_and_parents() {
        assert_eq!(number_segments("1a(ii)"), vec!["1", "a", "(ii)"]);
        assert_eq!(number_segments("12b"), vec!["12", "b"]);
        assert_eq!(parent_number("1a(i)").as_deref(), Some("1a"));
        assert_eq!(parent_number("1a").as_deref(), Some("1"));
        assert_eq!(parent_number("1"), None);
        assert_eq!(parent_number("3.2").as_deref(), Some("3"));
        assert_eq!(top_level_number("10c(iii)"), "10");
    }

    #[test]
    fn composite_marks_are_sum_of_children() {
        let q = Question::composite(
            "1",
            "Consider the program below.",
            vec![
                Question::leaf("1a", "State X. [2]", "X is...", 2, ["AO1"]),
                Question::leaf("1b", "Explain Y. [4]", "Y because...", 4, ["AO2"]),
            ],
        );
        assert_eq!(q.max_marks(), 6);
        assert_eq!(q.leaf_count(), 2);
        assert_eq!(q.question_numbers(), vec!["1", "1a", "1b"]);
    }

    #[test]
    fn record_round_trip_preserves_structure() {
        let q = Question::composite(
            "2",
            "",
            vec![Question::leaf("2a", "Define.", "Definition", 1, ["AO1"])],
        );
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["max_marks"], 1);
        assert_eq!(json["sub_questions"][0]["question_number"], "2a");

        let back: Question = serde_json::from_value(json).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn stored_leaf_without_mark_scheme_is_rejected() {
        let json = r#"{"question_number": "4", "question_text": "Why?"}"#;
        let err = serde_json::from_str::<Question>(json).unwrap_err();
        assert!(err.to_string().contains("no mark scheme"));
    }

    #[test]
    fn make_composite_keeps_text_as_stem() {
        let mut q = Question::leaf("5", "Read the extract.", "n/a", 3, ["AO1"]);
        q.make_composite();
        assert!(!q.is_leaf());
        assert_eq!(q.question_text(), "Read the extract.");
        assert_eq!(q.max_marks(), 0);
    }
}
