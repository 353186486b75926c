//! Turning raw model replies into validated question trees
//!
//! The reply shape is loose: numbers arrive as strings or ints, `questions`
//! may be a single object, marks may be missing. Everything is read through
//! explicit accessors with defaults; nothing about the shape is assumed.
//!
//! A leaf needs both its text and its mark scheme. Leaves missing one of the
//! two are not fabricated: they are dropped from `questions` and reported as
//! `DroppedQuestion`s carrying the half that was seen, so the aligner can
//! complete them from a later window.

use super::json_repair::extract_json;
use crate::model::{normalize_number, Question};
use regex_lite::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use thiserror::Error;

static MARKS_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*(\d+)\s*(?:marks?)?\s*\]").expect("valid marks tag regex")
});
static AO_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bAO\s?(\d+)").expect("valid assessment objective regex"));

/// Reply could not be turned into a JSON object, even after repair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("malformed model response: {reason}")]
    Malformed { reason: String },
}

/// Whether the model saw the whole of the questions it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextComplete {
    pub question_paper: bool,
    pub mark_scheme: bool,
}

impl Default for ContextComplete {
    fn default() -> Self {
        Self {
            question_paper: true,
            mark_scheme: true,
        }
    }
}

/// Why a question in the reply did not make it into `questions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotAnObject,
    MissingNumber,
    MissingText,
    MissingMarkScheme,
    MissingBoth,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotAnObject => "not an object",
            Self::MissingNumber => "no question number",
            Self::MissingText => "no question text",
            Self::MissingMarkScheme => "no mark scheme",
            Self::MissingBoth => "no question text or mark scheme",
        })
    }
}

/// Half of a leaf: text without mark scheme or the other way round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionFragment {
    pub number: String,
    pub question_text: String,
    pub mark_scheme: String,
    /// Marks given explicitly or found in the text, if any
    pub max_marks: Option<u32>,
    pub assessment_objectives: BTreeSet<String>,
}

impl QuestionFragment {
    /// Combine with a fragment seen later; non-empty values in `later` win.
    pub fn absorb(&mut self, later: QuestionFragment) {
        if !later.question_text.trim().is_empty() {
            self.question_text = later.question_text;
        }
        if !later.mark_scheme.trim().is_empty() {
            self.mark_scheme = later.mark_scheme;
        }
        if later.max_marks.is_some() {
            self.max_marks = later.max_marks;
        }
        self.assessment_objectives.extend(later.assessment_objectives);
    }

    pub fn is_complete(&self) -> bool {
        !self.question_text.trim().is_empty() && !self.mark_scheme.trim().is_empty()
    }

    /// Build the leaf once both halves are known.
    pub fn into_leaf(self) -> Option<Question> {
        if !self.is_complete() {
            return None;
        }
        let max_marks = self
            .max_marks
            .or_else(|| infer_marks(&self.question_text))
            .unwrap_or(0);
        let mut objectives = self.assessment_objectives;
        if objectives.is_empty() {
            objectives = infer_objectives(&self.mark_scheme);
        }
        Some(Question::leaf(
            self.number,
            self.question_text,
            self.mark_scheme,
            max_marks,
            objectives,
        ))
    }
}

/// A question the assembler refused to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedQuestion {
    /// Normalized number, empty when the reply gave none
    pub number: String,
    pub reason: DropReason,
    /// The half that was present, for completion from a later window
    pub fragment: Option<QuestionFragment>,
}

/// Parsed reply for one alignment step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssemblerResult {
    pub questions: Vec<Question>,
    pub next_question_paper_index: Option<usize>,
    pub next_mark_scheme_index: Option<usize>,
    pub next_question_number: Option<String>,
    pub context_complete: ContextComplete,
    pub dropped: Vec<DroppedQuestion>,
}

/// Stateless reply parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseAssembler;

impl ResponseAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Parse a raw reply. Identical input always yields identical output.
    pub fn assemble(&self, raw_response: &str) -> Result<AssemblerResult, AssembleError> {
        let value = extract_json(raw_response).ok_or_else(|| AssembleError::Malformed {
            reason: if raw_response.trim().is_empty() {
                "empty response".to_string()
            } else {
                format!("no JSON object in response ({} bytes)", raw_response.len())
            },
        })?;
        let Value::Object(obj) = value else {
            return Err(AssembleError::Malformed {
                reason: "top-level value is not an object".to_string(),
            });
        };

        let mut dropped = Vec::new();
        let questions = as_list(obj.get("questions"))
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| convert_question(v, &(i + 1).to_string(), &mut dropped))
            .collect();

        Ok(AssemblerResult {
            questions,
            next_question_paper_index: index_field(&obj, "next_question_paper_index"),
            next_mark_scheme_index: index_field(&obj, "next_mark_scheme_index"),
            next_question_number: obj
                .get("next_question_number")
                .and_then(scalar_string)
                .map(|n| normalize_number(&n))
                .filter(|n| !n.is_empty()),
            context_complete: context_complete(&obj),
            dropped,
        })
    }
}

fn convert_question(value: &Value, inferred_number: &str, dropped: &mut Vec<DroppedQuestion>) -> Option<Question> {
    let Value::Object(obj) = value else {
        dropped.push(DroppedQuestion {
            number: String::new(),
            reason: DropReason::NotAnObject,
            fragment: None,
        });
        return None;
    };

    let number = obj
        .get("question_number")
        .or_else(|| obj.get("number"))
        .and_then(scalar_string)
        .map(|n| normalize_number(&n))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| normalize_number(inferred_number));
    if number.is_empty() {
        dropped.push(DroppedQuestion {
            number,
            reason: DropReason::MissingNumber,
            fragment: None,
        });
        return None;
    }

    let question_text = text_field(obj, &["question_text", "text"]);
    let mark_scheme = text_field(obj, &["mark_scheme", "markscheme"]);

    let children: Vec<Question> = as_list(obj.get("sub_questions"))
        .into_iter()
        .enumerate()
        .filter_map(|(j, child)| convert_question(child, &format!("{}.{}", number, j + 1), dropped))
        .collect();

    if !children.is_empty() {
        return Some(Question::composite(number, question_text, children).with_mark_scheme(mark_scheme));
    }

    let explicit_marks = obj
        .get("max_marks")
        .or_else(|| obj.get("marks"))
        .and_then(marks_value);
    let explicit_objectives = objectives_value(obj.get("assessment_objectives"));

    let fragment = QuestionFragment {
        number: number.clone(),
        max_marks: explicit_marks.or_else(|| infer_marks(&question_text)),
        assessment_objectives: explicit_objectives,
        question_text,
        mark_scheme,
    };

    let reason = match (
        fragment.question_text.trim().is_empty(),
        fragment.mark_scheme.trim().is_empty(),
    ) {
        (false, false) => return fragment.into_leaf(),
        (true, false) => DropReason::MissingText,
        (false, true) => DropReason::MissingMarkScheme,
        (true, true) => DropReason::MissingBoth,
    };
    dropped.push(DroppedQuestion {
        number,
        reason,
        fragment: (reason != DropReason::MissingBoth).then_some(fragment),
    });
    None
}

/// `[N]` / `[N marks]` in question text
pub fn infer_marks(text: &str) -> Option<u32> {
    MARKS_TAG
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// `AO1`, `AO 2`, ... tokens in a mark scheme
pub fn infer_objectives(mark_scheme: &str) -> BTreeSet<String> {
    AO_TOKEN
        .captures_iter(mark_scheme)
        .filter_map(|c| c.get(1))
        .map(|m| format!("AO{}", m.as_str()))
        .collect()
}

fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single],
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|i| match i {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

fn marks_value(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u32)),
        Value::String(s) => {
            let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn objectives_value(value: Option<&Value>) -> BTreeSet<String> {
    let normalize = |s: &str| {
        let s = s.trim();
        if s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty() {
            format!("AO{}", s)
        } else {
            s.to_uppercase().replace(' ', "")
        }
    };
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(scalar_string)
            .map(|s| normalize(&s))
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split([',', ';', '/'])
            .map(normalize)
            .filter(|s| !s.is_empty())
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn index_field(obj: &Map<String, Value>, key: &str) -> Option<usize> {
    match obj.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| usize::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn context_complete(obj: &Map<String, Value>) -> ContextComplete {
    let flag = |v: Option<&Value>| match v {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    };
    let defaults = ContextComplete::default();
    match obj.get("context_complete") {
        Some(Value::Object(inner)) => ContextComplete {
            question_paper: flag(inner.get("question_paper")).unwrap_or(defaults.question_paper),
            mark_scheme: flag(inner.get("mark_scheme")).unwrap_or(defaults.mark_scheme),
        },
        Some(v @ Value::Bool(_)) => {
            let both = flag(Some(v)).unwrap_or(true);
            ContextComplete {
                question_paper: both,
                mark_scheme: both,
            }
        }
        _ => ContextComplete {
            question_paper: flag(obj.get("question_paper_context_complete"))
                .unwrap_or(defaults.question_paper),
            mark_scheme: flag(obj.get("mark_scheme_context_complete"))
                .unwrap_or(defaults.mark_scheme),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(raw: &str) -> AssemblerResult {
        ResponseAssembler::new().assemble(raw).unwrap()
    }

    #[test]
    fn single_leaf_with_inferred_objectives() {
        let result = assemble(
            r#"{"questions": [{"question_number": "1(a)", "question_text": "What is X? [2]",
                "mark_scheme": "Answer about X. AO1, 2 marks", "max_marks": 2}],
                "next_question_paper_index": 1, "next_mark_scheme_index": 1,
                "next_question_number": "1(b)"}"#,
        );
        assert_eq!(result.questions.len(), 1);
        let q = &result.questions[0];
        assert_eq!(q.number, "1a");
        assert_eq!(q.max_marks(), 2);
        assert_eq!(
            q.assessment_objectives().unwrap().iter().collect::<Vec<_>>(),
            vec!["AO1"]
        );
        assert_eq!(result.next_question_paper_index, Some(1));
        assert_eq!(result.next_question_number.as_deref(), Some("1b"));
        assert_eq!(result.context_complete, ContextComplete::default());
    }

    #[test]
    fn marks_inferred_from_text_tag() {
        let result = assemble(
            r#"{"questions": {"question_number": 3, "question_text": "Explain why. [4 marks]",
                "mark_scheme": "Because..."}}"#,
        );
        assert_eq!(result.questions[0].number, "3");
        assert_eq!(result.questions[0].max_marks(), 4);
        assert!(result.questions[0].assessment_objectives().unwrap().is_empty());
        assert_eq!(result.next_question_paper_index, None);
    }

    #[test]
    fn nested_sub_questions_keep_depth_and_sum_marks() {
        let result = assemble(
            r#"{"questions": [{"question_number": "2", "question_text": "Study the code.",
                "sub_questions": [
                    {"question_number": "2a", "question_text": "State. [1]", "mark_scheme": "S", "assessment_objectives": ["AO1"]},
                    {"question_number": "2b", "question_text": "Parts", "sub_questions": [
                        {"question_number": "2b(i)", "question_text": "Do i [3]", "mark_scheme": "i", "marks": "3"},
                        {"question_text": "Do ii", "mark_scheme": "ii", "max_marks": 2}
                    ]}
                ]}]}"#,
        );
        let q = &result.questions[0];
        assert_eq!(q.max_marks(), 6);
        assert_eq!(
            q.question_numbers(),
            vec!["2", "2a", "2b", "2b(i)", "2b.2"]
        );
    }

    #[test]
    fn leaf_missing_mark_scheme_is_dropped_with_fragment() {
        let result = assemble(
            r#"{"questions": [{"question_number": "4", "question_text": "Describe. [6]"}],
                "context_complete": {"question_paper": true, "mark_scheme": false}}"#,
        );
        assert!(result.questions.is_empty());
        assert_eq!(result.dropped.len(), 1);
        let dropped = &result.dropped[0];
        assert_eq!(dropped.reason, DropReason::MissingMarkScheme);
        let fragment = dropped.fragment.as_ref().unwrap();
        assert_eq!(fragment.max_marks, Some(6));
        assert!(!result.context_complete.mark_scheme);
    }

    #[test]
    fn composite_with_only_invalid_children_becomes_leaf_or_drop() {
        let result = assemble(
            r#"{"questions": [{"question_number": "5", "question_text": "Whole question [3]",
                "mark_scheme": "AO2 answer", "sub_questions": [{"question_number": "5a"}]}]}"#,
        );
        assert_eq!(result.questions.len(), 1);
        assert!(result.questions[0].is_leaf());
        assert_eq!(result.questions[0].max_marks(), 3);
        assert_eq!(result.dropped[0].reason, DropReason::MissingBoth);
    }

    #[test]
    fn unrepairable_reply_is_malformed() {
        let err = ResponseAssembler::new()
            .assemble("Sorry, I cannot help with that.")
            .unwrap_err();
        assert!(matches!(err, AssembleError::Malformed { .. }));
    }

    #[test]
    fn repeated_assembly_is_identical() {
        let raw = r#"```json
        {"questions": [{"question_number": "1", "question_text": "Q [1]", "mark_scheme": "A",},],
         "next_question_paper_index": 2, "next_mark_scheme_index": "1",}
        ```"#;
        let first = assemble(raw);
        let second = assemble(raw);
        assert_eq!(first, second);
        assert_eq!(first.next_mark_scheme_index, Some(1));
    }
}
