//! Unit number derivation
//!
//! Order: explicit metadata, then the exam paper title (`Unit 3`, or an
//! exam code inside it), then the document id (`2500u20-1`, `30-1`).
//! Exam codes carry the unit as the first digit of the component
//! (`1500U30` is unit 3).

use crate::model::{normalize_unit_number, IndexEntry, UNASSIGNED_UNIT};
use regex_lite::Regex;
use std::sync::LazyLock;

static UNIT_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bunit\s*(\d+)").expect("valid unit word regex"));
static EXAM_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d{3,4}u(\d)\d").expect("valid exam code regex"));
static CODE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)u(\d)\d-").expect("valid code suffix regex"));
static COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\d])(\d)0-\d").expect("valid component regex"));

/// Where a unit number came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnitSource {
    Metadata,
    Title,
    Identifier,
    Unassigned,
}

impl UnitSource {
    /// Metadata values are trusted over pattern matches.
    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Metadata)
    }
}

impl std::fmt::Display for UnitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Metadata => "metadata",
            Self::Title => "title",
            Self::Identifier => "identifier",
            Self::Unassigned => "unassigned",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDerivation {
    pub unit: String,
    pub source: UnitSource,
}

impl UnitDerivation {
    pub fn is_assigned(&self) -> bool {
        self.source != UnitSource::Unassigned
    }
}

/// Unit named in free text (`"Unit 3: Programming"`, `"1500U30-1"`).
pub fn unit_from_title(title: &str) -> Option<String> {
    capture(&UNIT_WORD, title).or_else(|| unit_from_code(title))
}

/// Unit encoded in a document id or exam code.
pub fn unit_from_code(code: &str) -> Option<String> {
    capture(&EXAM_CODE, code)
        .or_else(|| capture(&CODE_SUFFIX, code))
        .or_else(|| capture(&COMPONENT, code))
}

fn capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| normalize_unit_number(m.as_str()))
}

/// Best available unit number for an entry.
pub fn derive_unit(entry: &IndexEntry) -> UnitDerivation {
    if let Some(unit) = entry.unit_number.as_deref().and_then(normalize_unit_number) {
        return UnitDerivation {
            unit,
            source: UnitSource::Metadata,
        };
    }
    if let Some(unit) = entry.exam_paper.as_deref().and_then(unit_from_title) {
        return UnitDerivation {
            unit,
            source: UnitSource::Title,
        };
    }
    if let Some(unit) = unit_from_code(&entry.id) {
        return UnitDerivation {
            unit,
            source: UnitSource::Identifier,
        };
    }
    UnitDerivation {
        unit: UNASSIGNED_UNIT.to_string(),
        source: UnitSource::Unassigned,
    }
}
