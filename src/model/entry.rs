//! Flat index records

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// Unit bucket for documents whose unit could not be determined.
pub const UNASSIGNED_UNIT: &str = "unassigned";

/// Kind of exam document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "Question Paper", alias = "QuestionPaper", alias = "question_paper")]
    QuestionPaper,
    #[serde(rename = "Mark Scheme", alias = "MarkScheme", alias = "mark_scheme")]
    MarkScheme,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuestionPaper => "Question Paper",
            Self::MarkScheme => "Mark Scheme",
        }
    }

    /// The document type a pair is completed by
    pub fn counterpart(&self) -> Self {
        match self {
            Self::QuestionPaper => Self::MarkScheme,
            Self::MarkScheme => Self::QuestionPaper,
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document in the flat index.
///
/// Entries are the source of truth for relationships; the hierarchical
/// tree is rebuilt from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    #[serde(deserialize_with = "deserialize_year")]
    pub year: i32,
    pub qualification: String,
    pub subject: String,
    /// Unit number as given by metadata, normalized (`"Unit 3"` → `"3"`)
    #[serde(default, deserialize_with = "deserialize_unit_number")]
    pub unit_number: Option<String>,
    /// Exam paper title (e.g. "Unit 3: Programming and System Development")
    #[serde(default)]
    pub exam_paper: Option<String>,
    #[serde(default)]
    pub exam_season: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_length: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_marks: Option<u32>,
    pub content_path: String,
    pub metadata_path: String,
    #[serde(default)]
    pub related_documents: BTreeSet<String>,
}

impl IndexEntry {
    pub fn new(
        id: impl Into<String>,
        doc_type: DocumentType,
        year: i32,
        qualification: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            content_path: format!("{}.json", id),
            metadata_path: format!("metadata/{}-metadata.json", id),
            id,
            doc_type,
            year,
            qualification: qualification.into(),
            subject: subject.into(),
            unit_number: None,
            exam_paper: None,
            exam_season: String::new(),
            exam_length: None,
            total_marks: None,
            related_documents: BTreeSet::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl AsRef<str>) -> Self {
        self.unit_number = normalize_unit_number(unit.as_ref());
        self
    }

    pub fn with_exam_paper(mut self, title: impl Into<String>) -> Self {
        self.exam_paper = Some(title.into());
        self
    }

    pub fn with_season(mut self, season: impl Into<String>) -> Self {
        self.exam_season = season.into();
        self
    }

    pub fn with_paths(mut self, content_path: impl Into<String>, metadata_path: impl Into<String>) -> Self {
        self.content_path = content_path.into();
        self.metadata_path = metadata_path.into();
        self
    }

    pub fn is_question_paper(&self) -> bool {
        self.doc_type == DocumentType::QuestionPaper
    }

    /// Replace every field with `newer`'s but keep the relationships
    /// already established for this id.
    pub fn supersede(&mut self, newer: IndexEntry) {
        let related = std::mem::take(&mut self.related_documents);
        *self = newer;
        self.related_documents.extend(related);
    }
}

/// Normalize a unit number to its canonical string form.
///
/// The first run of digits wins (`"Unit 03"` → `"3"`); values without
/// digits are kept trimmed; blank values are `None`.
pub fn normalize_unit_number(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let digits: String = trimmed
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Some(trimmed.to_string());
    }
    let stripped = digits.trim_start_matches('0');
    Some(if stripped.is_empty() { "0".to_string() } else { stripped.to_string() })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    Int(i64),
    Str(String),
}

pub(crate) fn deserialize_unit_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<StringOrInt> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|raw| match raw {
        StringOrInt::Int(n) => normalize_unit_number(&n.to_string()),
        StringOrInt::Str(s) => normalize_unit_number(&s),
    }))
}

pub(crate) fn deserialize_year<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrInt::deserialize(deserializer)? {
        StringOrInt::Int(n) => i32::try_from(n).map_err(serde::de::Error::custom),
        StringOrInt::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Position of an exam unit in the hierarchical index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitSlot {
    pub subject: String,
    pub year: String,
    pub qualification: String,
    pub unit: String,
}

impl UnitSlot {
    pub fn new(
        subject: impl Into<String>,
        year: impl ToString,
        qualification: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            year: year.to_string(),
            qualification: qualification.into(),
            unit: unit.into(),
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.unit == UNASSIGNED_UNIT
    }
}

impl std::fmt::Display for UnitSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.subject, self.year, self.qualification, self.unit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_numbers_normalize_to_digits() {
        assert_eq!(normalize_unit_number("Unit 3").as_deref(), Some("3"));
        assert_eq!(normalize_unit_number(" 03 ").as_deref(), Some("3"));
        assert_eq!(normalize_unit_number("Paper A").as_deref(), Some("Paper A"));
        assert_eq!(normalize_unit_number("  "), None);
    }

    #[test]
    fn entry_accepts_int_or_string_unit() {
        let json = r#"{
            "id": "s23-1500u30-1",
            "type": "Question Paper",
            "year": "2023",
            "qualification": "GCE A Level",
            "subject": "Computer Science",
            "unit_number": 3,
            "exam_season": "Summer",
            "content_path": "ocr_results/s23-1500u30-1.json",
            "metadata_path": "ocr_results/metadata/s23-1500u30-1-metadata.json",
            "related_documents": ["s23-1500u30-1-ms"]
        }"#;
        let entry: IndexEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.year, 2023);
        assert_eq!(entry.unit_number.as_deref(), Some("3"));
        assert!(entry.is_question_paper());

        let json_string = json.replace("\"unit_number\": 3", "\"unit_number\": \"Unit 3\"");
        let entry: IndexEntry = serde_json::from_str(&json_string).unwrap();
        assert_eq!(entry.unit_number.as_deref(), Some("3"));

        // Integers take the same path as strings: a signed value keeps its digits only.
        let json_negative = json.replace("\"unit_number\": 3", "\"unit_number\": -3");
        let entry: IndexEntry = serde_json::from_str(&json_negative).unwrap();
        assert_eq!(entry.unit_number.as_deref(), Some("3"));
    }

    #[test]
    fn supersede_keeps_relationships() {
        let mut old = IndexEntry::new("a", DocumentType::QuestionPaper, 2022, "GCSE", "CS");
        old.related_documents.insert("a-ms".into());
        let newer = IndexEntry::new("a", DocumentType::QuestionPaper, 2023, "GCSE", "CS");

        old.supersede(newer);
        assert_eq!(old.year, 2023);
        assert!(old.related_documents.contains("a-ms"));
    }
}
