//! Document metadata and index entry creation
//!
//! Metadata files use the extractor's display keys (`"Type"`,
//! `"Exam Paper"`, ...). `IndexEntry::from_metadata` turns one into a flat
//! index record; `MetadataExtractor` asks the LLM for it from the first
//! pages of a document.

use crate::align::extract_json;
use crate::llm::{LlmClient, LlmError};
use crate::model::{deserialize_unit_number, deserialize_year, DocumentType, IndexEntry, Page};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Fields an extractor reply must carry
pub const REQUIRED_FIELDS: [&str; 4] = ["Type", "Qualification", "Year", "Subject"];

/// Pages of a document scanned for metadata, counted by page index
pub const DEFAULT_MAX_SCAN_PAGES: usize = 4;

pub const DEFAULT_METADATA_INSTRUCTIONS: &str = "\
Extract the exam document's metadata from the scanned pages above.
Respond with a single JSON object with these keys:
\"Type\" (\"Question Paper\" or \"Mark Scheme\"), \"Qualification\", \"Year\",
\"Subject\", \"Exam Paper\" (the paper title), \"Exam Season\", \"Exam Length\",
\"Unit Number\" and \"Total Marks\". Use null for anything not stated.";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("No JSON object in metadata reply")]
    Unparseable,

    #[error("Missing required metadata fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Invalid metadata: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("Cannot read metadata file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata as written by the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "Type")]
    pub doc_type: DocumentType,
    #[serde(rename = "Qualification")]
    pub qualification: String,
    #[serde(rename = "Year", deserialize_with = "deserialize_year")]
    pub year: i32,
    #[serde(rename = "Subject")]
    pub subject: String,
    #[serde(rename = "Exam Paper", default, skip_serializing_if = "Option::is_none")]
    pub exam_paper: Option<String>,
    #[serde(rename = "Exam Season", default, skip_serializing_if = "Option::is_none")]
    pub exam_season: Option<String>,
    #[serde(rename = "Exam Length", default, skip_serializing_if = "Option::is_none")]
    pub exam_length: Option<String>,
    #[serde(
        rename = "Unit Number",
        default,
        deserialize_with = "deserialize_unit_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub unit_number: Option<String>,
    #[serde(
        rename = "Total Marks",
        default,
        deserialize_with = "deserialize_marks",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_marks: Option<u32>,
    /// First question paper page holding questions
    #[serde(rename = "QuestionStartIndex", default, skip_serializing_if = "Option::is_none")]
    pub question_start_index: Option<usize>,
    /// First mark scheme page holding answers
    #[serde(rename = "MarkSchemeStartIndex", default, skip_serializing_if = "Option::is_none")]
    pub mark_scheme_start_index: Option<usize>,
}

fn deserialize_marks<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => {
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            digits.parse().ok()
        }
        _ => None,
    })
}

impl DocumentMetadata {
    /// Parse a JSON object, reporting every missing required key at once.
    pub fn from_value(value: serde_json::Value) -> Result<Self, MetadataError> {
        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|key| value.get(**key).map_or(true, serde_json::Value::is_null))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(MetadataError::MissingFields(missing));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(io_error(path))?;
        Self::from_value(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MetadataError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(path))?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?).map_err(io_error(path))
    }

    /// `load` for async callers
    pub async fn read(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(io_error(path))?;
        Self::from_value(serde_json::from_str(&text)?)
    }

    /// `save` for async callers
    pub async fn write(&self, path: impl AsRef<Path>) -> Result<(), MetadataError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error(path))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await.map_err(io_error(path))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> MetadataError + '_ {
    move |source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl MetadataError {
    /// The metadata file does not exist (as opposed to existing but being unreadable).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Season from an id like `s23-...` (Summer) or `w22-...` (Winter).
pub fn infer_season(id: &str) -> &'static str {
    let mut chars = id.chars();
    let first = chars.next().map(|c| c.to_ascii_lowercase());
    let digit_follows = chars.next().is_some_and(|c| c.is_ascii_digit());
    match (first, digit_follows) {
        (Some('s'), true) => "Summer",
        (Some('w'), true) => "Winter",
        _ => "Unknown",
    }
}

impl IndexEntry {
    /// Build an index entry for the document at `content_path`.
    ///
    /// The id is the content file's stem. Relationships start empty; the
    /// resolver fills them in.
    pub fn from_metadata(meta: &DocumentMetadata, content_path: &str, metadata_path: &str) -> Self {
        let id = Path::new(content_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| content_path.to_string());
        let season = meta
            .exam_season
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| infer_season(&id).to_string());

        let mut entry = IndexEntry::new(id, meta.doc_type, meta.year, meta.qualification.trim(), meta.subject.trim())
            .with_paths(content_path, metadata_path)
            .with_season(season);
        entry.unit_number = meta.unit_number.clone();
        entry.exam_paper = meta.exam_paper.clone();
        entry.exam_length = meta.exam_length.clone();
        entry.total_marks = meta.total_marks;
        entry
    }
}

/// LLM-backed metadata extraction.
pub struct MetadataExtractor {
    client: Arc<dyn LlmClient>,
    max_scan_pages: usize,
    instructions: String,
}

impl MetadataExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            max_scan_pages: DEFAULT_MAX_SCAN_PAGES,
            instructions: DEFAULT_METADATA_INSTRUCTIONS.to_string(),
        }
    }

    pub fn with_max_scan_pages(mut self, pages: usize) -> Self {
        self.max_scan_pages = pages;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Markdown of every page whose index is within the scan limit
    pub fn scanned_text(&self, pages: &[Page]) -> String {
        pages
            .iter()
            .filter(|p| p.index <= self.max_scan_pages)
            .map(|p| p.markdown.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn build_prompt(&self, pages: &[Page]) -> String {
        format!(
            "# Scanned Document\n\n{}\n\n{}",
            self.scanned_text(pages).trim(),
            self.instructions.trim()
        )
    }

    pub async fn extract(&self, pages: &[Page]) -> Result<DocumentMetadata, MetadataError> {
        let prompt = self.build_prompt(pages);
        debug!(client = self.client.name(), pages = pages.len(), "extracting metadata");
        let reply = self.client.generate_structured(&prompt).await?;
        let Some(value) = extract_json(&reply) else {
            warn!("metadata reply had no JSON object");
            return Err(MetadataError::Unparseable);
        };
        DocumentMetadata::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;
    use serde_json::json;

    fn metadata() -> DocumentMetadata {
        DocumentMetadata::from_value(json!({
            "Type": "Question Paper",
            "Qualification": "GCE A Level",
            "Year": "2023",
            "Subject": "Computer Science",
            "Exam Paper": "Unit 3: Programming and System Development",
            "Exam Length": "2 hours 30 minutes",
            "Unit Number": "Unit 3",
            "Total Marks": "100 marks"
        }))
        .unwrap()
    }

    #[test]
    fn lenient_fields_normalize() {
        let meta = metadata();
        assert_eq!(meta.year, 2023);
        assert_eq!(meta.unit_number.as_deref(), Some("3"));
        assert_eq!(meta.total_marks, Some(100));
        assert_eq!(meta.question_start_index, None);
    }

    #[test]
    fn missing_required_fields_are_listed() {
        let err = DocumentMetadata::from_value(json!({"Type": "Mark Scheme", "Year": null})).unwrap_err();
        match err {
            MetadataError::MissingFields(fields) => {
                assert_eq!(fields, vec!["Qualification", "Year", "Subject"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn entry_takes_id_from_content_stem_and_infers_season() {
        let entry = IndexEntry::from_metadata(
            &metadata(),
            "ocr/s23-1500u30-1.json",
            "metadata/s23-1500u30-1-metadata.json",
        );
        assert_eq!(entry.id, "s23-1500u30-1");
        assert_eq!(entry.exam_season, "Summer");
        assert_eq!(entry.unit_number.as_deref(), Some("3"));
        assert_eq!(entry.content_path, "ocr/s23-1500u30-1.json");
        assert!(entry.related_documents.is_empty());

        assert_eq!(infer_season("W22-1500U10-1"), "Winter");
        assert_eq!(infer_season("2500U20-1"), "Unknown");
    }

    #[test]
    fn save_and_load_keep_start_indices() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta.json");
        let mut meta = metadata();
        meta.question_start_index = Some(2);
        meta.save(&path).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["QuestionStartIndex"], 2);
        assert_eq!(DocumentMetadata::load(&path).unwrap(), meta);
    }

    #[tokio::test]
    async fn async_read_matches_sync_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("meta.json");
        let err = DocumentMetadata::read(&path).await.unwrap_err();
        assert!(err.is_not_found());

        metadata().write(&path).await.unwrap();
        assert_eq!(DocumentMetadata::read(&path).await.unwrap(), DocumentMetadata::load(&path).unwrap());

        std::fs::write(&path, "{}").unwrap();
        let err = DocumentMetadata::read(&path).await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn extractor_scans_first_pages_and_parses_reply() {
        let client = Arc::new(MockClient::new().with_response(
            "Here you go:\n```json\n{\"Type\": \"Mark Scheme\", \"Qualification\": \"GCSE\", \
             \"Year\": 2022, \"Subject\": \"Computer Science\", \"Unit Number\": 1,}\n```",
        ));
        let pages: Vec<Page> = (0..8).map(|i| Page::new(i, format!("page {i}"))).collect();
        let extractor = MetadataExtractor::new(client.clone()).with_max_scan_pages(1);

        let meta = extractor.extract(&pages).await.unwrap();
        assert_eq!(meta.doc_type, DocumentType::MarkScheme);
        assert_eq!(meta.unit_number.as_deref(), Some("1"));

        let prompt = &client.prompts()[0];
        assert!(prompt.contains("page 1"));
        assert!(!prompt.contains("page 2"));
    }

    #[tokio::test]
    async fn extractor_reports_unparseable_reply() {
        let client = Arc::new(MockClient::new().with_response("I could not read this document."));
        let err = MetadataExtractor::new(client).extract(&[]).await.unwrap_err();
        assert!(matches!(err, MetadataError::Unparseable));
    }
}
