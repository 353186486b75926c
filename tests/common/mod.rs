//! Shared fixtures for the integration tests
//!
//! Documents are laid out on disk the way the extractor leaves them: OCR
//! JSON at the data directory root, metadata under `metadata/`.

#![allow(dead_code)]

use examindex::{Config, DocumentType, IndexEntry};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

pub const SUBJECT: &str = "Computer Science";
pub const QUALIFICATION: &str = "GCE A Level";

pub fn entry(id: &str, doc_type: DocumentType) -> IndexEntry {
    IndexEntry::new(id, doc_type, 2023, QUALIFICATION, SUBJECT)
}

pub fn question_paper(id: &str) -> IndexEntry {
    entry(id, DocumentType::QuestionPaper)
}

pub fn mark_scheme(id: &str) -> IndexEntry {
    entry(id, DocumentType::MarkScheme)
}

/// Config pointing every path at `dir`.
pub fn config_for(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.index.data_dir = dir.path().to_path_buf();
    config
}

/// Write OCR output for `id` as a bare page list; returns the content path.
pub fn write_pages(root: &Path, id: &str, pages: &[&str]) -> String {
    let pages: Vec<_> = pages
        .iter()
        .enumerate()
        .map(|(index, markdown)| json!({"index": index, "markdown": markdown}))
        .collect();
    let name = format!("{}.json", id);
    std::fs::write(root.join(&name), serde_json::to_string_pretty(&pages).unwrap()).unwrap();
    name
}

/// Write an extractor metadata file; returns its path relative to `root`.
pub fn write_metadata(root: &Path, id: &str, doc_type: DocumentType, unit: &str, start: usize) -> String {
    let start_key = match doc_type {
        DocumentType::QuestionPaper => "QuestionStartIndex",
        DocumentType::MarkScheme => "MarkSchemeStartIndex",
    };
    let metadata = json!({
        "Type": doc_type.as_str(),
        "Qualification": QUALIFICATION,
        "Year": "2023",
        "Subject": SUBJECT,
        "Exam Paper": format!("Unit {}: Programming and System Development", unit),
        "Exam Length": "2 hours 30 minutes",
        "Unit Number": format!("Unit {}", unit),
        "Total Marks": "100 marks",
        start_key: start,
    });
    let relative = format!("metadata/{}-metadata.json", id);
    let path = root.join(&relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string_pretty(&metadata).unwrap()).unwrap();
    relative
}

/// Alignment reply in the shape the model is asked for.
pub fn reply(questions: serde_json::Value, next_qp: usize, next_ms: usize) -> String {
    json!({
        "questions": questions,
        "next_question_paper_index": next_qp,
        "next_mark_scheme_index": next_ms,
    })
    .to_string()
}

pub fn leaf(number: &str, text: &str, scheme: &str, marks: u32) -> serde_json::Value {
    json!({
        "question_number": number,
        "question_text": text,
        "mark_scheme": scheme,
        "max_marks": marks,
        "assessment_objectives": ["AO1"],
    })
}
