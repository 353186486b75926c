//! OCR document loading
//!
//! OCR output is accepted either as a bare page list or wrapped as
//! `{"pages": [...]}`. A page list that cannot be indexed (duplicate or
//! out-of-order page indices) is rejected; that failure is fatal for the
//! one document only.

use crate::model::Page;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid OCR JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed page list in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OcrDocument {
    Pages(Vec<Page>),
    Wrapped { pages: Vec<Page> },
}

/// Source of paginated OCR content.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load_pages(&self, content_path: &str) -> Result<Vec<Page>, DocumentError>;
}

/// Reads OCR JSON from disk. Relative content paths resolve against `root`.
#[derive(Debug, Clone)]
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, content_path: &str) -> PathBuf {
        let path = Path::new(content_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn load_pages(&self, content_path: &str) -> Result<Vec<Page>, DocumentError> {
        let path = self.resolve(content_path);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| DocumentError::Io {
                path: path.clone(),
                source,
            })?;
        parse_pages(&text).map_err(|e| match e {
            ParseFailure::Json(source) => DocumentError::Json { path, source },
            ParseFailure::Malformed(reason) => DocumentError::Malformed { path, reason },
        })
    }
}

enum ParseFailure {
    Json(serde_json::Error),
    Malformed(String),
}

fn parse_pages(text: &str) -> Result<Vec<Page>, ParseFailure> {
    let document: OcrDocument = serde_json::from_str(text).map_err(ParseFailure::Json)?;
    let mut pages = match document {
        OcrDocument::Pages(pages) | OcrDocument::Wrapped { pages } => pages,
    };
    for pair in pages.windows(2) {
        if pair[1].index <= pair[0].index {
            return Err(ParseFailure::Malformed(format!(
                "page index {} follows page index {}",
                pair[1].index, pair[0].index
            )));
        }
    }
    for page in &mut pages {
        page.normalize_images();
    }
    Ok(pages)
}

/// Parse OCR JSON already in memory, with the same checks as `FsDocumentSource`.
pub fn pages_from_json(text: &str) -> Result<Vec<Page>, DocumentError> {
    parse_pages(text).map_err(|e| match e {
        ParseFailure::Json(source) => DocumentError::Json {
            path: PathBuf::from("<memory>"),
            source,
        },
        ParseFailure::Malformed(reason) => DocumentError::Malformed {
            path: PathBuf::from("<memory>"),
            reason,
        },
    })
}
