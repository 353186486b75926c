//! JSON file backend
//!
//! Three files in one data directory:
//! - `index.json`: `{"documents": [entry, ...]}`
//! - `hierarchical_index.json`: the nested tree
//! - `exam_records.json`: `{"<question paper>|<mark scheme>": record, ...}`
//!
//! Every write goes to a temporary sibling first and is renamed into place,
//! so a reader sees either the old file or the new one.

use super::traits::{IndexPersistence, StorageError, StorageResult};
use crate::index::{ExamRecord, HierarchicalTree};
use crate::model::IndexEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Serialize, Deserialize, Default)]
struct FlatIndex {
    #[serde(default)]
    documents: Vec<IndexEntry>,
}

/// File names inside the data directory.
#[derive(Debug, Clone)]
pub struct JsonFileLayout {
    pub index_file: String,
    pub hierarchical_file: String,
    pub exam_records_file: String,
}

impl Default for JsonFileLayout {
    fn default() -> Self {
        Self {
            index_file: "index.json".to_string(),
            hierarchical_file: "hierarchical_index.json".to_string(),
            exam_records_file: "exam_records.json".to_string(),
        }
    }
}

pub struct JsonFileStore {
    dir: PathBuf,
    layout: JsonFileLayout,
    /// Serializes read-modify-write of the exam record file
    records_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(dir, JsonFileLayout::default())
    }

    pub fn with_layout(dir: impl Into<PathBuf>, layout: JsonFileLayout) -> Self {
        Self {
            dir: dir.into(),
            layout,
            records_lock: Mutex::new(()),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(&self.layout.index_file)
    }

    pub fn tree_path(&self) -> PathBuf {
        self.dir.join(&self.layout.hierarchical_file)
    }

    pub fn records_path(&self) -> PathBuf {
        self.dir.join(&self.layout.exam_records_file)
    }

    fn read<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn write<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(value)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_records(&self) -> StorageResult<BTreeMap<String, ExamRecord>> {
        Ok(Self::read(&self.records_path())?.unwrap_or_default())
    }
}

impl IndexPersistence for JsonFileStore {
    fn load_entries(&self) -> StorageResult<Vec<IndexEntry>> {
        let index: Option<FlatIndex> = Self::read(&self.index_path())?;
        Ok(index.unwrap_or_default().documents)
    }

    fn save_entries(&self, entries: &[IndexEntry]) -> StorageResult<()> {
        Self::write(
            &self.index_path(),
            &FlatIndex {
                documents: entries.to_vec(),
            },
        )
    }

    fn save_tree(&self, tree: &HierarchicalTree) -> StorageResult<()> {
        Self::write(&self.tree_path(), tree)
    }

    fn load_tree(&self) -> StorageResult<Option<HierarchicalTree>> {
        Self::read(&self.tree_path())
    }

    fn load_exam_records(&self) -> StorageResult<Vec<ExamRecord>> {
        Ok(self.read_records()?.into_values().collect())
    }

    fn save_exam_record(&self, record: &ExamRecord) -> StorageResult<()> {
        let _guard = self.records_lock.lock().unwrap();
        let mut records = self.read_records()?;
        records.insert(record.key(), record.clone());
        Self::write(&self.records_path(), &records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentType, Question, UnitSlot};
    use tempfile::TempDir;

    #[test]
    fn missing_files_load_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_entries().unwrap().is_empty());
        assert!(store.load_tree().unwrap().is_none());
        assert!(store.load_exam_records().unwrap().is_empty());
    }

    #[test]
    fn entries_are_written_under_documents_key() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let entry = IndexEntry::new("s23-1500u30-1", DocumentType::QuestionPaper, 2023, "GCE A Level", "Computer Science")
            .with_unit("3");
        store.save_entries(&[entry.clone()]).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.index_path()).unwrap()).unwrap();
        assert_eq!(raw["documents"][0]["type"], "Question Paper");
        assert_eq!(store.load_entries().unwrap(), vec![entry]);
        assert!(!dir.path().join("index.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        std::fs::write(store.index_path(), "{\"documents\": [").unwrap();
        let err = store.load_entries().unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn exam_records_replace_by_pair() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let slot = UnitSlot::new("Computer Science", 2023, "GCSE", "1");
        let mut record = ExamRecord {
            slot,
            question_paper_id: "qp".into(),
            mark_scheme_id: "ms".into(),
            questions: vec![Question::leaf("1", "Q", "A", 1, ["AO1"])],
        };
        store.save_exam_record(&record).unwrap();
        record.questions.push(Question::leaf("2", "Q2", "A2", 2, ["AO2"]));
        record.slot = UnitSlot::new("Computer Science", 2023, "GCSE", "3");
        store.save_exam_record(&record).unwrap();

        let records = store.load_exam_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].questions.len(), 2);
        assert_eq!(records[0].slot.unit, "3");
    }
}
