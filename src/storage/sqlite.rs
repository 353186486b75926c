//! SQLite storage backend
//!
//! Entries and exam records are stored as JSON blobs keyed by id and slot
//! path. Tree snapshots are append-only; the newest row is the current tree.

use super::traits::{IndexPersistence, OpenStore, StorageError, StorageResult};
use crate::index::{ExamRecord, HierarchicalTree};
use crate::model::IndexEntry;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Number of tree snapshots retained after each save
const SNAPSHOT_RETENTION: i64 = 5;

/// SQLite-backed index store.
///
/// Thread-safe via internal mutex on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                entry_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tree_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                tree_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS exam_records (
                record_key TEXT PRIMARY KEY,
                updated_at TEXT NOT NULL,
                record_json TEXT NOT NULL
            );

            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Timestamp of the newest tree snapshot
    pub fn latest_snapshot_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT created_at FROM tree_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StorageError::DateParse(e.to_string()))
        })
        .transpose()
    }

    pub fn snapshot_count(&self) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tree_snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}

impl IndexPersistence for SqliteStore {
    fn load_entries(&self) -> StorageResult<Vec<IndexEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT entry_json FROM entries ORDER BY position")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut entries = Vec::new();
        for json in rows {
            entries.push(serde_json::from_str(&json?)?);
        }
        Ok(entries)
    }

    fn save_entries(&self, entries: &[IndexEntry]) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM entries", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO entries (id, position, entry_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    position = excluded.position,
                    entry_json = excluded.entry_json",
            )?;
            for (position, entry) in entries.iter().enumerate() {
                stmt.execute(params![entry.id, position as i64, serde_json::to_string(entry)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn save_tree(&self, tree: &HierarchicalTree) -> StorageResult<()> {
        let json = serde_json::to_string(tree)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tree_snapshots (created_at, tree_json) VALUES (?1, ?2)",
            params![Utc::now().to_rfc3339(), json],
        )?;
        conn.execute(
            "DELETE FROM tree_snapshots WHERE id NOT IN
                (SELECT id FROM tree_snapshots ORDER BY id DESC LIMIT ?1)",
            params![SNAPSHOT_RETENTION],
        )?;
        Ok(())
    }

    fn load_tree(&self) -> StorageResult<Option<HierarchicalTree>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT tree_json FROM tree_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    fn load_exam_records(&self) -> StorageResult<Vec<ExamRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT record_json FROM exam_records ORDER BY record_key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for json in rows {
            records.push(serde_json::from_str(&json?)?);
        }
        Ok(records)
    }

    fn save_exam_record(&self, record: &ExamRecord) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO exam_records (record_key, updated_at, record_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(record_key) DO UPDATE SET
                updated_at = excluded.updated_at,
                record_json = excluded.record_json",
            params![record.key(), Utc::now().to_rfc3339(), serde_json::to_string(record)?],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::HierarchicalIndexReconciler;
    use crate::model::{DocumentType, Question, UnitSlot};
    use tempfile::TempDir;

    fn entries() -> Vec<IndexEntry> {
        vec![
            IndexEntry::new("s22-2500u10-1", DocumentType::QuestionPaper, 2022, "GCSE", "Computer Science")
                .with_exam_paper("Unit 1: Understanding Computer Science"),
            IndexEntry::new("s22-2500u10-1-ms", DocumentType::MarkScheme, 2022, "GCSE", "Computer Science"),
        ]
    }

    #[test]
    fn empty_store_loads_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_entries().unwrap().is_empty());
        assert!(store.load_tree().unwrap().is_none());
        assert!(store.load_exam_records().unwrap().is_empty());
        assert!(store.latest_snapshot_at().unwrap().is_none());
    }

    #[test]
    fn entries_keep_their_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut list = entries();
        list.reverse();
        store.save_entries(&list).unwrap();
        assert_eq!(store.load_entries().unwrap(), list);

        // Saving a shorter list drops the rest
        store.save_entries(&list[..1]).unwrap();
        assert_eq!(store.load_entries().unwrap().len(), 1);
    }

    #[test]
    fn latest_tree_wins_and_old_snapshots_are_pruned() {
        let store = SqliteStore::open_in_memory().unwrap();
        let empty = HierarchicalTree::new();
        for _ in 0..(SNAPSHOT_RETENTION + 3) {
            store.save_tree(&empty).unwrap();
        }
        let tree = HierarchicalIndexReconciler::new().reconcile(&entries()).tree;
        store.save_tree(&tree).unwrap();

        assert_eq!(store.load_tree().unwrap(), Some(tree));
        assert_eq!(store.snapshot_count().unwrap(), SNAPSHOT_RETENTION as usize);
        assert!(store.latest_snapshot_at().unwrap().is_some());
    }

    #[test]
    fn exam_records_upsert_by_pair() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = ExamRecord {
            slot: UnitSlot::new("Computer Science", 2022, "GCSE", "1"),
            question_paper_id: "s22-2500u10-1".into(),
            mark_scheme_id: "s22-2500u10-1-ms".into(),
            questions: vec![Question::leaf("1", "Define RAM.", "Volatile memory", 1, ["AO1"])],
        };
        store.save_exam_record(&record).unwrap();
        record.questions.clear();
        store.save_exam_record(&record).unwrap();

        let records = store.load_exam_records().unwrap();
        assert_eq!(records, vec![record]);
    }

    #[test]
    fn reopening_a_file_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("index.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_entries(&entries()).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_entries().unwrap(), entries());
    }
}
