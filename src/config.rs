//! YAML configuration
//!
//! Looked up in order: an explicit path, `$EXAMINDEX_CONFIG`, then
//! `<config dir>/examindex/config.yaml`. With none of those present the
//! built-in defaults apply. Every field has a default, so a config file
//! only needs the values it changes.

use crate::align::{DEFAULT_STRICT_JSON_NOTE, DEFAULT_WINDOW_SIZE};
use crate::metadata::DEFAULT_MAX_SCAN_PAGES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV: &str = "EXAMINDEX_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub data_dir: PathBuf,
    pub index_file: String,
    pub hierarchical_file: String,
    pub exam_records_file: String,
    pub backend: Backend,
    /// SQLite database; defaults to `<data_dir>/examindex.db`
    pub database: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            index_file: "index.json".to_string(),
            hierarchical_file: "hierarchical_index.json".to_string(),
            exam_records_file: "exam_records.json".to_string(),
            backend: Backend::Json,
            database: None,
        }
    }
}

impl IndexConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir.join("examindex.db"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub window_size: usize,
    pub max_attempts: u32,
    pub strict_json_note: String,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_attempts: 2,
            strict_json_note: DEFAULT_STRICT_JSON_NOTE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Program and arguments; the prompt is written to its stdin
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub max_scan_pages: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            max_scan_pages: DEFAULT_MAX_SCAN_PAGES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggingConfig {
    /// Qualification name → specification document path
    pub specifications: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub alignment: AlignmentConfig,
    pub batch: BatchConfig,
    pub llm: LlmConfig,
    pub metadata: MetadataConfig,
    pub tagging: TaggingConfig,
}

/// Default data directory (~/.local/share/examindex)
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"))
        .join("examindex")
}

/// Default config file (~/.config/examindex/config.yaml)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("examindex").join("config.yaml"))
}

impl Config {
    pub fn from_yaml(yaml: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml, path)
    }

    /// Resolve and load the configuration.
    ///
    /// An explicit or environment path must exist; the default location is
    /// optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            return Self::from_file(PathBuf::from(path));
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }
}
