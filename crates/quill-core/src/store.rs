//! Document storage for step results.
//!
//! [`JsonFileStore`] keeps one pretty-printed JSON file per project and
//! document kind:
//!
//! ```text
//! <data_dir>/projects/<project_id>/<kind>.json
//! <data_dir>/projects/<project_id>/<kind>.json.backup   (previous version)
//! ```
//!
//! Writes go to a temporary file that is renamed over the target, so readers
//! never observe a partially written document.

use async_trait::async_trait;
use quill_abstraction::{CapabilityError, DocumentStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

const DOCUMENT_EXTENSION: &str = ".json";
const BACKUP_EXTENSION: &str = ".json.backup";
const TEMP_EXTENSION: &str = ".json.tmp";

/// Errors that can occur in the document store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A project id or document kind is not a safe path component.
    #[error("Invalid key: '{0}'")]
    InvalidKey(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl From<StoreError> for CapabilityError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(e) => Self::Serialization(e.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Accepts non-empty keys made of `[A-Za-z0-9_-.]` that are not `.` or contain `..`.
pub fn validate_key(key: &str) -> StoreResult<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
    if key.is_empty() || key == "." || key.contains("..") || !key.chars().all(allowed) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, project_id: &str, kind: &str, document: &Value) -> Result<(), CapabilityError> {
        validate_key(project_id)?;
        validate_key(kind)?;
        self.documents
            .write()
            .await
            .entry(project_id.to_string())
            .or_default()
            .insert(kind.to_string(), document.clone());
        Ok(())
    }

    async fn get(&self, project_id: &str, kind: &str) -> Result<Option<Value>, CapabilityError> {
        Ok(self.documents.read().await.get(project_id).and_then(|docs| docs.get(kind)).cloned())
    }

    async fn list_kinds(&self, project_id: &str) -> Result<Vec<String>, CapabilityError> {
        Ok(self
            .documents
            .read()
            .await
            .get(project_id)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_projects(&self) -> Result<Vec<String>, CapabilityError> {
        Ok(self.documents.read().await.keys().cloned().collect())
    }
}

/// File-backed store under `<data_dir>/projects`.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    /// Serializes writers so temp files and backups are never shared.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Creates a store rooted at `data_dir`. Directories are created on first write.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self { root: data_dir.as_ref().join("projects"), write_lock: Mutex::new(()) }
    }

    /// Directory holding all projects.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, project_id: &str) -> StoreResult<PathBuf> {
        validate_key(project_id)?;
        Ok(self.root.join(project_id))
    }

    fn document_path(&self, project_id: &str, kind: &str, extension: &str) -> StoreResult<PathBuf> {
        validate_key(kind)?;
        Ok(self.project_dir(project_id)?.join(format!("{kind}{extension}")))
    }

    /// Writes a document, keeping the previous version as a backup.
    pub async fn save(&self, project_id: &str, kind: &str, document: &Value) -> StoreResult<()> {
        let dir = self.project_dir(project_id)?;
        let path = self.document_path(project_id, kind, DOCUMENT_EXTENSION)?;
        let backup = self.document_path(project_id, kind, BACKUP_EXTENSION)?;
        let temp = self.document_path(project_id, kind, TEMP_EXTENSION)?;
        let json = serde_json::to_string_pretty(document)?;

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        if fs::try_exists(&path).await.map_err(io_error(&path))? {
            fs::copy(&path, &backup).await.map_err(io_error(&backup))?;
        }

        fs::write(&temp, json).await.map_err(io_error(&temp))?;
        fs::rename(&temp, &path).await.map_err(io_error(&path))?;

        debug!(project_id = %project_id, kind = %kind, path = %path.display(), "Document saved");
        Ok(())
    }

    /// Reads the current version of a document.
    pub async fn load(&self, project_id: &str, kind: &str) -> StoreResult<Option<Value>> {
        let path = self.document_path(project_id, kind, DOCUMENT_EXTENSION)?;
        Self::read_json(&path).await
    }

    /// Reads the version a document had before its last overwrite.
    pub async fn load_backup(&self, project_id: &str, kind: &str) -> StoreResult<Option<Value>> {
        let path = self.document_path(project_id, kind, BACKUP_EXTENSION)?;
        Self::read_json(&path).await
    }

    async fn read_json(path: &Path) -> StoreResult<Option<Value>> {
        match fs::read_to_string(path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path)(e)),
        }
    }

    /// Names of the entries of `dir` accepted by `select`, sorted. A missing directory is empty.
    async fn list_dir(dir: &Path, select: impl Fn(&str, bool) -> Option<String>) -> StoreResult<Vec<String>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(dir)(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(dir))? {
            let is_dir = entry.file_type().await.map_err(io_error(&entry.path()))?.is_dir();
            if let Some(name) = entry.file_name().to_str() {
                if let Some(selected) = select(name, is_dir) {
                    names.push(selected);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn put(&self, project_id: &str, kind: &str, document: &Value) -> Result<(), CapabilityError> {
        Ok(self.save(project_id, kind, document).await?)
    }

    async fn get(&self, project_id: &str, kind: &str) -> Result<Option<Value>, CapabilityError> {
        Ok(self.load(project_id, kind).await?)
    }

    async fn list_kinds(&self, project_id: &str) -> Result<Vec<String>, CapabilityError> {
        let dir = self.project_dir(project_id)?;
        Ok(Self::list_dir(&dir, |name, is_dir| {
            if is_dir {
                return None;
            }
            name.strip_suffix(DOCUMENT_EXTENSION).map(str::to_string)
        })
        .await?)
    }

    async fn list_projects(&self) -> Result<Vec<String>, CapabilityError> {
        Ok(Self::list_dir(&self.root, |name, is_dir| is_dir.then(|| name.to_string())).await?)
    }
}
