//! Access to the raw CSV sources behind ingested datasets.
//!
//! The fallback and fragmented strategies re-read the original file at
//! question time, so the processor needs a handle back to the bytes that
//! were ingested. [`DirCsvStore`] maps a source id to `<dir>/<source_id>.csv`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::table::Table;

#[async_trait]
pub trait CsvStore: Send + Sync {
    /// Load and parse the CSV registered under `source_id`.
    async fn load(&self, source_id: &str) -> Result<Table>;

    /// Register raw CSV text under a source id.
    async fn put(&self, source_id: &str, raw: &str) -> Result<()>;
}

/// Directory-backed store: one file per source id.
pub struct DirCsvStore {
    dir: PathBuf,
}

impl DirCsvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, source_id: &str) -> Result<PathBuf> {
        // Source ids become file names; refuse anything that could escape
        // the directory.
        if source_id.is_empty()
            || source_id.contains('/')
            || source_id.contains('\\')
            || source_id.contains("..")
        {
            return Err(CoreError::InvalidInput(format!(
                "invalid source id: {:?}",
                source_id
            )));
        }
        Ok(self.dir.join(format!("{}.csv", source_id)))
    }
}

#[async_trait]
impl CsvStore for DirCsvStore {
    async fn load(&self, source_id: &str) -> Result<Table> {
        let path = self.path_for(source_id)?;
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(format!("no CSV registered for {}", source_id))
            } else {
                CoreError::Storage(format!("reading {}: {}", path.display(), e))
            }
        })?;
        Table::parse_csv(&raw)
    }

    async fn put(&self, source_id: &str, raw: &str) -> Result<()> {
        let path = self.path_for(source_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CoreError::Storage(format!("creating {}: {}", self.dir.display(), e)))?;
        tokio::fs::write(&path, raw)
            .await
            .map_err(|e| CoreError::Storage(format!("writing {}: {}", path.display(), e)))?;
        Ok(())
    }
}

/// In-memory store for tests.
pub struct InMemoryCsvStore {
    files: Mutex<HashMap<String, String>>,
}

impl InMemoryCsvStore {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCsvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CsvStore for InMemoryCsvStore {
    async fn load(&self, source_id: &str) -> Result<Table> {
        let raw = self
            .files
            .lock()
            .unwrap()
            .get(source_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("no CSV registered for {}", source_id)))?;
        Table::parse_csv(&raw)
    }

    async fn put(&self, source_id: &str, raw: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(source_id.to_string(), raw.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dir_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCsvStore::new(dir.path());
        store.put("sales", "a,b\n1,2\n").await.unwrap();
        let table = store.load("sales").await.unwrap();
        assert_eq!(table.columns, vec!["a", "b"]);
        assert_eq!(table.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCsvStore::new(dir.path());
        assert!(matches!(
            store.load("ghost").await.unwrap_err(),
            CoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCsvStore::new(dir.path());
        assert!(matches!(
            store.load("../etc/passwd").await.unwrap_err(),
            CoreError::InvalidInput(_)
        ));
    }
}
