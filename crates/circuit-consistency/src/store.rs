//! Durable map of image id to analysis record.
//!
//! The persisted form is one JSON object keyed by image id. A record counts
//! as done when it is present and non-empty; that is the only resume signal.
//! [`JsonResultStore::flush`] writes a temporary file in the target directory
//! and renames it over the old one, so a crash leaves either the previous or
//! the new file, never a torn one. The write runs on the blocking pool.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::ImageRecord;

/// File name of the results map inside the output directory.
pub const RESULTS_FILE: &str = "model_analysis.json";

/// Storage for per-image records.
#[async_trait]
pub trait ResultStore: Send {
    /// All records currently held.
    fn records(&self) -> &BTreeMap<String, ImageRecord>;

    /// Insert or replace a record in memory.
    fn upsert(&mut self, image_id: &str, record: ImageRecord);

    /// Make every upserted record durable.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the records cannot be written.
    async fn flush(&mut self) -> Result<(), StoreError>;

    fn get(&self, image_id: &str) -> Option<&ImageRecord> {
        self.records().get(image_id)
    }

    /// Present with a non-empty value.
    fn is_done(&self, image_id: &str) -> bool {
        self.get(image_id).is_some_and(|r| !r.is_empty())
    }
}

/// Results kept in a single JSON file.
#[derive(Debug)]
pub struct JsonResultStore {
    path: PathBuf,
    records: BTreeMap<String, ImageRecord>,
    dirty: bool,
}

impl JsonResultStore {
    /// Open the store at `path`, loading existing records. A missing file is
    /// an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the file exists but is not a valid
    /// results map; the file is left untouched.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = load(&path)?;
        if !records.is_empty() {
            info!("Loaded {} existing records from {}", records.len(), path.display());
        }
        Ok(Self {
            path,
            records,
            dirty: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a results map from disk.
///
/// # Errors
///
/// Fails on unreadable or malformed files.
pub fn load(path: &Path) -> Result<BTreeMap<String, ImageRecord>, StoreError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Serialize `value` and atomically replace `path` with it.
///
/// # Errors
///
/// Fails if the temporary file cannot be written or renamed.
pub fn write_json_atomic<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &json)
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|source| StoreError::Persist {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[async_trait]
impl ResultStore for JsonResultStore {
    fn records(&self) -> &BTreeMap<String, ImageRecord> {
        &self.records
    }

    fn upsert(&mut self, image_id: &str, record: ImageRecord) {
        self.records.insert(image_id.to_string(), record);
        self.dirty = true;
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty && self.path.exists() {
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(&self.records)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_bytes_atomic(&path, &json))
            .await
            .map_err(|err| StoreError::Io {
                path: self.path.clone(),
                source: std::io::Error::other(err),
            })??;
        self.dirty = false;
        debug!("Flushed {} records to {}", self.records.len(), self.path.display());
        Ok(())
    }
}

/// Non-durable store.
#[derive(Debug, Default, Clone)]
pub struct MemoryResultStore {
    records: BTreeMap<String, ImageRecord>,
    /// Number of flush calls.
    pub flushes: usize,
}

impl MemoryResultStore {
    #[must_use]
    pub const fn new(records: BTreeMap<String, ImageRecord>) -> Self {
        Self {
            records,
            flushes: 0,
        }
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    fn records(&self) -> &BTreeMap<String, ImageRecord> {
        &self.records
    }

    fn upsert(&mut self, image_id: &str, record: ImageRecord) {
        self.records.insert(image_id.to_string(), record);
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectedComponent;
    use tempfile::TempDir;

    fn record() -> ImageRecord {
        let mut r = ImageRecord::default();
        r.components
            .insert("(0, 0, 10, 10)".into(), DetectedComponent::default());
        r
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = JsonResultStore::open(dir.path().join(RESULTS_FILE)).unwrap();
        assert!(store.records().is_empty());
        assert!(!store.is_done("a.png"));
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join(RESULTS_FILE);

        let mut store = JsonResultStore::open(&path).unwrap();
        store.upsert("a/b.png", record());
        store.upsert("c.png", ImageRecord::default());
        store.flush().await.unwrap();

        let reopened = JsonResultStore::open(&path).unwrap();
        assert!(reopened.is_done("a/b.png"));
        // present but empty is not done
        assert!(!reopened.is_done("c.png"));
        assert_eq!(reopened.get("a/b.png"), Some(&record()));
    }

    #[tokio::test]
    async fn test_flush_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        let mut store = JsonResultStore::open(&path).unwrap();
        store.upsert("a.png", record());
        store.flush().await.unwrap();
        store.upsert("b.png", record());
        store.flush().await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(RESULTS_FILE)]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonResultStore::open(&path),
            Err(StoreError::Corrupt { .. })
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[tokio::test]
    async fn test_clean_store_skips_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        let mut store = JsonResultStore::open(&path).unwrap();
        store.upsert("a.png", record());
        store.flush().await.unwrap();
        std::fs::write(&path, "{}").unwrap();

        // nothing upserted since the last flush
        store.flush().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_upsert_overwrites() {
        let mut store = MemoryResultStore::default();
        store.upsert("a.png", ImageRecord::default());
        assert!(!store.is_done("a.png"));
        store.upsert("a.png", record());
        assert!(store.is_done("a.png"));
        assert_eq!(store.records().len(), 1);
    }
}
