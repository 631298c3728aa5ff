//! Record Store
//!
//! Per-record file persistence: one JSON file per record id under a
//! base directory. Every operation is a one-shot filesystem access;
//! concurrent saves to the same id are not serialized and the last
//! completed write wins.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::Record;

/// Extension of record files
pub const RECORD_EXTENSION: &str = "json";

/// Anything that can produce a full snapshot of records
#[async_trait]
pub trait RecordSource<R>: Send + Sync {
    /// Load every readable record
    async fn load_all(&self) -> Vec<R>;
}

/// File-backed record store
#[derive(Debug)]
pub struct RecordStore<R> {
    /// Directory holding `<id>.json` files
    base_dir: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for RecordStore<R> {
    fn clone(&self) -> Self {
        Self {
            base_dir: self.base_dir.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> RecordStore<R> {
    /// Create a store rooted at `base_dir`. The directory is created lazily on first save.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            _record: PhantomData,
        }
    }

    /// Store directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the file for `id`. Ids that could escape the store directory are rejected.
    pub fn record_path(&self, id: &str) -> Result<PathBuf> {
        let invalid = id.is_empty()
            || id.starts_with('.')
            || id.contains(['/', '\\', '\0']);
        if invalid {
            return Err(Error::InvalidRecordId(id.to_string()));
        }
        Ok(self.base_dir.join(format!("{}.{}", id, RECORD_EXTENSION)))
    }

    /// Persist the full record, overwriting any previous copy.
    /// Returns false after logging on any failure.
    pub async fn save_record(&self, record: &R) -> bool {
        match self.write_record(record).await {
            Ok(path) => {
                tracing::debug!("Saved record {} to {:?}", record.id(), path);
                true
            }
            Err(e) => {
                tracing::error!("Failed to save record {}: {}", record.id(), e);
                false
            }
        }
    }

    async fn write_record(&self, record: &R) -> Result<PathBuf> {
        let path = self.record_path(record.id())?;
        let body = serde_json::to_vec(record)?;

        tokio::fs::create_dir_all(&self.base_dir).await?;

        // Readers never observe a half-written file
        let tmp = self.base_dir.join(format!(
            ".{}.{}.tmp",
            record.id(),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = tokio::fs::write(&tmp, &body).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(path)
    }

    /// Load a single record. A missing file and an unparseable file both
    /// yield `None`; only the log tells them apart.
    pub async fn load_one(&self, id: &str) -> Option<R> {
        let path = match self.record_path(id) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Refusing to load record: {}", e);
                return None;
            }
        };
        read_record(&path).await
    }

    /// Load every record in the store directory. Unreadable files are skipped.
    pub async fn load_all(&self) -> Vec<R> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Store directory {:?} does not exist yet", self.base_dir);
                return Vec::new();
            }
            Err(e) => {
                tracing::error!("Error reading store directory {:?}: {}", self.base_dir, e);
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Error listing store directory {:?}: {}", self.base_dir, e);
                    break;
                }
            };

            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }
            if let Some(record) = read_record(&path).await {
                records.push(record);
            }
        }

        records
    }
}

#[async_trait]
impl<R: Record> RecordSource<R> for RecordStore<R> {
    async fn load_all(&self) -> Vec<R> {
        RecordStore::load_all(self).await
    }
}

fn is_record_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| !n.starts_with('.'));
    visible && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
}

async fn read_record<R: Record>(path: &Path) -> Option<R> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::error!("Error accessing record file {:?}: {}", path, e);
            return None;
        }
    };

    match serde_json::from_slice(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::error!("Error parsing record file {:?}: {}", path, e);
            None
        }
    }
}
