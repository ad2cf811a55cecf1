//! Persistence for extracted events.
//!
//! One record is written per successful extraction. [`MemoryRecordStore`]
//! backs tests; [`FileRecordStore`] keeps a JSON array on disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec::now_millis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub event: Value,
}

impl StoredRecord {
    fn new(event: Value) -> Self {
        Self {
            id: format!("rec_{}", uuid::Uuid::new_v4().simple()),
            created_at: now_millis(),
            event,
        }
    }
}

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist one event, returning its record id.
    async fn save(&self, event: Value) -> Result<String>;

    /// Every record, oldest first.
    async fn list(&self) -> Result<Vec<StoredRecord>>;
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<HashMap<String, StoredRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, event: Value) -> Result<String> {
        let record = StoredRecord::new(event);
        let id = record.id.clone();
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), record);
        debug!("MemoryRecordStore: stored '{}'", id);
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<StoredRecord>> {
        let mut records: Vec<StoredRecord> = self
            .inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

/// JSON-array file, loaded on open and rewritten on every save.
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    records: Mutex<Vec<StoredRecord>>,
}

impl FileRecordStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse record file {:?}", path))?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        debug!("FileRecordStore: loaded {} records from {:?}", records.len(), path);
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &[StoredRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordStore for FileRecordStore {
    async fn save(&self, event: Value) -> Result<String> {
        let mut records = self.records.lock().await;
        let record = StoredRecord::new(event);
        let id = record.id.clone();
        records.push(record);
        if let Err(e) = self.persist(&records).await {
            records.pop();
            return Err(e);
        }
        debug!("FileRecordStore: stored '{}' ({} total)", id, records.len());
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<StoredRecord>> {
        Ok(self.records.lock().await.clone())
    }
}
