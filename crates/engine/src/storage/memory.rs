//! In-memory storage backend.
//!
//! One instance lives on the engine; handles clone cheaply and share the
//! same file table, so fixtures written by a test are visible to services
//! resolving the same engine.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult};
use crate::storage::{FileMeta, StorageService};

#[derive(Debug, Clone)]
struct MemoryEntry {
    content: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Shared in-memory file table keyed by full URL.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<RwLock<BTreeMap<String, MemoryEntry>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronously write a file, stamping it with the current time.
    pub fn write(&self, url: impl Into<String>, content: impl Into<Vec<u8>>) {
        let mut files = self.files.write().expect("memory storage lock poisoned");
        files.insert(
            url.into(),
            MemoryEntry {
                content: content.into(),
                modified: Utc::now(),
            },
        );
    }

    /// Synchronously write a file with an explicit modification time.
    pub fn write_at(
        &self,
        url: impl Into<String>,
        content: impl Into<Vec<u8>>,
        modified: DateTime<Utc>,
    ) {
        let mut files = self.files.write().expect("memory storage lock poisoned");
        files.insert(
            url.into(),
            MemoryEntry {
                content: content.into(),
                modified,
            },
        );
    }

    /// Remove a file.
    pub fn remove(&self, url: &str) -> bool {
        let mut files = self.files.write().expect("memory storage lock poisoned");
        files.remove(url).is_some()
    }
}

#[async_trait]
impl StorageService for MemoryStorage {
    async fn list(&self, url: &str) -> EngineResult<Vec<FileMeta>> {
        let prefix = format!("{}/", url.trim_end_matches('/'));
        let files = self.files.read().expect("memory storage lock poisoned");
        let mut result = Vec::new();
        for (stored_url, entry) in files.iter() {
            let Some(rest) = stored_url.strip_prefix(&prefix) else {
                continue;
            };
            // Only immediate children.
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            result.push(FileMeta {
                name: rest.to_string(),
                url: stored_url.clone(),
                size: entry.content.len() as u64,
                modified: entry.modified,
                is_dir: false,
            });
        }
        Ok(result)
    }

    async fn download(&self, url: &str) -> EngineResult<Vec<u8>> {
        let files = self.files.read().expect("memory storage lock poisoned");
        files
            .get(url)
            .map(|entry| entry.content.clone())
            .ok_or_else(|| EngineError::Storage(format!("no such entry: {}", url)))
    }

    async fn upload(&self, url: &str, content: Vec<u8>) -> EngineResult<()> {
        self.write(url, content);
        Ok(())
    }

    async fn exists(&self, url: &str) -> EngineResult<bool> {
        let files = self.files.read().expect("memory storage lock poisoned");
        Ok(files.contains_key(url))
    }
}
