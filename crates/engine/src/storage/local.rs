//! Local filesystem backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult};
use crate::storage::{join_url, FileMeta, StorageService};

/// Storage over the local filesystem; accepts `file://` URLs or plain paths.
#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    /// Create a local storage handle.
    pub fn new() -> Self {
        Self
    }

    fn to_path(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl StorageService for LocalStorage {
    async fn list(&self, url: &str) -> EngineResult<Vec<FileMeta>> {
        let base = Self::to_path(url);
        let mut entries = tokio::fs::read_dir(&base).await.map_err(|e| {
            EngineError::Storage(format!("failed to list {}: {}", base.display(), e))
        })?;
        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            result.push(FileMeta {
                url: join_url(url, &name),
                name,
                size: metadata.len(),
                modified: modified_time(&metadata),
                is_dir: metadata.is_dir(),
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn download(&self, url: &str) -> EngineResult<Vec<u8>> {
        let path = Self::to_path(url);
        tokio::fs::read(&path).await.map_err(|e| {
            EngineError::Storage(format!("failed to read {}: {}", path.display(), e))
        })
    }

    async fn upload(&self, url: &str, content: Vec<u8>) -> EngineResult<()> {
        let path = Self::to_path(url);
        if let Some(parent) = Path::new(&path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await.map_err(|e| {
            EngineError::Storage(format!("failed to write {}: {}", path.display(), e))
        })
    }

    async fn exists(&self, url: &str) -> EngineResult<bool> {
        Ok(tokio::fs::try_exists(Self::to_path(url)).await.unwrap_or(false))
    }
}
