//! Pluggable storage backends.
//!
//! Resources are addressed by URL; the scheme selects the backend. Two
//! backends ship: the local filesystem and an engine-owned in-memory store
//! used by tests and fixtures. The state flag [`USE_MEMORY_SERVICE`] forces
//! the in-memory backend regardless of scheme.

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// State key that routes all storage access to the in-memory backend.
pub const USE_MEMORY_SERVICE: &str = "UseMemoryService";

/// A storage location with an optional credential reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "URL")]
    pub url: String,
    pub credential: String,
}

impl Resource {
    /// Create a resource from a URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: String::new(),
        }
    }

    /// URL scheme, or empty for plain paths.
    pub fn scheme(&self) -> &str {
        match self.url.find("://") {
            Some(position) => &self.url[..position],
            None => "",
        }
    }
}

/// Last path segment of a URL.
pub fn file_name(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}

/// Join a child name onto a base URL.
pub fn join_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Metadata of one stored file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub url: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

/// Uniform access to a storage backend.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// List the immediate children of a URL.
    async fn list(&self, url: &str) -> EngineResult<Vec<FileMeta>>;

    /// Download the full content of a file.
    async fn download(&self, url: &str) -> EngineResult<Vec<u8>>;

    /// Write the full content of a file.
    async fn upload(&self, url: &str, content: Vec<u8>) -> EngineResult<()>;

    /// Whether a file exists at the URL.
    async fn exists(&self, url: &str) -> EngineResult<bool>;
}
