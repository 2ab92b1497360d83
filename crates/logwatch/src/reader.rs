//! Discovery and incremental reading of tracked files.
//!
//! Lists a source's children, matches them against each type's mask, and
//! feeds matching files through the per-file tail logic. The registry lock
//! is only held to materialize handles; download and parse run unlocked.

use std::collections::HashMap;
use std::sync::Arc;

use runbook_engine::storage::{FileMeta, Resource, StorageService};
use runbook_engine::EngineResult;

use crate::service::LogValidatorService;
use crate::types::{LogType, LogTypeMeta};

impl LogValidatorService {
    /// Scan the source and ingest every file matching one of the types.
    /// Returns the metas touched by this pass, keyed by type name.
    pub(crate) async fn read_log_files(
        &self,
        storage: &Arc<dyn StorageService>,
        source: &Resource,
        types: &[LogType],
    ) -> EngineResult<HashMap<String, Arc<LogTypeMeta>>> {
        let candidates = storage.list(&source.url).await?;
        let mut touched = HashMap::new();
        for candidate in &candidates {
            if candidate.is_dir {
                continue;
            }
            for log_type in types {
                let mask = log_type.mask_expr()?;
                if !mask.is_match(&candidate.name) {
                    continue;
                }
                let meta = self.read_log_file(storage, source, candidate, log_type).await?;
                touched.insert(log_type.name.clone(), meta);
            }
        }
        Ok(touched)
    }

    /// Ingest a single file: materialize its handles under the registry
    /// lock, skip when the cached `(size, modified)` pair is unchanged,
    /// otherwise download and parse the new content.
    async fn read_log_file(
        &self,
        storage: &Arc<dyn StorageService>,
        source: &Resource,
        candidate: &FileMeta,
        log_type: &LogType,
    ) -> EngineResult<Arc<LogTypeMeta>> {
        let meta = {
            let mut registry = self.registry.lock().expect("log meta registry lock poisoned");
            Arc::clone(registry.entry(log_type.name.clone()).or_insert_with(|| {
                Arc::new(LogTypeMeta::new(source.clone(), log_type.clone()))
            }))
        };
        let (file, created) = meta.file_or_create(
            &candidate.name,
            &candidate.url,
            candidate.size,
            candidate.modified,
        );
        if !created && file.matches_cached(candidate.size, candidate.modified) {
            return Ok(meta);
        }

        let bytes = storage.download(&candidate.url).await?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        file.update_content(content, candidate.modified);
        Ok(meta)
    }
}
