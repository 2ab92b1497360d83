//! Cross-file record iteration.
//!
//! Walks a log type's files ordered by modification time (newest first,
//! URL descending as tiebreaker), consuming queued records. When the
//! iterator runs off the end it lazily refreshes its file list, picking up
//! files the tailer discovered in the meantime.

use std::sync::Arc;

use crate::types::{LogFile, LogRecord, LogTypeMeta};

/// Iterator over a log type's unconsumed records.
pub struct LogRecordIterator {
    meta: Arc<LogTypeMeta>,
    files: Vec<Arc<LogFile>>,
    file_index: usize,
}

impl LogRecordIterator {
    /// Build an iterator over the meta's current files.
    pub fn new(meta: Arc<LogTypeMeta>) -> Self {
        let files = sorted_files(&meta);
        Self {
            meta,
            files,
            file_index: 0,
        }
    }

    /// Whether any file still has pending records; positions the iterator
    /// on the first such file.
    pub fn has_next(&mut self) -> bool {
        loop {
            if self.file_index >= self.files.len() {
                self.files = sorted_files(&self.meta);
                for (index, file) in self.files.iter().enumerate() {
                    if file.has_pending() {
                        self.file_index = index;
                        return true;
                    }
                }
                // Park past the end so the next call refreshes again.
                self.file_index = self.files.len();
                return false;
            }
            if self.files[self.file_index].has_pending() {
                return true;
            }
            self.file_index += 1;
        }
    }

    /// Consume the oldest record of the current file.
    pub fn next_record(&mut self) -> Option<Arc<LogRecord>> {
        self.files.get(self.file_index)?.shift_record()
    }

    /// Consume by index key from the current file, FIFO when the key is
    /// not indexed.
    pub fn next_indexed(&mut self, key: &str) -> Option<Arc<LogRecord>> {
        self.files.get(self.file_index)?.shift_record_by_index(key)
    }
}

fn sorted_files(meta: &LogTypeMeta) -> Vec<Arc<LogFile>> {
    let mut files = meta.files_snapshot();
    files.sort_by(|a, b| {
        b.last_modified()
            .cmp(&a.last_modified())
            .then_with(|| b.url.cmp(&a.url))
    });
    files
}
