//! File-based event sink.
//!
//! Writes one JSON file per event under a session directory:
//! `<directory>/<sequence>.json`. The directory is created lazily on the
//! first event.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::EngineResult;
use crate::event::Event;

/// Sequential JSON event writer.
#[derive(Debug)]
pub struct EventLogger {
    directory: PathBuf,
    sequence: AtomicUsize,
}

impl EventLogger {
    /// Create a logger writing into `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            sequence: AtomicUsize::new(0),
        }
    }

    /// Directory this logger writes into.
    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    /// Write the next event file.
    pub fn log(&self, event: &Event) -> EngineResult<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        if sequence == 0 {
            std::fs::create_dir_all(&self.directory)?;
        }
        let path = self.directory.join(format!("{:05}.json", sequence));
        let body = serde_json::to_vec_pretty(event)?;
        std::fs::write(path, body)?;
        Ok(())
    }
}
