//! Session bookkeeping.
//!
//! The engine keeps one entry per active session id. The first request
//! carrying an id inserts it; async workflow completion schedules removal.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// A tracked session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub started: DateTime<Utc>,
}

/// Engine-wide table of active sessions.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the session if absent. Returns `true` when this call
    /// created the entry.
    pub fn start(&self, session_id: &str) -> bool {
        let mut sessions = self.inner.lock().expect("session table lock poisoned");
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                session_id: session_id.to_string(),
                started: Utc::now(),
            },
        );
        true
    }

    /// Whether the session is tracked.
    pub fn has(&self, session_id: &str) -> bool {
        let sessions = self.inner.lock().expect("session table lock poisoned");
        sessions.contains_key(session_id)
    }

    /// Drop the session. Returns `true` when an entry was removed.
    pub fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.inner.lock().expect("session table lock poisoned");
        sessions.remove(session_id).is_some()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        let sessions = self.inner.lock().expect("session table lock poisoned");
        sessions.len()
    }

    /// Whether no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
