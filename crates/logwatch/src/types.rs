//! Log tracking model.
//!
//! A [`LogType`] classifies files by mask and parsing rules; a [`LogFile`]
//! tracks one concrete file with its cached content, processing state, and
//! queue of unconsumed records; a [`LogTypeMeta`] binds a type to its source
//! and the files discovered for it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use runbook_engine::storage::{file_name, Resource};
use runbook_engine::{EngineError, EngineResult};

/// A configured class of log files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LogType {
    pub name: String,
    /// File name glob; `*` matches any run of characters.
    pub mask: String,
    /// Record format hint (`json` or plain text).
    pub format: String,
    /// Substring a line must contain to be queued.
    pub inclusion: String,
    /// Substring that drops a line when present.
    pub exclusion: String,
    /// Regex whose first capture group keys the record index.
    pub index_reg_expr: String,
}

impl LogType {
    /// Whether records of this type are indexed by a captured key.
    pub fn uses_index(&self) -> bool {
        !self.index_reg_expr.is_empty()
    }

    /// Compiled index expression, if configured.
    pub fn index_expr(&self) -> EngineResult<Option<Regex>> {
        if self.index_reg_expr.is_empty() {
            return Ok(None);
        }
        Regex::new(&self.index_reg_expr).map(Some).map_err(|e| {
            EngineError::Validation(format!(
                "invalid index expression for log type '{}': {}",
                self.name, e
            ))
        })
    }

    /// Compiled anchored file-name mask.
    pub fn mask_expr(&self) -> EngineResult<Regex> {
        let pattern = format!("^{}$", self.mask.replace('*', ".+"));
        Regex::new(&pattern).map_err(|e| {
            EngineError::Validation(format!(
                "invalid mask for log type '{}': {}",
                self.name, e
            ))
        })
    }
}

/// Extract the index key from a line: the first capture group, when
/// non-empty.
pub fn match_log_index(expr: &Regex, input: &str) -> Option<String> {
    expr.captures(input)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().to_string())
        .filter(|key| !key.is_empty())
}

/// Offset of the next unparsed byte and the number of consumed lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub line: usize,
    pub position: usize,
}

impl ProcessingState {
    fn reset(&mut self) {
        self.line = 0;
        self.position = 0;
    }
}

/// One queued log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub url: String,
    pub number: usize,
    pub line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_key: Option<String>,
}

impl LogRecord {
    /// Parse the line as a JSON value.
    pub fn as_json(&self) -> EngineResult<Value> {
        serde_json::from_str(&self.line).map_err(|e| {
            EngineError::Validation(format!(
                "failed to parse log record {}:{} as JSON: {}",
                file_name(&self.url),
                self.number,
                e
            ))
        })
    }
}

#[derive(Debug, Default)]
struct LogFileState {
    content: String,
    size: u64,
    last_modified: Option<DateTime<Utc>>,
    processing: ProcessingState,
    records: VecDeque<Arc<LogRecord>>,
    indexed: HashMap<String, Arc<LogRecord>>,
}

/// A tracked log file with its unconsumed record queue.
///
/// Interior state sits behind one lock per file; the tailer and assert
/// paths never hold it across I/O.
#[derive(Debug)]
pub struct LogFile {
    pub url: String,
    pub name: String,
    pub log_type: LogType,
    state: RwLock<LogFileState>,
}

impl LogFile {
    /// Track a newly discovered file.
    pub fn new(
        url: impl Into<String>,
        name: impl Into<String>,
        log_type: LogType,
        size: u64,
        modified: DateTime<Utc>,
    ) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            log_type,
            state: RwLock::new(LogFileState {
                size,
                last_modified: Some(modified),
                ..LogFileState::default()
            }),
        }
    }

    /// Whether the cached `(size, modified)` pair still matches.
    pub fn matches_cached(&self, size: u64, modified: DateTime<Utc>) -> bool {
        let state = self.state.read().expect("log file lock poisoned");
        state.size == size
            && state
                .last_modified
                .map(|cached| cached.timestamp() == modified.timestamp())
                .unwrap_or(false)
    }

    /// Cached modification time.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("log file lock poisoned").last_modified
    }

    /// Cached content size.
    pub fn size(&self) -> u64 {
        self.state.read().expect("log file lock poisoned").size
    }

    /// Current processing offsets.
    pub fn processing_state(&self) -> ProcessingState {
        self.state.read().expect("log file lock poisoned").processing
    }

    /// Whether unconsumed records are queued.
    pub fn has_pending(&self) -> bool {
        !self.state.read().expect("log file lock poisoned").records.is_empty()
    }

    /// Number of unconsumed records.
    pub fn pending_count(&self) -> usize {
        self.state.read().expect("log file lock poisoned").records.len()
    }

    /// Copy of the queued records, oldest first.
    pub fn records(&self) -> Vec<Arc<LogRecord>> {
        let state = self.state.read().expect("log file lock poisoned");
        state.records.iter().cloned().collect()
    }

    /// Number of indexed records.
    pub fn indexed_count(&self) -> usize {
        self.state.read().expect("log file lock poisoned").indexed.len()
    }

    /// Pop the oldest record, dropping its index entry.
    pub fn shift_record(&self) -> Option<Arc<LogRecord>> {
        let mut state = self.state.write().expect("log file lock poisoned");
        let record = state.records.pop_front()?;
        drop_index_entry(&mut state, &record);
        Some(record)
    }

    /// Pull the record stored under an index key; falls back to FIFO when
    /// the key is unknown.
    pub fn shift_record_by_index(&self, key: &str) -> Option<Arc<LogRecord>> {
        let mut state = self.state.write().expect("log file lock poisoned");
        if state.records.is_empty() {
            return None;
        }
        match state.indexed.remove(key) {
            Some(record) => {
                state.records.retain(|candidate| !Arc::ptr_eq(candidate, &record));
                Some(record)
            }
            None => {
                let record = state.records.pop_front()?;
                drop_index_entry(&mut state, &record);
                Some(record)
            }
        }
    }

    /// Mark everything read so far as consumed and clear the queue.
    pub fn reset_consumed(&self) {
        let mut state = self.state.write().expect("log file lock poisoned");
        state.processing = ProcessingState {
            position: state.size as usize,
            line: state.records.len(),
        };
        state.records.clear();
        state.indexed.clear();
    }

    /// Install freshly downloaded content and queue any new records.
    ///
    /// Rotation handling: content shorter than the cache means the file
    /// rolled over; grown content that is not an append means it was
    /// rewritten. Both reset the processing state so records re-emit from
    /// offset zero. A partial trailing line stays unconsumed until the
    /// next pass completes it.
    pub fn update_content(&self, content: String, modified: DateTime<Utc>) {
        let index_expr = self.log_type.index_expr().ok().flatten();
        let mut state = self.state.write().expect("log file lock poisoned");

        let rolled_over = state.content.len() > content.len();
        let rewritten = !rolled_over
            && (state.size as usize) < content.len()
            && !content.starts_with(state.content.as_str());
        if rolled_over || rewritten {
            state.processing.reset();
        }

        state.content = content;
        state.size = state.content.len() as u64;
        state.last_modified = Some(modified);
        read_pending_records(&mut state, &self.url, &self.log_type, index_expr.as_ref());
    }
}

fn drop_index_entry(state: &mut LogFileState, record: &Arc<LogRecord>) {
    if let Some(key) = &record.index_key {
        let matches = state
            .indexed
            .get(key)
            .map(|existing| Arc::ptr_eq(existing, record))
            .unwrap_or(false);
        if matches {
            state.indexed.remove(key);
        }
    }
}

/// Scan unparsed bytes, splitting on `\n` or `\r`, queueing each trimmed,
/// filter-passing line and advancing the processing state per line.
fn read_pending_records(
    state: &mut LogFileState,
    url: &str,
    log_type: &LogType,
    index_expr: Option<&Regex>,
) {
    let content = state.content.clone();
    let bytes = content.as_bytes();
    if state.processing.position > bytes.len() {
        return;
    }

    let mut line_buffer: Vec<u8> = Vec::new();
    let mut line_index = state.processing.line;
    let mut consumed = 0usize;

    for &byte in &bytes[state.processing.position..] {
        consumed += 1;
        if byte != b'\n' && byte != b'\r' {
            line_buffer.push(byte);
            continue;
        }

        let line = String::from_utf8_lossy(&line_buffer)
            .trim_matches(|c: char| c == ' ' || c == '\r' || c == '\t')
            .to_string();
        line_index += 1;

        let excluded = !log_type.exclusion.is_empty() && line.contains(&log_type.exclusion);
        let included = log_type.inclusion.is_empty() || line.contains(&log_type.inclusion);
        if !excluded && included && !line.is_empty() {
            let index_key = index_expr.and_then(|expr| match_log_index(expr, &line));
            let record = Arc::new(LogRecord {
                url: url.to_string(),
                number: line_index,
                line,
                index_key: index_key.clone(),
            });
            state.records.push_back(Arc::clone(&record));
            if let Some(key) = index_key {
                state.indexed.insert(key, record);
            }
        }

        state.processing.position += consumed;
        state.processing.line = line_index;
        consumed = 0;
        line_buffer.clear();
    }
}

/// A log type bound to its source and discovered files.
#[derive(Debug)]
pub struct LogTypeMeta {
    pub source: Resource,
    pub log_type: LogType,
    files: RwLock<HashMap<String, Arc<LogFile>>>,
}

impl LogTypeMeta {
    /// Bind a type to its source.
    pub fn new(source: Resource, log_type: LogType) -> Self {
        Self {
            source,
            log_type,
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Tracked file by name.
    pub fn file(&self, name: &str) -> Option<Arc<LogFile>> {
        let files = self.files.read().expect("log meta lock poisoned");
        files.get(name).cloned()
    }

    /// Fetch or start tracking a file. Returns the handle and whether this
    /// call created it.
    pub fn file_or_create(
        &self,
        name: &str,
        url: &str,
        size: u64,
        modified: DateTime<Utc>,
    ) -> (Arc<LogFile>, bool) {
        let mut files = self.files.write().expect("log meta lock poisoned");
        match files.get(name) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                let file = Arc::new(LogFile::new(
                    url,
                    name,
                    self.log_type.clone(),
                    size,
                    modified,
                ));
                files.insert(name.to_string(), Arc::clone(&file));
                (file, true)
            }
        }
    }

    /// Handles to all tracked files.
    pub fn files_snapshot(&self) -> Vec<Arc<LogFile>> {
        let files = self.files.read().expect("log meta lock poisoned");
        files.values().cloned().collect()
    }

    /// JSON snapshot installed into context state and listen responses.
    pub fn as_value(&self) -> Value {
        let mut files = Map::new();
        for file in self.files_snapshot() {
            files.insert(
                file.name.clone(),
                json!({
                    "URL": file.url,
                    "Size": file.size(),
                    "PendingRecords": file.pending_count(),
                    "LastModified": file.last_modified(),
                }),
            );
        }
        json!({
            "Source": serde_json::to_value(&self.source).unwrap_or(Value::Null),
            "LogType": serde_json::to_value(&self.log_type).unwrap_or(Value::Null),
            "LogFiles": files,
        })
    }
}
