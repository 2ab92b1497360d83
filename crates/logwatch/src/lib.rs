//! Log validation service for the runbook engine.
//!
//! Tails log files through the engine's storage backends, parses them into
//! record queues, optionally indexes records by a regex-captured key, and
//! asserts expected records against what arrived:
//!
//! - **listen**: install log types and start a tailer over their source
//! - **assert**: validate queued records with a bounded wait
//! - **reset**: discard everything queued so far
//!
//! ## Modules
//!
//! - [`types`]: log types, tracked files, record queues
//! - [`reader`]: discovery and incremental reads
//! - [`iterator`]: cross-file record iteration
//! - [`service`]: the service surface

pub mod iterator;
pub mod reader;
pub mod service;
pub mod types;

pub use iterator::LogRecordIterator;
pub use service::{
    ExpectedLogRecords, LogValidatorAssertRequest, LogValidatorAssertResponse,
    LogValidatorListenRequest, LogValidatorResetRequest, LogValidatorService,
    LOG_VALIDATOR_SERVICE_ID,
};
pub use types::{LogFile, LogRecord, LogType, LogTypeMeta, ProcessingState};
