//! Event stream primitives.
//!
//! Every context owns an ordered stream of tagged events. Async workers
//! accumulate events into their own streams and the runtime folds them back
//! into the parent at join time.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
}

/// A timestamped, typed event with a free-form payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub level: EventLevel,
    pub payload: Value,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, level: EventLevel, payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            level,
            payload,
        }
    }
}

/// Ordered, shareable event buffer.
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event.
    pub fn push(&self, event: Event) {
        let mut events = self.events.lock().expect("event stream lock poisoned");
        events.push(event);
    }

    /// Append a batch of events, preserving their order.
    pub fn extend(&self, batch: Vec<Event>) {
        let mut events = self.events.lock().expect("event stream lock poisoned");
        events.extend(batch);
    }

    /// Take all buffered events out of the stream.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = self.events.lock().expect("event stream lock poisoned");
        std::mem::take(&mut *events)
    }

    /// Copy of the buffered events.
    pub fn snapshot(&self) -> Vec<Event> {
        let events = self.events.lock().expect("event stream lock poisoned");
        events.clone()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        let events = self.events.lock().expect("event stream lock poisoned");
        events.len()
    }

    /// Whether the stream is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
