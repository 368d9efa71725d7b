//! Per-session event log.
//!
//! Append-only, ordered, gap-free. Consumers either pull with
//! `events_since` or subscribe to a bounded channel; the channel is fed
//! after the append lock is released so subscriber code can query the log
//! without deadlocking the ingest path. A subscriber-fed log must have a
//! single appending task; channel ordering is guaranteed only under that
//! single-writer discipline (the backends' ingest tasks satisfy it).

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of runtime-emitted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Agent produced assistant output.
    AgentMessage,
    /// Agent invoked or finished a tool.
    ToolUse,
    /// Session status transition.
    StatusChange,
    /// Agent reported an error while running.
    AgentError,
    /// Agent signalled terminal completion.
    Completed,
    /// Anything the runtime emits that this crate does not interpret.
    Other(String),
}

impl EventKind {
    /// Map a runtime-emitted kind string onto the closed set, preserving
    /// unknown kinds verbatim.
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "message" | "agent_message" => EventKind::AgentMessage,
            "tool_use" | "tool_result" => EventKind::ToolUse,
            "status_change" => EventKind::StatusChange,
            "error" | "agent_error" => EventKind::AgentError,
            "completed" | "done" => EventKind::Completed,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// Immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing per session, gap-free, starting at 1.
    pub seq: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

struct EventLogInner {
    events: Vec<Event>,
    subscriber: Option<mpsc::Sender<Event>>,
}

/// Append-only ordered event sequence for one session.
pub struct EventLog {
    inner: Mutex<EventLogInner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EventLogInner {
                events: Vec::new(),
                subscriber: None,
            }),
        }
    }

    /// Attach a bounded subscriber channel and return its receiving end.
    ///
    /// Replaces any previous subscriber. Events appended before the
    /// subscription are not replayed; use `events_since` to catch up.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut inner = self.inner.lock().expect("event log poisoned");
        inner.subscriber = Some(tx);
        rx
    }

    /// Append an event, assigning the next sequence number.
    ///
    /// Returns the appended event. The subscriber send happens outside the
    /// lock; when the channel is full the event is dropped from the channel
    /// only, the log itself stays complete.
    pub fn append(&self, kind: EventKind, payload: serde_json::Value) -> Event {
        let (event, subscriber) = {
            let mut inner = self.inner.lock().expect("event log poisoned");
            let event = Event {
                seq: inner.events.len() as u64 + 1,
                kind,
                payload,
                timestamp: Utc::now(),
            };
            inner.events.push(event.clone());
            (event, inner.subscriber.clone())
        };

        // outside the lock; in-order delivery relies on the single-writer
        // discipline stated in the module doc
        if let Some(tx) = subscriber {
            if let Err(mpsc::error::TrySendError::Full(ev)) = tx.try_send(event.clone()) {
                warn!("event subscriber lagging, dropping seq {} from channel", ev.seq);
            }
        }

        event
    }

    /// Events with sequence numbers strictly greater than `since`.
    pub fn events_since(&self, since: u64) -> Vec<Event> {
        let inner = self.inner.lock().expect("event log poisoned");
        // seq N lives at index N-1
        inner
            .events
            .get(since as usize..)
            .map(<[Event]>::to_vec)
            .unwrap_or_default()
    }

    /// Highest sequence number appended so far (0 when empty).
    pub fn last_seq(&self) -> u64 {
        let inner = self.inner.lock().expect("event log poisoned");
        inner.events.len() as u64
    }
}
