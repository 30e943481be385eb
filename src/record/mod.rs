//! Event sourcing: append-only recording of sessions and deterministic
//! replay.
//!
//! The [`EventStore`] contract assigns strictly increasing, contiguous
//! sequence numbers per stream and never reorders or renumbers. Stores may
//! be in-memory, file-backed, or remote; [`MemoryStore`] is the built-in
//! reference implementation. The [`Recorder`](recorder::Recorder) writes,
//! the [`Replayer`](replay::Replayer) folds events back into state.

pub mod recorder;
pub mod replay;

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use recorder::Recorder;
pub use replay::{CorruptionFinding, CorruptionKind, Replayer, SessionState};

use crate::error::{ErrorKind, Result, RetryReason};
use crate::event::now_ms;
use crate::guardrail::Violation;

/// The logical payload of one recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordPayload {
    /// Session opened; carries an options summary for later inspection.
    Start { options: Value },
    /// One token as it was accepted into the session content.
    Token { value: String, index: usize },
    /// Checkpoint captured at the given token index.
    Checkpoint { index: usize, content: String },
    /// Terminal success with the authoritative final content.
    Complete { content: String, token_count: usize },
    /// An error observed during the session.
    Error {
        kind: ErrorKind,
        message: String,
        recoverable: bool,
    },
    /// A retry decision. `will_retry` is false when budgets were exhausted.
    Retry {
        reason: RetryReason,
        attempt: u32,
        will_retry: bool,
    },
    /// Promotion to the fallback producer at `index`.
    Fallback { index: usize },
    /// Continuation taken from a checkpoint.
    Continuation { token_index: usize, content: String },
    /// Guardrail findings at a token position.
    Guardrail {
        at_token: usize,
        violations: Vec<Violation>,
    },
}

/// One persisted event. `seq` is contiguous per stream starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub seq: u64,
    pub stream_id: String,
    pub ts: u64,
    pub event: RecordPayload,
}

/// Append-only event log keyed by stream id.
///
/// `append` is linearizable per stream id; implementations may serialize
/// all writes or partition by stream. Reordering or renumbering is
/// forbidden. The trait is async so file-backed and remote stores fit;
/// appends are a session suspension point.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, assigning the next sequence number for the stream.
    async fn append(&self, stream_id: &str, payload: RecordPayload) -> Result<RecordedEvent>;

    /// Every event of a stream, in sequence order.
    async fn events(&self, stream_id: &str) -> Result<Vec<RecordedEvent>>;

    /// All known stream ids.
    async fn stream_ids(&self) -> Vec<String>;
}

/// In-memory store, suitable for tests and single-process use.
#[derive(Default)]
pub struct MemoryStore {
    streams: Mutex<BTreeMap<String, Vec<RecordedEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, stream_id: &str, payload: RecordPayload) -> Result<RecordedEvent> {
        let mut streams = self.streams.lock().unwrap();
        let events = streams.entry(stream_id.to_string()).or_default();
        let event = RecordedEvent {
            seq: events.len() as u64,
            stream_id: stream_id.to_string(),
            ts: now_ms(),
            event: payload,
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn events(&self, stream_id: &str) -> Result<Vec<RecordedEvent>> {
        Ok(self
            .streams
            .lock()
            .unwrap()
            .get(stream_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn stream_ids(&self) -> Vec<String> {
        self.streams.lock().unwrap().keys().cloned().collect()
    }
}
