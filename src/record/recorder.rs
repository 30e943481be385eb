//! The writing half of the event-sourcing layer.

use std::sync::Arc;

use serde_json::Value;

use super::{EventStore, RecordPayload, RecordedEvent};
use crate::error::{Result, RetryReason, StreamError};
use crate::guardrail::Violation;
use crate::session::Checkpoint;

/// Records one session's events into an [`EventStore`].
///
/// Each method wraps the corresponding [`RecordPayload`] and appends it.
/// The recorder is cheap to clone and tied to a single stream id.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn EventStore>,
    stream_id: String,
}

impl Recorder {
    pub fn new(store: Arc<dyn EventStore>, stream_id: impl Into<String>) -> Self {
        Self {
            store,
            stream_id: stream_id.into(),
        }
    }

    /// The stream this recorder writes to.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Underlying store handle, for constructing a replayer.
    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    pub async fn record_start(&self, options: Value) -> Result<RecordedEvent> {
        self.append(RecordPayload::Start { options }).await
    }

    pub async fn record_token(
        &self,
        value: impl Into<String>,
        index: usize,
    ) -> Result<RecordedEvent> {
        self.append(RecordPayload::Token {
            value: value.into(),
            index,
        })
        .await
    }

    pub async fn record_checkpoint(
        &self,
        index: usize,
        content: impl Into<String>,
    ) -> Result<RecordedEvent> {
        self.append(RecordPayload::Checkpoint {
            index,
            content: content.into(),
        })
        .await
    }

    pub async fn record_complete(
        &self,
        content: impl Into<String>,
        token_count: usize,
    ) -> Result<RecordedEvent> {
        self.append(RecordPayload::Complete {
            content: content.into(),
            token_count,
        })
        .await
    }

    pub async fn record_error(
        &self,
        error: &StreamError,
        recoverable: bool,
    ) -> Result<RecordedEvent> {
        self.append(RecordPayload::Error {
            kind: error.kind(),
            message: error.to_string(),
            recoverable,
        })
        .await
    }

    pub async fn record_retry(
        &self,
        reason: RetryReason,
        attempt: u32,
        will_retry: bool,
    ) -> Result<RecordedEvent> {
        self.append(RecordPayload::Retry {
            reason,
            attempt,
            will_retry,
        })
        .await
    }

    pub async fn record_fallback(&self, index: usize) -> Result<RecordedEvent> {
        self.append(RecordPayload::Fallback { index }).await
    }

    pub async fn record_continuation(&self, checkpoint: &Checkpoint) -> Result<RecordedEvent> {
        self.append(RecordPayload::Continuation {
            token_index: checkpoint.token_index,
            content: checkpoint.content.clone(),
        })
        .await
    }

    pub async fn record_guardrail(
        &self,
        at_token: usize,
        violations: Vec<Violation>,
    ) -> Result<RecordedEvent> {
        self.append(RecordPayload::Guardrail {
            at_token,
            violations,
        })
        .await
    }

    async fn append(&self, payload: RecordPayload) -> Result<RecordedEvent> {
        self.store.append(&self.stream_id, payload).await
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}
