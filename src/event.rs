//! Event taxonomy: the consumer-facing stream events and the observability
//! events delivered to sinks.
//!
//! The two families are disjoint. [`StreamEvent`]s are yielded to the caller
//! through the lazy event stream; [`ObservedEvent`]s describe the session's
//! lifecycle and flow to [`Sink`] capabilities and [`Observer`] callbacks.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, RetryReason, StreamError, TimeoutKind};
use crate::guardrail::{GuardrailPhase, Severity, Violation};
use crate::stream_id::StreamId;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Token accounting reported by some providers at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Media kind of a [`StreamEvent::Data`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataContentType {
    Image,
    Audio,
    Video,
    File,
}

/// Events yielded to the consumer through the lazy event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// One token of generated text.
    Token { value: String, ts: u64 },

    /// The producer requested a tool invocation.
    ToolCall {
        name: String,
        id: String,
        args: Value,
        ts: u64,
    },

    /// Non-text payload (image, audio, video, file).
    Data {
        content_type: DataContentType,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<Vec<u8>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        ts: u64,
    },

    /// Producer-reported progress.
    Progress {
        percent: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        ts: u64,
    },

    /// Terminal success.
    Complete {
        ts: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },

    /// Terminal failure.
    Error {
        kind: ErrorKind,
        message: String,
        recoverable: bool,
    },
}

impl StreamEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    /// The token text, for `Token` events.
    pub fn token(&self) -> Option<&str> {
        match self {
            StreamEvent::Token { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Lifecycle event kinds delivered to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservedKind {
    SessionStart,
    AdapterDetected {
        adapter: String,
    },
    StreamStart {
        fallback_index: usize,
        retry_index: u32,
    },
    FirstToken {
        elapsed_ms: u64,
    },
    CheckpointSaved {
        token_index: usize,
    },
    GuardrailPhaseStart {
        phase: GuardrailPhase,
    },
    GuardrailPhaseEnd {
        phase: GuardrailPhase,
        violations: usize,
    },
    GuardrailViolation {
        rule: String,
        severity: Severity,
        message: String,
    },
    RetryScheduled {
        reason: RetryReason,
        attempt: u32,
        delay_ms: u64,
        capped: bool,
    },
    RetryAttempt {
        reason: RetryReason,
        attempt: u32,
    },
    Fallback {
        index: usize,
    },
    TimeoutStart {
        which: TimeoutKind,
        limit_ms: u64,
    },
    TimeoutFired {
        which: TimeoutKind,
        elapsed_ms: u64,
    },
    NetworkError {
        message: String,
        recoverable: bool,
    },
    Continuation {
        token_index: usize,
    },
    DriftDetected {
        detail: String,
    },
    Complete {
        token_count: usize,
        duration_ms: u64,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl ObservedKind {
    /// Stable snake_case label, used as metric name suffix.
    pub fn label(&self) -> &'static str {
        match self {
            ObservedKind::SessionStart => "session_start",
            ObservedKind::AdapterDetected { .. } => "adapter_detected",
            ObservedKind::StreamStart { .. } => "stream_start",
            ObservedKind::FirstToken { .. } => "first_token",
            ObservedKind::CheckpointSaved { .. } => "checkpoint_saved",
            ObservedKind::GuardrailPhaseStart { .. } => "guardrail_phase_start",
            ObservedKind::GuardrailPhaseEnd { .. } => "guardrail_phase_end",
            ObservedKind::GuardrailViolation { .. } => "guardrail_violation",
            ObservedKind::RetryScheduled { .. } => "retry_scheduled",
            ObservedKind::RetryAttempt { .. } => "retry_attempt",
            ObservedKind::Fallback { .. } => "fallback",
            ObservedKind::TimeoutStart { .. } => "timeout_start",
            ObservedKind::TimeoutFired { .. } => "timeout_fired",
            ObservedKind::NetworkError { .. } => "network_error",
            ObservedKind::Continuation { .. } => "continuation",
            ObservedKind::DriftDetected { .. } => "drift_detected",
            ObservedKind::Complete { .. } => "complete",
            ObservedKind::Failed { .. } => "failed",
        }
    }
}

/// One observability event, with the base fields common to every kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedEvent {
    #[serde(flatten)]
    pub kind: ObservedKind,
    pub ts: u64,
    pub stream_id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// A capability receiving observability events around their delivery.
///
/// `before` runs before an event is surfaced to callbacks, `after` runs
/// once delivery finished, and `on_error` is invoked with the terminal
/// session error. Sinks must not mutate events; a panicking sink is caught
/// and logged, never failing the session.
pub trait Sink: Send + Sync {
    fn before(&self, _event: &ObservedEvent) {}
    fn after(&self, _event: &ObservedEvent) {}
    fn on_error(&self, _error: &StreamError) {}
}

/// Fan an event out to sinks, isolating panics.
pub(crate) fn sink_before(sinks: &[Arc<dyn Sink>], event: &ObservedEvent) {
    for sink in sinks {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sink.before(event)
        }));
        if outcome.is_err() {
            tracing::warn!(event = event.kind.label(), "sink panicked in before()");
        }
    }
}

pub(crate) fn sink_after(sinks: &[Arc<dyn Sink>], event: &ObservedEvent) {
    for sink in sinks {
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.after(event)));
        if outcome.is_err() {
            tracing::warn!(event = event.kind.label(), "sink panicked in after()");
        }
    }
}

pub(crate) fn sink_error(sinks: &[Arc<dyn Sink>], error: &StreamError) {
    for sink in sinks {
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.on_error(error)));
        if outcome.is_err() {
            tracing::warn!("sink panicked in on_error()");
        }
    }
}

/// Optional per-session observation callbacks.
///
/// All fields default to `None`; install only what you need.
///
/// # Example
///
/// ```
/// use streamguard::event::Observer;
///
/// let observer = Observer::default()
///     .on_event(|ev| println!("[{}] {}", ev.ts, ev.kind.label()));
/// ```
#[derive(Default)]
pub struct Observer {
    pub(crate) event: Option<Box<dyn Fn(&ObservedEvent) + Send + Sync>>,
    pub(crate) retry: Option<Box<dyn Fn(RetryReason, u32, Duration) + Send + Sync>>,
    pub(crate) violation: Option<Box<dyn Fn(&Violation) + Send + Sync>>,
    pub(crate) tool_call: Option<Box<dyn Fn(&str, &Value) + Send + Sync>>,
    pub(crate) complete: Option<Box<dyn Fn(&str, usize) + Send + Sync>>,
}

impl Observer {
    /// Called with every observability event.
    pub fn on_event(mut self, f: impl Fn(&ObservedEvent) + Send + Sync + 'static) -> Self {
        self.event = Some(Box::new(f));
        self
    }

    /// Called when a retry is scheduled, with `(reason, attempt, delay)`.
    pub fn on_retry(
        mut self,
        f: impl Fn(RetryReason, u32, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.retry = Some(Box::new(f));
        self
    }

    /// Called for every guardrail violation as it is appended.
    pub fn on_violation(mut self, f: impl Fn(&Violation) + Send + Sync + 'static) -> Self {
        self.violation = Some(Box::new(f));
        self
    }

    /// Called for every tool-call event, with `(name, args)`.
    pub fn on_tool_call(mut self, f: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.tool_call = Some(Box::new(f));
        self
    }

    /// Called once on terminal success, with `(content, token_count)`.
    pub fn on_complete(mut self, f: impl Fn(&str, usize) + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("has_event", &self.event.is_some())
            .field("has_retry", &self.retry.is_some())
            .field("has_violation", &self.violation.is_some())
            .field("has_tool_call", &self.tool_call.is_some())
            .field("has_complete", &self.complete.is_some())
            .finish()
    }
}
