//! Structured-output pipeline: produce a value conforming to a declared
//! schema, guaranteed valid on success.
//!
//! Built on the orchestrator: a terminal guardrail auto-corrects the raw
//! output, parses it, and validates through a [`SchemaCapability`]. Any
//! step failure becomes a recoverable `json-schema-validation` violation,
//! which the retry policy turns into a fresh attempt.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::StreamOptions;
use crate::error::RetryReason;
use crate::event::StreamEvent;
use crate::guardrail::{Guardrail, GuardrailContext, Violation};
use crate::orchestrator::{stream, StreamHandle};
use crate::repair::{auto_correct, Correction};
use crate::session::{FailureReport, SessionOutcome};

/// Narrow validation interface over a schema backend.
///
/// `safe_parse` returns the (possibly normalized) value on success or a
/// human-readable message on failure. Register a thin adapter per schema
/// library; [`SerdeSchema`] covers plain serde types.
pub trait SchemaCapability: Send + Sync {
    fn safe_parse(&self, value: &Value) -> std::result::Result<Value, String>;

    /// Schema name for telemetry.
    fn describe(&self) -> Option<String> {
        None
    }
}

/// Schema backed by a serde-deserializable type.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
/// use streamguard::structured::{SchemaCapability, SerdeSchema};
///
/// #[derive(Serialize, Deserialize)]
/// struct Person { name: String, age: i64 }
///
/// let schema = SerdeSchema::<Person>::new("person");
/// assert!(schema.safe_parse(&json!({"name": "Al", "age": 7})).is_ok());
/// assert!(schema.safe_parse(&json!({"name": "Al", "age": "x"})).is_err());
/// ```
pub struct SerdeSchema<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeSchema<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> SchemaCapability for SerdeSchema<T>
where
    T: DeserializeOwned + Serialize,
{
    fn safe_parse(&self, value: &Value) -> std::result::Result<Value, String> {
        let typed: T = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        serde_json::to_value(typed).map_err(|e| e.to_string())
    }

    fn describe(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

/// Telemetry for one structured run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredReport {
    pub schema_name: Option<String>,
    /// Number of attempts that reached terminal validation.
    pub attempts: u32,
    /// Total corrections applied across all attempts.
    pub corrections: u32,
    /// Distinct correction labels, in first-seen order.
    pub correction_types: Vec<String>,
    pub validation_failures: u32,
}

/// A validated value plus the session it came from.
#[derive(Debug)]
pub struct StructuredOutcome {
    /// The schema-conforming value.
    pub value: Value,
    pub session: SessionOutcome,
    pub report: StructuredReport,
}

#[derive(Default)]
struct SchemaGuardState {
    attempts: u32,
    validation_failures: u32,
    corrections: Vec<Correction>,
    value: Option<Value>,
}

/// Terminal guardrail wrapping the correct → parse → validate sequence.
struct SchemaGuardrail {
    schema: Arc<dyn SchemaCapability>,
    auto_correct: bool,
    state: Mutex<SchemaGuardState>,
}

const RULE_NAME: &str = "json-schema-validation";

impl Guardrail for SchemaGuardrail {
    fn name(&self) -> &str {
        RULE_NAME
    }

    fn check(&self, ctx: &GuardrailContext<'_>) -> Vec<Violation> {
        if !ctx.completed {
            return Vec::new();
        }
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        state.value = None;

        let (text, corrections) = if self.auto_correct {
            auto_correct(ctx.content)
        } else {
            (ctx.content.trim().to_string(), Vec::new())
        };
        state.corrections.extend(corrections);

        let parsed = match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(e) => {
                state.validation_failures += 1;
                return vec![Violation::error(RULE_NAME, format!("unparseable output: {e}"))];
            }
        };

        match self.schema.safe_parse(&parsed) {
            Ok(value) => {
                state.value = Some(value);
                Vec::new()
            }
            Err(message) => {
                state.validation_failures += 1;
                vec![Violation::error(RULE_NAME, message)]
            }
        }
    }
}

/// Handle to a running structured session.
///
/// Tees the token stream to the consumer while accumulating for
/// validation; [`finish`](StructuredHandle::finish) resolves to the
/// validated value once the stream is fully consumed.
pub struct StructuredHandle {
    inner: StreamHandle,
    schema_name: Option<String>,
    guard: Arc<SchemaGuardrail>,
}

impl StructuredHandle {
    /// The session's unique id.
    pub fn stream_id(&self) -> crate::stream_id::StreamId {
        self.inner.stream_id()
    }

    /// Pull the next consumer event.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        use futures::StreamExt;
        self.inner.next().await
    }

    /// Drain the stream and return the validated value.
    pub async fn finish(self) -> std::result::Result<StructuredOutcome, FailureReport> {
        let StructuredHandle {
            inner,
            schema_name,
            guard,
        } = self;
        let session = inner.finish().await?;

        let mut state = guard.state.lock().unwrap();
        let value = state.value.take().unwrap_or(Value::Null);
        let mut correction_types: Vec<String> = Vec::new();
        for correction in &state.corrections {
            let label = correction.label().to_string();
            if !correction_types.contains(&label) {
                correction_types.push(label);
            }
        }
        let report = StructuredReport {
            schema_name,
            attempts: state.attempts,
            corrections: state.corrections.len() as u32,
            correction_types,
            validation_failures: state.validation_failures,
        };

        Ok(StructuredOutcome {
            value,
            session,
            report,
        })
    }
}

impl futures::Stream for StructuredHandle {
    type Item = StreamEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Run a structured session to completion.
pub async fn structured(
    options: StreamOptions,
    schema: Arc<dyn SchemaCapability>,
) -> std::result::Result<StructuredOutcome, FailureReport> {
    structured_stream(options, schema).finish().await
}

/// Start a structured session, returning the teeing handle.
///
/// Auto-correction is always applied before parsing; disable it by
/// composing the guardrail yourself. The retry set is widened with
/// `guardrail_violation` and `incomplete`, since schema failures surface
/// as guardrail violations.
pub fn structured_stream(
    mut options: StreamOptions,
    schema: Arc<dyn SchemaCapability>,
) -> StructuredHandle {
    let schema_name = schema.describe();
    let guardrail = Arc::new(SchemaGuardrail {
        schema,
        auto_correct: true,
        state: Mutex::new(SchemaGuardState::default()),
    });

    options.guardrails.push(guardrail.clone());
    options.retry = options
        .retry
        .clone()
        .also_retry_on(RetryReason::GuardrailViolation)
        .also_retry_on(RetryReason::Incomplete);

    StructuredHandle {
        inner: stream(options),
        schema_name,
        guard: guardrail,
    }
}
