//! The stream orchestrator: drives one logical generation through the
//! attempt graph (primary producer × fallbacks × retries) while streaming
//! tokens to the consumer, running guardrails, saving checkpoints, and
//! surfacing telemetry.
//!
//! [`stream`] returns a [`StreamHandle`]: a lazy, pull-based event stream.
//! Nothing runs until the handle is polled; cancellation is checked at
//! every suspension point; a stalled consumer backpressures the producer
//! and becomes visible as an inter-token timeout.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::adapter::{self, EventStream, StreamAdapter};
use crate::backoff::{self, BackoffDelay};
use crate::config::{AdapterChoice, StreamOptions};
use crate::error::{ErrorKind, StreamError, TimeoutKind};
use crate::event::{
    now_ms, sink_after, sink_before, sink_error, ObservedEvent, ObservedKind, Observer, Sink,
    StreamEvent, TokenUsage,
};
use crate::guardrail::{advise, Advice, GuardrailContext, GuardrailPhase, GuardrailSet, Violation};
use crate::producer::ProducerStream;
use crate::record::Recorder;
use crate::session::{Checkpoint, FailureReport, SessionOutcome};
use crate::stream_id::StreamId;
use crate::telemetry::TelemetrySnapshot;
use crate::zero_token::{self, ZeroTokenConfig};

/// Result of one session: the frozen outcome or a structured failure.
pub type SessionResult = std::result::Result<SessionOutcome, FailureReport>;

/// Handle to a running (lazily driven) session.
///
/// Implements [`Stream`] over [`StreamEvent`]; the terminal event is always
/// `Complete` or `Error`. After the stream is drained, [`finish`] returns
/// the accumulated terminal state.
///
/// [`finish`]: StreamHandle::finish
pub struct StreamHandle {
    stream_id: StreamId,
    events: Pin<Box<dyn Stream<Item = StreamEvent> + Send>>,
    outcome: Arc<Mutex<Option<SessionResult>>>,
}

impl StreamHandle {
    /// The session's unique id.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Drain any remaining events and return the terminal state.
    pub async fn finish(mut self) -> SessionResult {
        while self.events.as_mut().next().await.is_some() {}
        match self.outcome.lock().unwrap().take() {
            Some(result) => result,
            None => Err(FailureReport {
                stream_id: self.stream_id,
                kind: ErrorKind::Unknown,
                message: "session ended without a terminal state".into(),
                cause: None,
                produced_content: false,
                checkpoint: None,
                fallback_index: 0,
                telemetry: TelemetrySnapshot::default(),
            }),
        }
    }
}

impl Stream for StreamHandle {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Side-effect half of the session: observed-event delivery, recording,
/// telemetry accumulation, timestamp clamping.
struct SessionCtx {
    stream_id: StreamId,
    context: Option<Value>,
    sinks: Vec<Arc<dyn Sink>>,
    observer: Observer,
    sampled: bool,
    recorder: Option<Recorder>,
    signal: Option<Arc<AtomicBool>>,
    telemetry: TelemetrySnapshot,
    violations: Vec<Violation>,
    last_ts: u64,
}

impl SessionCtx {
    /// Monotonically non-decreasing session timestamp.
    fn next_ts(&mut self) -> u64 {
        let ts = now_ms().max(self.last_ts);
        self.last_ts = ts;
        ts
    }

    fn is_cancelled(&self) -> bool {
        self.signal
            .as_ref()
            .is_some_and(|s| s.load(Ordering::Relaxed))
    }

    fn observe(&mut self, kind: ObservedKind) {
        tracing::debug!(stream_id = %self.stream_id, event = kind.label(), "session event");
        let event = ObservedEvent {
            kind,
            ts: self.next_ts(),
            stream_id: self.stream_id,
            context: self.context.clone(),
        };
        if self.sampled {
            sink_before(&self.sinks, &event);
        }
        if let Some(cb) = &self.observer.event {
            cb(&event);
        }
        if self.sampled {
            sink_after(&self.sinks, &event);
        }
    }

    fn note_violation(&mut self, violation: &Violation) {
        self.telemetry.tally_violation(violation);
        if let Some(cb) = &self.observer.violation {
            cb(violation);
        }
        self.violations.push(violation.clone());
    }

    fn record<T>(&self, result: crate::error::Result<T>) {
        if let Err(e) = result {
            tracing::warn!(stream_id = %self.stream_id, error = %e, "event store append failed");
        }
    }
}

fn merge_context(context: Option<Value>, metadata: Option<Value>) -> Option<Value> {
    match (context, metadata) {
        (Some(Value::Object(mut ctx)), Some(Value::Object(meta))) => {
            for (k, v) in meta {
                ctx.entry(k).or_insert(v);
            }
            Some(Value::Object(ctx))
        }
        (Some(ctx), _) => Some(ctx),
        (None, meta) => meta,
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.rule, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

async fn run_guardrails(
    session: &mut SessionCtx,
    guard_set: &mut GuardrailSet,
    phase: GuardrailPhase,
    content: &str,
    token_count: usize,
    started: Instant,
) -> Vec<Violation> {
    session.observe(ObservedKind::GuardrailPhaseStart { phase });

    let fresh = {
        let ctx = GuardrailContext {
            content,
            completed: phase == GuardrailPhase::Terminal,
            token_count,
            elapsed_ms: started.elapsed().as_millis() as u64,
            session_metadata: session.context.as_ref(),
        };
        guard_set.run_phase(phase, &ctx)
    };

    for violation in &fresh {
        session.observe(ObservedKind::GuardrailViolation {
            rule: violation.rule.clone(),
            severity: violation.severity,
            message: violation.message.clone(),
        });
        if violation.rule.starts_with("drift") {
            session.observe(ObservedKind::DriftDetected {
                detail: violation.message.clone(),
            });
        }
        session.note_violation(violation);
    }
    if !fresh.is_empty() {
        if let Some(rec) = &session.recorder {
            session.record(rec.record_guardrail(token_count, fresh.clone()).await);
        }
    }

    session.observe(ObservedKind::GuardrailPhaseEnd {
        phase,
        violations: fresh.len(),
    });
    fresh
}

enum WrapOutcome {
    Events(EventStream),
    /// The producer finished without a single chunk to probe.
    Empty,
    Failed(StreamError),
}

async fn resolve_events(
    session: &mut SessionCtx,
    adapter_slot: &mut Option<Arc<dyn StreamAdapter>>,
    choice: &Option<AdapterChoice>,
    registry: &Option<Arc<adapter::AdapterRegistry>>,
    mut raw: ProducerStream,
) -> WrapOutcome {
    if let Some(resolved) = adapter_slot {
        return WrapOutcome::Events(resolved.wrap(raw));
    }

    let lookup = |name: &str| -> Option<Arc<dyn StreamAdapter>> {
        match registry {
            Some(r) => r.get(name),
            None => adapter::global().get(name),
        }
    };

    let resolved = match choice {
        Some(AdapterChoice::Instance(instance)) => instance.clone(),
        Some(AdapterChoice::Named(name)) => match lookup(name) {
            Some(found) => found,
            None => {
                tracing::warn!(adapter = %name, "named adapter is not registered");
                return WrapOutcome::Failed(StreamError::NoAdapter {
                    probed: 0,
                    without_detector: 0,
                });
            }
        },
        None => {
            // Auto-detect on the first chunk, then chain it back in front.
            let probe = match raw.next().await {
                None => return WrapOutcome::Empty,
                Some(Err(e)) => return WrapOutcome::Failed(e),
                Some(Ok(chunk)) => chunk,
            };
            let detected = match registry {
                Some(r) => r.detect(&probe),
                None => adapter::global().detect(&probe),
            };
            match detected {
                Ok(found) => {
                    let restored: ProducerStream =
                        Box::pin(futures::stream::once(async move { Ok(probe) }).chain(raw));
                    session.observe(ObservedKind::AdapterDetected {
                        adapter: found.name().to_string(),
                    });
                    *adapter_slot = Some(found.clone());
                    return WrapOutcome::Events(found.wrap(restored));
                }
                Err(e) => return WrapOutcome::Failed(e),
            }
        }
    };

    session.observe(ObservedKind::AdapterDetected {
        adapter: resolved.name().to_string(),
    });
    *adapter_slot = Some(resolved.clone());
    WrapOutcome::Events(resolved.wrap(raw))
}

enum AttemptEnd {
    Completed,
    Failed(StreamError),
}

enum Terminal {
    Success,
    Failure(StreamError),
}

/// Start a session. Returns a lazy handle; nothing runs until it is polled.
pub fn stream(options: StreamOptions) -> StreamHandle {
    let stream_id = StreamId::generate();
    let outcome_slot: Arc<Mutex<Option<SessionResult>>> = Arc::new(Mutex::new(None));
    let slot = outcome_slot.clone();

    let events = Box::pin(async_stream::stream! {
        let StreamOptions {
            producer,
            adapter: adapter_choice,
            fallbacks,
            retry: policy,
            timeout,
            detect_zero_tokens,
            continue_from_checkpoint,
            checkpoints,
            continuation_prompt,
            guardrails,
            guardrail_interval,
            monitoring,
            sinks,
            observer,
            signal,
            record_to,
            context,
            registry,
        } = options;

        let sampled = monitoring.enabled && fastrand::f64() < monitoring.sample_rate;
        let recorder = record_to
            .as_ref()
            .map(|store| Recorder::new(store.clone(), stream_id.to_string()));

        let mut session = SessionCtx {
            stream_id,
            context: merge_context(context, monitoring.metadata.clone()),
            sinks,
            observer,
            sampled,
            recorder,
            signal,
            telemetry: TelemetrySnapshot {
                session_id: stream_id.to_string(),
                ..Default::default()
            },
            violations: Vec::new(),
            last_ts: 0,
        };
        session.telemetry.continuation.enabled = continue_from_checkpoint;

        let started = Instant::now();
        let mut guard_set = GuardrailSet::new(guardrails);
        let zero_config = ZeroTokenConfig::default();

        let mut producers: Vec<Arc<dyn crate::producer::Producer>> =
            Vec::with_capacity(1 + fallbacks.len());
        producers.push(producer);
        producers.extend(fallbacks);

        session.observe(ObservedKind::SessionStart);
        if let Some(rec) = &session.recorder {
            let summary = json!({
                "adapter": match &adapter_choice {
                    Some(AdapterChoice::Named(name)) => json!(name),
                    Some(AdapterChoice::Instance(a)) => json!(a.name()),
                    None => Value::Null,
                },
                "fallbacks": producers.len() - 1,
                "retry_attempts": policy.attempts,
                "continuation": continue_from_checkpoint,
            });
            session.record(rec.record_start(summary).await);
        }

        let mut adapter_slot: Option<Arc<dyn StreamAdapter>> = None;
        let mut fallback_index = 0usize;
        let mut retry_index = 0u32;
        let mut content = String::new();
        let mut token_count = 0usize;
        let mut total_yielded = 0usize;
        let mut checkpoint: Option<Checkpoint> = None;
        let mut continued = false;
        let mut pending_continuation = false;
        let mut usage: Option<TokenUsage> = None;
        let mut first_token_seen = false;

        let terminal: Terminal = 'session: loop {
            if session.is_cancelled() {
                break 'session Terminal::Failure(StreamError::Cancelled);
            }

            // Attempt baseline: continuation resumes from the checkpoint,
            // everything else starts clean.
            let continuation_input = if pending_continuation {
                let cp = checkpoint.clone().expect("continuation requires a checkpoint");
                content = cp.content.clone();
                token_count = cp.token_index;
                continued = true;
                session.telemetry.continuation.used = true;
                session.telemetry.continuation.count += 1;
                session.observe(ObservedKind::Continuation {
                    token_index: cp.token_index,
                });
                if let Some(rec) = &session.recorder {
                    session.record(rec.record_continuation(&cp).await);
                }
                continuation_prompt.as_ref().map(|build| build(&cp))
            } else {
                content.clear();
                token_count = 0;
                None
            };
            pending_continuation = false;

            session.observe(ObservedKind::StreamStart {
                fallback_index,
                retry_index,
            });
            guard_set.reset();

            let raw = producers[fallback_index].open(continuation_input.as_ref());
            let attempt_started = Instant::now();
            let attempt_base_len = content.len();
            let mut attempt_tokens = 0usize;

            let wrapped = resolve_events(
                &mut session,
                &mut adapter_slot,
                &adapter_choice,
                &registry,
                raw,
            )
            .await;

            let attempt_end: AttemptEnd = match wrapped {
                WrapOutcome::Failed(e) if e.is_fatal() => break 'session Terminal::Failure(e),
                WrapOutcome::Failed(e) => AttemptEnd::Failed(e),
                WrapOutcome::Empty => AttemptEnd::Completed,
                WrapOutcome::Events(mut events) => {
                    if let Some(limit) = timeout.initial_token {
                        session.observe(ObservedKind::TimeoutStart {
                            which: TimeoutKind::InitialToken,
                            limit_ms: limit.as_millis() as u64,
                        });
                    }
                    let mut last_event_at = Instant::now();
                    let mut inter_armed = false;

                    loop {
                        if session.is_cancelled() {
                            break 'session Terminal::Failure(StreamError::Cancelled);
                        }

                        let (which, limit) = if attempt_tokens == 0 {
                            (TimeoutKind::InitialToken, timeout.initial_token)
                        } else {
                            (TimeoutKind::InterToken, timeout.inter_token)
                        };

                        let next = match limit {
                            Some(limit) => {
                                let remaining = limit.saturating_sub(last_event_at.elapsed());
                                match tokio::time::timeout(remaining, events.next()).await {
                                    Ok(item) => item,
                                    Err(_) => {
                                        let elapsed_ms =
                                            last_event_at.elapsed().as_millis() as u64;
                                        session.observe(ObservedKind::TimeoutFired {
                                            which,
                                            elapsed_ms,
                                        });
                                        tracing::warn!(
                                            stream_id = %session.stream_id,
                                            timer = %which,
                                            elapsed_ms,
                                            "attempt timer expired"
                                        );
                                        break AttemptEnd::Failed(StreamError::Timeout {
                                            which,
                                            elapsed_ms,
                                        });
                                    }
                                }
                            }
                            None => events.next().await,
                        };

                        let event = match next {
                            None => break AttemptEnd::Completed,
                            Some(Err(e)) => break AttemptEnd::Failed(e),
                            Some(Ok(event)) => event,
                        };

                        match event {
                            StreamEvent::Token { value, .. } => {
                                last_event_at = Instant::now();
                                if !first_token_seen && !value.is_empty() {
                                    first_token_seen = true;
                                    let elapsed_ms = started.elapsed().as_millis() as u64;
                                    session.telemetry.time_to_first_token_ms = Some(elapsed_ms);
                                    session.observe(ObservedKind::FirstToken { elapsed_ms });
                                }
                                if attempt_tokens == 0 && !inter_armed {
                                    if let Some(limit) = timeout.inter_token {
                                        inter_armed = true;
                                        session.observe(ObservedKind::TimeoutStart {
                                            which: TimeoutKind::InterToken,
                                            limit_ms: limit.as_millis() as u64,
                                        });
                                    }
                                }

                                content.push_str(&value);
                                attempt_tokens += 1;
                                token_count += 1;
                                total_yielded += 1;
                                if let Some(rec) = &session.recorder {
                                    session.record(rec.record_token(value.as_str(), token_count - 1).await);
                                }

                                let ts = session.next_ts();
                                yield StreamEvent::Token { value, ts };

                                if continue_from_checkpoint
                                    && token_count % checkpoints.interval == 0
                                {
                                    let cp = Checkpoint {
                                        content: content.clone(),
                                        token_index: token_count,
                                        ts: session.next_ts(),
                                    };
                                    session.observe(ObservedKind::CheckpointSaved {
                                        token_index: token_count,
                                    });
                                    if let Some(rec) = &session.recorder {
                                        session.record(
                                            rec.record_checkpoint(token_count, cp.content.as_str()).await,
                                        );
                                    }
                                    checkpoint = Some(cp);
                                }

                                if !guard_set.is_empty()
                                    && token_count % guardrail_interval == 0
                                {
                                    let fresh = run_guardrails(
                                        &mut session,
                                        &mut guard_set,
                                        GuardrailPhase::Streaming,
                                        &content,
                                        token_count,
                                        started,
                                    )
                                    .await;
                                    match advise(&fresh) {
                                        Advice::Fail => {
                                            break 'session Terminal::Failure(
                                                StreamError::FatalGuardrail(summarize(&fresh)),
                                            );
                                        }
                                        Advice::Retry => {
                                            // Streaming-phase position: stop the
                                            // producer now and retry.
                                            break AttemptEnd::Failed(StreamError::Guardrail(
                                                summarize(&fresh),
                                            ));
                                        }
                                        Advice::Proceed => {}
                                    }
                                }
                            }
                            StreamEvent::ToolCall { name, id, args, .. } => {
                                last_event_at = Instant::now();
                                if let Some(cb) = &session.observer.tool_call {
                                    cb(&name, &args);
                                }
                                let ts = session.next_ts();
                                yield StreamEvent::ToolCall { name, id, args, ts };
                            }
                            StreamEvent::Data {
                                content_type,
                                mime,
                                url,
                                bytes,
                                metadata,
                                ..
                            } => {
                                last_event_at = Instant::now();
                                let ts = session.next_ts();
                                yield StreamEvent::Data {
                                    content_type,
                                    mime,
                                    url,
                                    bytes,
                                    metadata,
                                    ts,
                                };
                            }
                            StreamEvent::Progress { percent, message, .. } => {
                                last_event_at = Instant::now();
                                let ts = session.next_ts();
                                yield StreamEvent::Progress { percent, message, ts };
                            }
                            StreamEvent::Complete { usage: u, .. } => {
                                usage = u.or(usage);
                                break AttemptEnd::Completed;
                            }
                            StreamEvent::Error { kind, message, .. } => {
                                break AttemptEnd::Failed(StreamError::from_kind(kind, message));
                            }
                        }
                    }
                }
            };

            // Attempt epilogue: zero-token defense and terminal guardrails
            // turn a "completed" attempt into an error when warranted.
            let attempt_error: Option<StreamError> = match attempt_end {
                AttemptEnd::Failed(e) => Some(e),
                AttemptEnd::Completed => {
                    let attempt_content = &content[attempt_base_len.min(content.len())..];
                    let zero = if detect_zero_tokens {
                        zero_token::classify(
                            attempt_content,
                            attempt_tokens,
                            attempt_started.elapsed().as_millis() as u64,
                            &zero_config,
                        )
                    } else {
                        None
                    };
                    match zero {
                        Some(category) => {
                            session
                                .telemetry
                                .tally_network_error(&format!("zero_tokens:{category}"));
                            Some(StreamError::ZeroTokens { category })
                        }
                        None if guard_set.is_empty() => None,
                        None => {
                            let fresh = run_guardrails(
                                &mut session,
                                &mut guard_set,
                                GuardrailPhase::Terminal,
                                &content,
                                token_count,
                                started,
                            )
                            .await;
                            match advise(&fresh) {
                                Advice::Fail => {
                                    break 'session Terminal::Failure(
                                        StreamError::FatalGuardrail(summarize(&fresh)),
                                    );
                                }
                                Advice::Retry => {
                                    // Terminal-phase position: the attempt was
                                    // allowed to complete; retry now.
                                    Some(StreamError::Guardrail(summarize(&fresh)))
                                }
                                Advice::Proceed => None,
                            }
                        }
                    }
                }
            };

            let error = match attempt_error {
                None => break 'session Terminal::Success,
                Some(e) => e,
            };

            // Retry decision.
            if session.is_cancelled() || error.kind() == ErrorKind::Cancelled {
                break 'session Terminal::Failure(StreamError::Cancelled);
            }
            if error.is_fatal() {
                break 'session Terminal::Failure(error);
            }

            let reason = error.retry_reason();
            let retryable = reason.map(|r| policy.retries(r)).unwrap_or(false);

            match error.kind() {
                ErrorKind::NetworkError => {
                    session.telemetry.tally_network_error(ErrorKind::NetworkError.label());
                    session.observe(ObservedKind::NetworkError {
                        message: error.to_string(),
                        recoverable: retryable,
                    });
                }
                ErrorKind::ServerError | ErrorKind::Timeout => {
                    session.telemetry.tally_network_error(error.kind().label());
                }
                _ => {}
            }
            if let Some(rec) = &session.recorder {
                session.record(rec.record_error(&error, retryable).await);
            }

            if retryable && retry_index < policy.attempts {
                let reason = reason.expect("retryable implies a reason");
                retry_index += 1;
                session.telemetry.retries.tally(reason);

                let BackoffDelay { delay, capped } = match &error {
                    StreamError::RateLimit {
                        retry_after: Some(after),
                        ..
                    } => BackoffDelay {
                        delay: *after,
                        capped: false,
                    },
                    _ => backoff::delay_for(&policy, error.kind(), retry_index),
                };

                session.observe(ObservedKind::RetryScheduled {
                    reason,
                    attempt: retry_index,
                    delay_ms: delay.as_millis() as u64,
                    capped,
                });
                tracing::info!(
                    stream_id = %session.stream_id,
                    reason = %reason,
                    attempt = retry_index,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                if let Some(cb) = &session.observer.retry {
                    cb(reason, retry_index, delay);
                }
                if let Some(rec) = &session.recorder {
                    session.record(rec.record_retry(reason, retry_index, true).await);
                }

                tokio::time::sleep(delay).await;
                if session.is_cancelled() {
                    break 'session Terminal::Failure(StreamError::Cancelled);
                }

                session.observe(ObservedKind::RetryAttempt {
                    reason,
                    attempt: retry_index,
                });
                pending_continuation = continue_from_checkpoint
                    && checkpoint.is_some()
                    && continuation_prompt.is_some();
                continue 'session;
            }

            if let Some(reason) = reason {
                if let Some(rec) = &session.recorder {
                    session.record(rec.record_retry(reason, retry_index, false).await);
                }
            }

            if fallback_index + 1 < producers.len() {
                fallback_index += 1;
                retry_index = 0;
                session.observe(ObservedKind::Fallback {
                    index: fallback_index,
                });
                tracing::info!(
                    stream_id = %session.stream_id,
                    fallback_index,
                    "promoting to fallback producer"
                );
                if let Some(rec) = &session.recorder {
                    session.record(rec.record_fallback(fallback_index).await);
                }
                pending_continuation = continue_from_checkpoint
                    && checkpoint.is_some()
                    && continuation_prompt.is_some();
                continue 'session;
            }

            break 'session Terminal::Failure(error);
        };

        // Freeze telemetry and emit the terminal pair (observed + consumer).
        session.telemetry.duration_ms = started.elapsed().as_millis() as u64;
        session.telemetry.tokens_total = token_count;

        match terminal {
            Terminal::Success => {
                session.observe(ObservedKind::Complete {
                    token_count,
                    duration_ms: session.telemetry.duration_ms,
                });
                if let Some(rec) = &session.recorder {
                    session.record(rec.record_complete(content.as_str(), token_count).await);
                }
                if let Some(cb) = &session.observer.complete {
                    cb(&content, token_count);
                }
                if let Some(metrics) = &monitoring.metrics {
                    metrics.record_session(&session.telemetry);
                }

                let outcome = SessionOutcome {
                    stream_id,
                    content,
                    token_count,
                    fallback_index,
                    continued_from_checkpoint: continued,
                    violations: session.violations.clone(),
                    usage,
                    telemetry: session.telemetry.clone(),
                };
                *slot.lock().unwrap() = Some(Ok(outcome));

                let ts = session.next_ts();
                yield StreamEvent::Complete { ts, usage };
            }
            Terminal::Failure(error) => {
                let kind = error.kind();
                session.observe(ObservedKind::Failed {
                    kind,
                    message: error.to_string(),
                });
                tracing::warn!(
                    stream_id = %session.stream_id,
                    kind = %kind,
                    error = %error,
                    "session failed"
                );
                if session.sampled {
                    sink_error(&session.sinks, &error);
                }
                if let Some(rec) = &session.recorder {
                    session.record(rec.record_error(&error, false).await);
                }
                if let Some(metrics) = &monitoring.metrics {
                    metrics.record_session(&session.telemetry);
                }

                let message = error.to_string();
                let report = FailureReport {
                    stream_id,
                    kind,
                    message: message.clone(),
                    cause: Some(Box::new(error)),
                    produced_content: total_yielded > 0,
                    checkpoint: checkpoint.clone(),
                    fallback_index,
                    telemetry: session.telemetry.clone(),
                };
                *slot.lock().unwrap() = Some(Err(report));

                yield StreamEvent::Error {
                    kind,
                    message,
                    recoverable: false,
                };
            }
        }
    });

    StreamHandle {
        stream_id,
        events,
        outcome: outcome_slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, RetryPolicy, TimeoutConfig};
    use crate::error::RetryReason;
    use crate::guardrail::{JsonStructureRule, PatternRule, Severity};
    use crate::producer::{ScriptStep, ScriptedProducer};
    use crate::record::{MemoryStore, Replayer};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts)
            .backoff(Backoff::Fixed)
            .base_delay(Duration::from_millis(1))
    }

    fn capture_observed() -> (Observer, Arc<Mutex<Vec<ObservedKind>>>) {
        let seen: Arc<Mutex<Vec<ObservedKind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = Observer::default().on_event(move |ev| {
            sink.lock().unwrap().push(ev.kind.clone());
        });
        (observer, seen)
    }

    fn count_label(seen: &[ObservedKind], label: &str) -> usize {
        seen.iter().filter(|k| k.label() == label).count()
    }

    #[tokio::test]
    async fn test_primary_ok() {
        init_tracing();
        let producer = Arc::new(ScriptedProducer::tokens(&["He", "llo", " ", "Wo", "rld"]));
        let (observer, seen) = capture_observed();
        let options = StreamOptions::builder(producer)
            .observer(observer)
            .build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "Hello World");
        assert_eq!(outcome.token_count, 5);
        assert_eq!(outcome.fallback_index, 0);
        assert!(!outcome.continued_from_checkpoint);
        assert_eq!(outcome.telemetry.retries.total(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(count_label(&seen, "session_start"), 1);
        assert_eq!(count_label(&seen, "complete"), 1);
        assert_eq!(count_label(&seen, "failed"), 0);
        assert_eq!(count_label(&seen, "first_token"), 1);
        assert_eq!(count_label(&seen, "adapter_detected"), 1);
    }

    #[tokio::test]
    async fn test_tokens_stream_lazily_in_order() {
        let producer = Arc::new(ScriptedProducer::tokens(&["a", "b", "c"]));
        let mut handle = stream(StreamOptions::builder(producer).build());

        let mut tokens = Vec::new();
        while let Some(event) = handle.next().await {
            match event {
                StreamEvent::Token { value, .. } => tokens.push(value),
                StreamEvent::Complete { .. } => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_continuation_resumes_from_checkpoint() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            vec![
                ScriptStep::token("The"),
                ScriptStep::token(" "),
                ScriptStep::token("quick"),
                ScriptStep::token(" "),
                ScriptStep::token("brown"),
                ScriptStep::fail(ErrorKind::NetworkError, "connection reset"),
            ],
            vec![ScriptStep::token("brown"), ScriptStep::token(" fox")],
        ]));
        let probe = producer.clone();

        let options = StreamOptions::builder(producer)
            .retry(fast_retry(2))
            .checkpoint_interval(2)
            .continue_from_checkpoint(|cp| json!(format!("continue from: {}", cp.content)))
            .build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "The quick brown fox");
        assert!(outcome.continued_from_checkpoint);
        assert!(outcome.telemetry.continuation.used);
        assert!(outcome.telemetry.continuation.count >= 1);

        // The second open received the built continuation prompt.
        let inputs = probe.recorded_inputs();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1], Some(json!("continue from: The quick ")));
    }

    #[tokio::test]
    async fn test_all_fallbacks_fail() {
        let failing =
            || Arc::new(ScriptedProducer::failing(ErrorKind::ServerError, "boom"));
        let (observer, seen) = capture_observed();
        let options = StreamOptions::builder(failing())
            .fallback(failing())
            .fallback(failing())
            .retry(
                fast_retry(1).retry_on(&[RetryReason::ServerError]),
            )
            .observer(observer)
            .build();

        let report = stream(options).finish().await.unwrap_err();
        assert_eq!(report.kind, ErrorKind::ServerError);
        assert_eq!(report.fallback_index, 2);
        assert_eq!(report.telemetry.retries.total(), 3);
        assert!(!report.produced_content);
        assert!(report.cause.is_some());

        let seen = seen.lock().unwrap();
        assert_eq!(count_label(&seen, "failed"), 1);
        assert_eq!(count_label(&seen, "complete"), 0);
        assert_eq!(count_label(&seen, "fallback"), 2);
        assert_eq!(count_label(&seen, "retry_scheduled"), 3);
    }

    #[tokio::test]
    async fn test_zero_tokens_classified_and_retried() {
        // First open yields nothing; the retry produces real content.
        let producer = Arc::new(ScriptedProducer::new(vec![
            vec![],
            vec![ScriptStep::token("recovered")],
        ]));
        let options = StreamOptions::builder(producer)
            .retry(fast_retry(1).retry_on(&[RetryReason::ZeroTokens]))
            .build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "recovered");
        assert_eq!(outcome.telemetry.retries.model, 1);
        assert!(outcome
            .telemetry
            .network_errors
            .contains_key("zero_tokens:network"));
    }

    #[tokio::test]
    async fn test_zero_tokens_defense_disabled_accepts_empty() {
        let producer = Arc::new(ScriptedProducer::new(vec![vec![]]));
        let options = StreamOptions::builder(producer)
            .detect_zero_tokens(false)
            .build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "");
        assert_eq!(outcome.token_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_first_poll() {
        let signal = Arc::new(AtomicBool::new(true));
        let producer = Arc::new(ScriptedProducer::tokens(&["never"]));
        let (observer, seen) = capture_observed();
        let options = StreamOptions::builder(producer)
            .signal(signal)
            .observer(observer)
            .build();

        let mut handle = stream(options);
        let mut yielded_tokens = 0;
        while let Some(event) = handle.next().await {
            if matches!(event, StreamEvent::Token { .. }) {
                yielded_tokens += 1;
            }
        }
        assert_eq!(yielded_tokens, 0);

        let report = handle.finish().await.unwrap_err();
        assert_eq!(report.kind, ErrorKind::Cancelled);
        let seen = seen.lock().unwrap();
        assert_eq!(count_label(&seen, "session_start"), 1);
        assert_eq!(count_label(&seen, "failed"), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let signal = Arc::new(AtomicBool::new(false));
        let flip = signal.clone();
        let producer = Arc::new(ScriptedProducer::new(vec![vec![
            ScriptStep::token("one"),
            ScriptStep::token("two"),
            ScriptStep::token("three"),
        ]]));
        let options = StreamOptions::builder(producer).signal(signal).build();

        let mut handle = stream(options);
        let first = handle.next().await.unwrap();
        assert_eq!(first.token(), Some("one"));
        flip.store(true, Ordering::Relaxed);

        let report = handle.finish().await.unwrap_err();
        assert_eq!(report.kind, ErrorKind::Cancelled);
        assert!(report.produced_content);
    }

    #[tokio::test]
    async fn test_initial_token_timeout_fires() {
        let producer = Arc::new(ScriptedProducer::new(vec![vec![
            ScriptStep::Delay(Duration::from_millis(200)),
            ScriptStep::token("late"),
        ]]));
        let (observer, seen) = capture_observed();
        let options = StreamOptions::builder(producer)
            .retry(RetryPolicy::none())
            .timeout(TimeoutConfig {
                initial_token: Some(Duration::from_millis(20)),
                inter_token: None,
            })
            .observer(observer)
            .build();

        let report = stream(options).finish().await.unwrap_err();
        assert_eq!(report.kind, ErrorKind::Timeout);

        let seen = seen.lock().unwrap();
        assert_eq!(count_label(&seen, "timeout_start"), 1);
        assert_eq!(count_label(&seen, "timeout_fired"), 1);
    }

    #[tokio::test]
    async fn test_inter_token_timeout_retries_then_succeeds() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            vec![
                ScriptStep::token("stuck"),
                ScriptStep::Delay(Duration::from_millis(200)),
                ScriptStep::token("never"),
            ],
            vec![ScriptStep::token("quick"), ScriptStep::token(" done")],
        ]));
        let options = StreamOptions::builder(producer)
            .retry(fast_retry(1).retry_on(&[RetryReason::Timeout]))
            .timeout(TimeoutConfig {
                initial_token: None,
                inter_token: Some(Duration::from_millis(30)),
            })
            .build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "quick done");
        assert_eq!(outcome.telemetry.retries.network, 1);
    }

    #[tokio::test]
    async fn test_fatal_guardrail_aborts_mid_stream() {
        let producer = Arc::new(ScriptedProducer::tokens(&["ok ", "forbidden", " more"]));
        let rule = Arc::new(
            PatternRule::new("deny-word", "forbidden", Severity::Fatal).unwrap(),
        );
        let options = StreamOptions::builder(producer).guardrail(rule).build();

        let report = stream(options).finish().await.unwrap_err();
        assert_eq!(report.kind, ErrorKind::FatalGuardrail);
        assert!(report.telemetry.violations_by_severity.contains_key("fatal"));
    }

    #[tokio::test]
    async fn test_terminal_guardrail_retry_to_success() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            vec![ScriptStep::token(r#"{"a": 1"#)],
            vec![ScriptStep::token(r#"{"a": 1}"#)],
        ]));
        let options = StreamOptions::builder(producer)
            .retry(fast_retry(2).retry_on(&[RetryReason::GuardrailViolation]))
            .guardrail(Arc::new(JsonStructureRule::new()))
            .build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, r#"{"a": 1}"#);
        assert_eq!(outcome.telemetry.retries.model, 1);
        assert!(!outcome.violations.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_guardrail_stops_producer() {
        // The bad token arrives mid-stream; the attempt is cut off before
        // the remaining tokens and retried from scratch.
        let producer = Arc::new(ScriptedProducer::new(vec![
            vec![
                ScriptStep::token("bad "),
                ScriptStep::token("rest never seen"),
            ],
            vec![ScriptStep::token("clean output")],
        ]));
        let rule =
            Arc::new(PatternRule::new("no-bad", "bad", Severity::Error).unwrap());
        let options = StreamOptions::builder(producer)
            .retry(fast_retry(1).retry_on(&[RetryReason::GuardrailViolation]))
            .guardrail(rule)
            .build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "clean output");
    }

    #[tokio::test]
    async fn test_non_retryable_error_promotes_to_fallback_immediately() {
        let primary = Arc::new(ScriptedProducer::failing(
            ErrorKind::ClientError,
            "bad request",
        ));
        let fallback = Arc::new(ScriptedProducer::tokens(&["saved"]));
        let (observer, seen) = capture_observed();
        let options = StreamOptions::builder(primary)
            .fallback(fallback)
            .retry(fast_retry(3))
            .observer(observer)
            .build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "saved");
        assert_eq!(outcome.fallback_index, 1);
        // No retry was spent on the non-retryable client error.
        assert_eq!(outcome.telemetry.retries.total(), 0);
        assert_eq!(count_label(&seen.lock().unwrap(), "retry_scheduled"), 0);
    }

    #[tokio::test]
    async fn test_observed_timestamps_monotonic() {
        let producer = Arc::new(ScriptedProducer::tokens(&["a", "b", "c", "d"]));
        let stamps: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = stamps.clone();
        let observer = Observer::default().on_event(move |ev| {
            sink.lock().unwrap().push(ev.ts);
        });
        let options = StreamOptions::builder(producer).observer(observer).build();

        stream(options).finish().await.unwrap();
        let stamps = stamps.lock().unwrap();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_record_then_replay_identity() {
        let store = Arc::new(MemoryStore::new());
        let producer = Arc::new(ScriptedProducer::tokens(&["He", "llo", " world"]));
        let options = StreamOptions::builder(producer)
            .record_to(store.clone())
            .build();

        let handle = stream(options);
        let stream_id = handle.stream_id().to_string();
        let outcome = handle.finish().await.unwrap();

        let replayer = Replayer::new(store);
        let state = replayer.replay_to_state(&stream_id).await.unwrap();
        assert_eq!(state.content, outcome.content);
        assert!(state.completed);
        let joined: String = replayer
            .replay_tokens(&stream_id, None, None)
            .await
            .unwrap()
            .collect();
        assert_eq!(joined, outcome.content);
        assert!(replayer.verify(&stream_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_retry_session_replays_final_content() {
        let store = Arc::new(MemoryStore::new());
        let producer = Arc::new(ScriptedProducer::new(vec![
            vec![
                ScriptStep::token("discarded"),
                ScriptStep::fail(ErrorKind::ServerError, "boom"),
            ],
            vec![ScriptStep::token("kept")],
        ]));
        let options = StreamOptions::builder(producer)
            .retry(fast_retry(1))
            .record_to(store.clone())
            .build();

        let handle = stream(options);
        let stream_id = handle.stream_id().to_string();
        let outcome = handle.finish().await.unwrap();
        assert_eq!(outcome.content, "kept");

        let replayer = Replayer::new(store);
        let state = replayer.replay_to_state(&stream_id).await.unwrap();
        assert_eq!(state.content, "kept");
        assert_eq!(state.retry_attempts, 1);
    }

    #[tokio::test]
    async fn test_explicit_adapter_by_name() {
        let producer = Arc::new(ScriptedProducer::tokens(&["named"]));
        let options = StreamOptions::builder(producer).adapter("text").build();
        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "named");
    }

    #[tokio::test]
    async fn test_unknown_adapter_name_fails_fatally() {
        let producer = Arc::new(ScriptedProducer::tokens(&["x"]));
        let options = StreamOptions::builder(producer)
            .adapter("no-such-adapter")
            .retry(fast_retry(3))
            .build();

        let report = stream(options).finish().await.unwrap_err();
        assert_eq!(report.kind, ErrorKind::NoAdapter);
        assert_eq!(report.telemetry.retries.total(), 0);
    }

    #[tokio::test]
    async fn test_sinks_called_in_order_around_events() {
        struct OrderSink {
            name: &'static str,
            log: Arc<Mutex<Vec<String>>>,
        }
        impl Sink for OrderSink {
            fn before(&self, event: &ObservedEvent) {
                if matches!(event.kind, ObservedKind::SessionStart) {
                    self.log.lock().unwrap().push(format!("{}:before", self.name));
                }
            }
            fn after(&self, event: &ObservedEvent) {
                if matches!(event.kind, ObservedKind::SessionStart) {
                    self.log.lock().unwrap().push(format!("{}:after", self.name));
                }
            }
        }

        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let producer = Arc::new(ScriptedProducer::tokens(&["x"]));
        let options = StreamOptions::builder(producer)
            .sink(Arc::new(OrderSink { name: "a", log: log.clone() }))
            .sink(Arc::new(OrderSink { name: "b", log: log.clone() }))
            .build();

        stream(options).finish().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before", "b:before", "a:after", "b:after"]
        );
    }

    #[tokio::test]
    async fn test_monitoring_disabled_skips_sinks_but_not_observer() {
        struct CountingSink(Arc<AtomicUsize>);
        impl Sink for CountingSink {
            fn before(&self, _event: &ObservedEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let sink_calls = Arc::new(AtomicUsize::new(0));
        let (observer, seen) = capture_observed();
        let producer = Arc::new(ScriptedProducer::tokens(&["x"]));
        let options = StreamOptions::builder(producer)
            .monitoring(crate::config::MonitoringConfig::disabled())
            .sink(Arc::new(CountingSink(sink_calls.clone())))
            .observer(observer)
            .build();

        stream(options).finish().await.unwrap();
        assert_eq!(sink_calls.load(Ordering::SeqCst), 0);
        assert!(!seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_folded_on_completion() {
        let metrics = Arc::new(crate::telemetry::MetricSet::new());
        let producer = Arc::new(ScriptedProducer::tokens(&["x", "y"]));
        let monitoring = crate::config::MonitoringConfig {
            metrics: Some(metrics.clone()),
            ..Default::default()
        };
        let options = StreamOptions::builder(producer)
            .monitoring(monitoring)
            .build();

        stream(options).finish().await.unwrap();
        let text = metrics.render(Some("streamguard_"));
        assert!(text.contains("streamguard_sessions_total 1"));
    }

    #[tokio::test]
    async fn test_ollama_shaped_chunks_auto_detected() {
        let producer = Arc::new(ScriptedProducer::new(vec![vec![
            ScriptStep::Chunk(json!({"response": "Hi"})),
            ScriptStep::Chunk(json!({"response": "!", "done": true, "eval_count": 2})),
        ]]));
        let (observer, seen) = capture_observed();
        let options = StreamOptions::builder(producer).observer(observer).build();

        let outcome = stream(options).finish().await.unwrap();
        assert_eq!(outcome.content, "Hi!");
        assert_eq!(outcome.usage.unwrap().completion_tokens, 2);
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|k| matches!(
            k,
            ObservedKind::AdapterDetected { adapter } if adapter == "ollama"
        )));
    }

    #[tokio::test]
    async fn test_retry_callback_sees_delay() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            vec![ScriptStep::fail(ErrorKind::ServerError, "boom")],
            vec![ScriptStep::token("ok")],
        ]));
        let retries: Arc<Mutex<Vec<(RetryReason, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let log = retries.clone();
        let observer = Observer::default().on_retry(move |reason, attempt, _delay| {
            log.lock().unwrap().push((reason, attempt));
        });
        let options = StreamOptions::builder(producer)
            .retry(fast_retry(1))
            .observer(observer)
            .build();

        stream(options).finish().await.unwrap();
        assert_eq!(
            *retries.lock().unwrap(),
            vec![(RetryReason::ServerError, 1)]
        );
    }
}
