//! # Streamguard
//!
//! Reliability and observability kernel for token-streaming inference.
//!
//! This crate wraps an untrusted, potentially flaky token producer (an LLM
//! or similar) and turns its raw stream into a disciplined event stream
//! with guaranteed semantics around failure recovery, structural
//! validation, and cross-generation agreement.
//!
//! ## Core Concepts
//!
//! - **[`Producer`]** — the restartable token source, opened fresh per
//!   attempt and normalized by an adapter.
//! - **[`stream`]** — the orchestrator: retry/fallback/continuation state
//!   machine with timeout supervision, zero-token defense, guardrails,
//!   checkpoints, and cancellation. Returns a lazy [`StreamHandle`].
//! - **[`Guardrail`]** — validation rules over partial and terminal
//!   content; violations drive retries or abort the session.
//! - **[`MemoryStore`]/[`Recorder`]/[`Replayer`]** — append-only event
//!   sourcing with deterministic replay.
//! - **[`consensus`]** — run N generations and resolve a single value
//!   plus confidence.
//! - **[`structured`]** — validate-then-repair pipeline producing a
//!   schema-conforming value.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use streamguard::{stream, ScriptedProducer, StreamOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let producer = Arc::new(ScriptedProducer::tokens(&["Hello", " world"]));
//!     let options = StreamOptions::builder(producer).build();
//!
//!     let outcome = stream(options).finish().await.unwrap();
//!     assert_eq!(outcome.content, "Hello world");
//! }
//! ```
//!
//! ## Resilience
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use streamguard::{stream, RetryPolicy, ScriptedProducer, StreamOptions, TimeoutConfig};
//!
//! # async fn demo(primary: Arc<ScriptedProducer>, backup: Arc<ScriptedProducer>) {
//! let options = StreamOptions::builder(primary)
//!     .fallback(backup)
//!     .retry(RetryPolicy::new(3))
//!     .timeout(TimeoutConfig::new(
//!         Duration::from_secs(10),
//!         Duration::from_secs(5),
//!     ))
//!     .continue_from_checkpoint(|cp| {
//!         serde_json::json!(format!("Continue exactly from: {}", cp.content))
//!     })
//!     .build();
//! let outcome = stream(options).finish().await;
//! # let _ = outcome;
//! # }
//! ```

pub mod adapter;
pub mod backoff;
pub mod concurrency;
pub mod config;
pub mod consensus;
pub mod decode;
pub mod error;
pub mod event;
pub mod guardrail;
pub mod orchestrator;
pub mod producer;
pub mod record;
pub mod repair;
pub mod session;
pub mod similarity;
pub mod stream_id;
pub mod structured;
pub mod telemetry;
pub mod zero_token;

// --- Primary exports ---
pub use adapter::{AdapterRegistry, StreamAdapter};
pub use concurrency::{parallel, race, ParallelOptions, ParallelOutcome};
pub use config::{
    Backoff, CheckpointConfig, MonitoringConfig, RetryPolicy, StreamOptions, TimeoutConfig,
};
pub use consensus::{
    consensus, ConflictResolution, ConsensusOptions, ConsensusResult, ConsensusStrategy,
};
pub use decode::NdjsonDecoder;
pub use error::{ErrorKind, Result, RetryReason, StreamError};
pub use event::{Observer, ObservedEvent, ObservedKind, Sink, StreamEvent, TokenUsage};
pub use guardrail::{Guardrail, GuardrailContext, GuardrailPhase, Severity, Violation};
pub use orchestrator::{stream, SessionResult, StreamHandle};
pub use producer::{FnProducer, Producer, ScriptStep, ScriptedProducer};
pub use record::{EventStore, MemoryStore, RecordedEvent, Recorder, Replayer};
pub use repair::auto_correct;
pub use session::{Checkpoint, FailureReport, SessionOutcome};
pub use stream_id::StreamId;
pub use structured::{structured, structured_stream, SchemaCapability, SerdeSchema};
pub use telemetry::{MetricSet, TelemetrySnapshot};
