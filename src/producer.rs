//! Producer contract and the scripted test producer.
//!
//! A [`Producer`] is the untrusted token source: opening it yields a lazy
//! sequence of provider-specific chunks as `serde_json::Value`s. Producers
//! must be restartable: every call to [`Producer::open`] starts a fresh
//! generation. The kernel never interprets chunks itself — that is the
//! adapter's job.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::Stream;
use serde_json::Value;

use crate::error::{ErrorKind, Result, StreamError};

/// A lazy sequence of provider-specific chunks.
pub type ProducerStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// The untrusted token source behind an adapter.
///
/// `continuation` is `Some` when the orchestrator resumes from a checkpoint;
/// it carries the value built by the session's continuation prompt builder.
pub trait Producer: Send + Sync {
    fn open(&self, continuation: Option<&Value>) -> ProducerStream;
}

/// A [`Producer`] backed by a closure.
///
/// # Example
///
/// ```
/// use futures::stream;
/// use serde_json::json;
/// use streamguard::producer::{FnProducer, ProducerStream};
///
/// let producer = FnProducer::new(|_continuation| -> ProducerStream {
///     Box::pin(stream::iter(vec![Ok(json!("Hello")), Ok(json!(" world"))]))
/// });
/// ```
pub struct FnProducer<F>(F);

impl<F> FnProducer<F>
where
    F: Fn(Option<&Value>) -> ProducerStream + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Producer for FnProducer<F>
where
    F: Fn(Option<&Value>) -> ProducerStream + Send + Sync,
{
    fn open(&self, continuation: Option<&Value>) -> ProducerStream {
        (self.0)(continuation)
    }
}

/// One step of a scripted generation.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a plain text token.
    Token(String),
    /// Emit an arbitrary provider chunk.
    Chunk(Value),
    /// Sleep before the next step.
    Delay(Duration),
    /// Fail the stream with a classified error.
    Fail(ErrorKind, String),
}

impl ScriptStep {
    /// Shorthand for [`ScriptStep::Token`].
    pub fn token(value: impl Into<String>) -> Self {
        ScriptStep::Token(value.into())
    }

    /// Shorthand for [`ScriptStep::Fail`].
    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        ScriptStep::Fail(kind, message.into())
    }
}

/// A deterministic producer that replays pre-written scripts in order.
///
/// Each [`open`](Producer::open) consumes the next script, cycling back to
/// the first when exhausted. The inputs each open was called with are kept
/// for assertions, so tests can verify continuation prompts.
///
/// # Example
///
/// ```
/// use streamguard::producer::{ScriptedProducer, ScriptStep};
///
/// let producer = ScriptedProducer::new(vec![vec![
///     ScriptStep::token("Hello"),
///     ScriptStep::token(" world"),
/// ]]);
/// ```
pub struct ScriptedProducer {
    scripts: Vec<Vec<ScriptStep>>,
    index: AtomicUsize,
    opened_with: Mutex<Vec<Option<Value>>>,
}

impl ScriptedProducer {
    /// Create a producer with the given scripts, replayed in order.
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        assert!(
            !scripts.is_empty(),
            "ScriptedProducer requires at least one script"
        );
        Self {
            scripts,
            index: AtomicUsize::new(0),
            opened_with: Mutex::new(Vec::new()),
        }
    }

    /// A producer that always streams the same tokens then completes.
    pub fn tokens(tokens: &[&str]) -> Self {
        Self::new(vec![tokens.iter().map(|t| ScriptStep::token(*t)).collect()])
    }

    /// A producer that always fails with the given error.
    pub fn failing(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(vec![vec![ScriptStep::fail(kind, message)]])
    }

    /// How many times the producer has been opened.
    pub fn open_count(&self) -> usize {
        self.opened_with.lock().unwrap().len()
    }

    /// The continuation inputs recorded for each open, in order.
    pub fn recorded_inputs(&self) -> Vec<Option<Value>> {
        self.opened_with.lock().unwrap().clone()
    }
}

impl Producer for ScriptedProducer {
    fn open(&self, continuation: Option<&Value>) -> ProducerStream {
        self.opened_with
            .lock()
            .unwrap()
            .push(continuation.cloned());

        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.scripts.len();
        let script = self.scripts[idx].clone();

        Box::pin(async_stream::stream! {
            for step in script {
                match step {
                    ScriptStep::Token(text) => yield Ok(Value::String(text)),
                    ScriptStep::Chunk(value) => yield Ok(value),
                    ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Fail(kind, message) => {
                        yield Err(StreamError::from_kind(kind, message));
                        return;
                    }
                }
            }
        })
    }
}
