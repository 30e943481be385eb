//! Adapter registry and stream normalization.
//!
//! An adapter translates one provider's chunk shape into the canonical
//! [`StreamEvent`] taxonomy. The registry keeps adapters in registration
//! order and resolves which one handles a stream, either by explicit name
//! or by probing the first chunk with each adapter's detector.
//!
//! ```text
//! Producer ──► Value chunks ──► StreamAdapter::wrap() ──► StreamEvent stream
//!                                      │
//!                    ┌─────────┬───────┴──────┬───────────┐
//!                 ollama     openai       canonical     text
//! ```

pub mod canonical;
pub mod delta;
pub mod ollama;
pub mod text;

use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};

use futures::Stream;
use serde_json::Value;

pub use canonical::CanonicalAdapter;
pub use delta::OpenAiAdapter;
pub use ollama::OllamaAdapter;
pub use text::TextAdapter;

use crate::error::{Result, StreamError};
use crate::event::StreamEvent;
use crate::producer::ProducerStream;

/// A lazy sequence of canonical stream events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Translator from a provider chunk shape to canonical stream events.
///
/// `detect` is treated as pure: it must answer from the probe chunk alone
/// and never block. Adapters without a detector can only be resolved by
/// name.
pub trait StreamAdapter: Send + Sync {
    /// Unique adapter name, used for explicit selection.
    fn name(&self) -> &str;

    /// Whether this adapter can recognize streams by probing a chunk.
    fn has_detector(&self) -> bool {
        false
    }

    /// Probe one chunk. Only called when [`has_detector`](Self::has_detector)
    /// is true.
    fn detect(&self, _probe: &Value) -> bool {
        false
    }

    /// Translate the raw chunk stream into canonical events.
    fn wrap(&self, raw: ProducerStream) -> EventStream;
}

impl std::fmt::Debug for dyn StreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAdapter").field("name", &self.name()).finish()
    }
}

/// Ordered, process-wide set of adapters.
///
/// Mutation is explicit (`register` / `unregister` / `clear`) and intended
/// for startup and test isolation; a detection pass works on the snapshot
/// observed at call entry.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<Vec<Arc<dyn StreamAdapter>>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in adapters, in detection
    /// priority order: ollama, openai, canonical, text.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry
            .register(Arc::new(OllamaAdapter))
            .expect("empty registry cannot hold duplicates");
        registry
            .register(Arc::new(OpenAiAdapter))
            .expect("empty registry cannot hold duplicates");
        registry
            .register(Arc::new(CanonicalAdapter))
            .expect("empty registry cannot hold duplicates");
        registry
            .register(Arc::new(TextAdapter))
            .expect("empty registry cannot hold duplicates");
        registry
    }

    /// Register an adapter. Fails if the name is already taken.
    ///
    /// Logs a warning for adapters without a detector, since those are
    /// unreachable through auto-detection; use
    /// [`register_silent`](Self::register_silent) to opt out of the warning.
    pub fn register(&self, adapter: Arc<dyn StreamAdapter>) -> Result<()> {
        if !adapter.has_detector() {
            tracing::warn!(
                adapter = adapter.name(),
                "registered without a detector; only reachable by explicit name"
            );
        }
        self.register_silent(adapter)
    }

    /// Register an adapter without the missing-detector warning.
    pub fn register_silent(&self, adapter: Arc<dyn StreamAdapter>) -> Result<()> {
        let mut adapters = self.adapters.write().unwrap();
        if adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(StreamError::DuplicateAdapter(adapter.name().to_string()));
        }
        adapters.push(adapter);
        Ok(())
    }

    /// Remove an adapter by name. Returns whether one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut adapters = self.adapters.write().unwrap();
        let before = adapters.len();
        adapters.retain(|a| a.name() != name);
        adapters.len() != before
    }

    /// Remove every adapter.
    pub fn clear(&self) {
        self.adapters.write().unwrap().clear();
    }

    /// Adapter names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.adapters
            .read()
            .unwrap()
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StreamAdapter>> {
        self.adapters
            .read()
            .unwrap()
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// Resolve the unique adapter whose detector claims the probe chunk.
    ///
    /// Zero matches fails with `NoAdapter`; more than one fails with
    /// `AmbiguousAdapter` listing every claimant. Adapters without a
    /// detector are skipped and counted into the `NoAdapter` message.
    pub fn detect(&self, probe: &Value) -> Result<Arc<dyn StreamAdapter>> {
        let snapshot: Vec<Arc<dyn StreamAdapter>> =
            self.adapters.read().unwrap().iter().cloned().collect();

        let mut without_detector = 0usize;
        let mut matches: Vec<Arc<dyn StreamAdapter>> = Vec::new();
        for adapter in &snapshot {
            if !adapter.has_detector() {
                without_detector += 1;
                continue;
            }
            if adapter.detect(probe) {
                matches.push(adapter.clone());
            }
        }

        match matches.len() {
            0 => Err(StreamError::NoAdapter {
                probed: snapshot.len() - without_detector,
                without_detector,
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(StreamError::AmbiguousAdapter {
                matches: matches.iter().map(|a| a.name().to_string()).collect(),
            }),
        }
    }
}

/// The process-wide registry, initialized with the built-in adapters on
/// first use.
pub fn global() -> &'static AdapterRegistry {
    static GLOBAL: OnceLock<AdapterRegistry> = OnceLock::new();
    GLOBAL.get_or_init(AdapterRegistry::with_defaults)
}
