//! Per-session configuration.
//!
//! [`StreamOptions`] is the single options record a session is created
//! from. It is assembled through [`StreamOptionsBuilder`], constructed once
//! and consumed by the orchestrator.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::adapter::{AdapterRegistry, StreamAdapter};
use crate::error::{ErrorKind, RetryReason};
use crate::event::{Observer, Sink};
use crate::guardrail::Guardrail;
use crate::producer::Producer;
use crate::record::EventStore;
use crate::session::Checkpoint;

/// Builds the producer input for a continuation attempt from a checkpoint.
pub type ContinuationPromptBuilder = Arc<dyn Fn(&Checkpoint) -> Value + Send + Sync>;

/// Backoff growth curve between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Constant delay.
    Fixed,
    /// Constant delay scaled by uniform jitter in `[0.5, 1.5]`.
    FixedJitter,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay doubles per attempt.
    Exponential,
}

/// Retry policy for one session.
///
/// `attempts` bounds retries per producer; exhausting it promotes to the
/// next fallback. Only reasons in `retry_on` are retried at all.
///
/// # Example
///
/// ```
/// use streamguard::config::{Backoff, RetryPolicy};
/// use streamguard::error::RetryReason;
///
/// let policy = RetryPolicy::new(3)
///     .retry_on(&[RetryReason::ServerError, RetryReason::ZeroTokens])
///     .backoff(Backoff::Exponential);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    /// Max retries per producer. Default: 2.
    pub attempts: u32,
    /// Reasons worth retrying. Default: network, rate limit, server, timeout.
    pub retry_on: Vec<RetryReason>,
    /// Growth curve. Default: exponential.
    pub backoff: Backoff,
    /// Base delay before growth. Default: 500ms.
    pub base_delay: Duration,
    /// Hard cap on any computed delay. Default: 30s.
    pub max_delay: Duration,
    /// Per-error-kind base delay overrides (e.g. longer for rate limits).
    pub error_type_delays: HashMap<ErrorKind, Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            retry_on: vec![
                RetryReason::NetworkError,
                RetryReason::RateLimit,
                RetryReason::ServerError,
                RetryReason::Timeout,
            ],
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            error_type_delays: HashMap::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy with the given retry budget and the default reason set.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 0,
            ..Self::default()
        }
    }

    /// Replace the retryable reason set.
    pub fn retry_on(mut self, reasons: &[RetryReason]) -> Self {
        self.retry_on = reasons.to_vec();
        self
    }

    /// Add a reason to the retryable set if absent.
    pub fn also_retry_on(mut self, reason: RetryReason) -> Self {
        if !self.retry_on.contains(&reason) {
            self.retry_on.push(reason);
        }
        self
    }

    /// Set the growth curve.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Override the base delay for one error kind.
    pub fn delay_for_kind(mut self, kind: ErrorKind, delay: Duration) -> Self {
        self.error_type_delays.insert(kind, delay);
        self
    }

    /// Whether the given reason is in the retryable set.
    pub fn retries(&self, reason: RetryReason) -> bool {
        self.retry_on.contains(&reason)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("retry_on", &self.retry_on)
            .field("backoff", &self.backoff)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

/// The two per-attempt supervision timers, both optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Time allowed from attempt start to the first token.
    pub initial_token: Option<Duration>,
    /// Maximum allowed gap between successive tokens.
    pub inter_token: Option<Duration>,
}

impl TimeoutConfig {
    pub fn new(initial_token: Duration, inter_token: Duration) -> Self {
        Self {
            initial_token: Some(initial_token),
            inter_token: Some(inter_token),
        }
    }
}

/// Checkpoint cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Save a checkpoint every this many tokens. Default: 10.
    pub interval: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { interval: 10 }
    }
}

/// Observability gating.
#[derive(Clone)]
pub struct MonitoringConfig {
    /// Master switch for sink delivery. Default: enabled.
    pub enabled: bool,
    /// Fraction of sessions whose events reach sinks. Default: 1.0.
    pub sample_rate: f64,
    /// Extra metadata merged into every observed event's context.
    pub metadata: Option<Value>,
    /// Shared metric surface; finished sessions fold their snapshot in.
    pub metrics: Option<Arc<crate::telemetry::MetricSet>>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            metadata: None,
            metrics: None,
        }
    }
}

impl MonitoringConfig {
    /// Monitoring switched off entirely.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for MonitoringConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringConfig")
            .field("enabled", &self.enabled)
            .field("sample_rate", &self.sample_rate)
            .field("has_metrics", &self.metrics.is_some())
            .finish()
    }
}

/// How the session picks its adapter.
#[derive(Clone)]
pub enum AdapterChoice {
    /// Look the adapter up by name in the registry.
    Named(String),
    /// Use this adapter directly.
    Instance(Arc<dyn StreamAdapter>),
}

impl std::fmt::Debug for AdapterChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterChoice::Named(name) => f.debug_tuple("Named").field(name).finish(),
            AdapterChoice::Instance(adapter) => {
                f.debug_tuple("Instance").field(&adapter.name()).finish()
            }
        }
    }
}

/// The single per-session options record.
///
/// Construct through [`StreamOptions::builder`].
pub struct StreamOptions {
    /// The primary producer.
    pub producer: Arc<dyn Producer>,
    /// Explicit adapter, or `None` for auto-detection.
    pub adapter: Option<AdapterChoice>,
    /// Ordered fallback producers tried after the primary's budget runs out.
    pub fallbacks: Vec<Arc<dyn Producer>>,
    pub retry: RetryPolicy,
    pub timeout: TimeoutConfig,
    /// Zero-token defense. Default: on.
    pub detect_zero_tokens: bool,
    /// Resume from the last checkpoint on retry instead of starting over.
    pub continue_from_checkpoint: bool,
    pub checkpoints: CheckpointConfig,
    /// Builds the continuation producer input. Required for continuation to
    /// actually be taken.
    pub continuation_prompt: Option<ContinuationPromptBuilder>,
    pub guardrails: Vec<Arc<dyn Guardrail>>,
    /// Run the streaming guardrail phase every this many tokens. Default: 1.
    pub guardrail_interval: usize,
    pub monitoring: MonitoringConfig,
    /// Interceptor capabilities, invoked in registration order.
    pub sinks: Vec<Arc<dyn Sink>>,
    pub observer: Observer,
    /// External abort handle checked at every suspension point.
    pub signal: Option<Arc<AtomicBool>>,
    /// Fork all session events into this store.
    pub record_to: Option<Arc<dyn EventStore>>,
    /// Opaque caller context propagated into every observed event.
    pub context: Option<Value>,
    /// Adapter registry override; defaults to the process-wide registry.
    pub registry: Option<Arc<AdapterRegistry>>,
}

impl StreamOptions {
    /// Start building options around a producer.
    pub fn builder(producer: Arc<dyn Producer>) -> StreamOptionsBuilder {
        StreamOptionsBuilder {
            options: StreamOptions {
                producer,
                adapter: None,
                fallbacks: Vec::new(),
                retry: RetryPolicy::default(),
                timeout: TimeoutConfig::default(),
                detect_zero_tokens: true,
                continue_from_checkpoint: false,
                checkpoints: CheckpointConfig::default(),
                continuation_prompt: None,
                guardrails: Vec::new(),
                guardrail_interval: 1,
                monitoring: MonitoringConfig::default(),
                sinks: Vec::new(),
                observer: Observer::default(),
                signal: None,
                record_to: None,
                context: None,
                registry: None,
            },
        }
    }
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("adapter", &self.adapter)
            .field("fallbacks", &self.fallbacks.len())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("detect_zero_tokens", &self.detect_zero_tokens)
            .field("continue_from_checkpoint", &self.continue_from_checkpoint)
            .field("guardrails", &self.guardrails.len())
            .field("sinks", &self.sinks.len())
            .field("has_signal", &self.signal.is_some())
            .field("records", &self.record_to.is_some())
            .finish()
    }
}

/// Builder for [`StreamOptions`].
pub struct StreamOptionsBuilder {
    options: StreamOptions,
}

impl StreamOptionsBuilder {
    /// Select an adapter by registry name.
    pub fn adapter(mut self, name: impl Into<String>) -> Self {
        self.options.adapter = Some(AdapterChoice::Named(name.into()));
        self
    }

    /// Use an adapter instance directly, bypassing the registry.
    pub fn adapter_instance(mut self, adapter: Arc<dyn StreamAdapter>) -> Self {
        self.options.adapter = Some(AdapterChoice::Instance(adapter));
        self
    }

    /// Append one fallback producer.
    pub fn fallback(mut self, producer: Arc<dyn Producer>) -> Self {
        self.options.fallbacks.push(producer);
        self
    }

    /// Replace the fallback list.
    pub fn fallbacks(mut self, producers: Vec<Arc<dyn Producer>>) -> Self {
        self.options.fallbacks = producers;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = policy;
        self
    }

    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn detect_zero_tokens(mut self, enabled: bool) -> Self {
        self.options.detect_zero_tokens = enabled;
        self
    }

    /// Enable continuation from the last checkpoint, with the builder that
    /// turns a checkpoint into the next producer input.
    pub fn continue_from_checkpoint(
        mut self,
        builder: impl Fn(&Checkpoint) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.options.continue_from_checkpoint = true;
        self.options.continuation_prompt = Some(Arc::new(builder));
        self
    }

    /// Checkpoint every `interval` tokens.
    pub fn checkpoint_interval(mut self, interval: usize) -> Self {
        self.options.checkpoints = CheckpointConfig {
            interval: interval.max(1),
        };
        self
    }

    /// Append one guardrail rule.
    pub fn guardrail(mut self, rule: Arc<dyn Guardrail>) -> Self {
        self.options.guardrails.push(rule);
        self
    }

    /// Replace the guardrail list.
    pub fn guardrails(mut self, rules: Vec<Arc<dyn Guardrail>>) -> Self {
        self.options.guardrails = rules;
        self
    }

    /// Batch the streaming guardrail phase to every `interval` tokens.
    pub fn guardrail_interval(mut self, interval: usize) -> Self {
        self.options.guardrail_interval = interval.max(1);
        self
    }

    pub fn monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.options.monitoring = monitoring;
        self
    }

    /// Append one sink capability.
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.options.sinks.push(sink);
        self
    }

    pub fn observer(mut self, observer: Observer) -> Self {
        self.options.observer = observer;
        self
    }

    /// Install the external abort handle.
    pub fn signal(mut self, signal: Arc<AtomicBool>) -> Self {
        self.options.signal = Some(signal);
        self
    }

    /// Fork session events into an event store.
    pub fn record_to(mut self, store: Arc<dyn EventStore>) -> Self {
        self.options.record_to = Some(store);
        self
    }

    /// Attach opaque caller context to every observed event.
    pub fn context(mut self, context: Value) -> Self {
        self.options.context = Some(context);
        self
    }

    /// Use a private adapter registry instead of the process-wide one.
    pub fn registry(mut self, registry: Arc<AdapterRegistry>) -> Self {
        self.options.registry = Some(registry);
        self
    }

    pub fn build(self) -> StreamOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::ScriptedProducer;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 2);
        assert!(policy.retries(RetryReason::NetworkError));
        assert!(policy.retries(RetryReason::RateLimit));
        assert!(policy.retries(RetryReason::ServerError));
        assert!(policy.retries(RetryReason::Timeout));
        assert!(!policy.retries(RetryReason::GuardrailViolation));
        assert!(!policy.retries(RetryReason::ZeroTokens));
    }

    #[test]
    fn test_retry_policy_also_retry_on_is_idempotent() {
        let policy = RetryPolicy::default()
            .also_retry_on(RetryReason::ZeroTokens)
            .also_retry_on(RetryReason::ZeroTokens);
        assert_eq!(
            policy
                .retry_on
                .iter()
                .filter(|r| **r == RetryReason::ZeroTokens)
                .count(),
            1
        );
    }

    #[test]
    fn test_builder_defaults() {
        let options =
            StreamOptions::builder(Arc::new(ScriptedProducer::tokens(&["x"]))).build();
        assert!(options.detect_zero_tokens);
        assert!(!options.continue_from_checkpoint);
        assert_eq!(options.guardrail_interval, 1);
        assert_eq!(options.checkpoints.interval, 10);
        assert!(options.adapter.is_none());
        assert!(options.signal.is_none());
    }

    #[test]
    fn test_builder_guardrail_interval_floor() {
        let options = StreamOptions::builder(Arc::new(ScriptedProducer::tokens(&["x"])))
            .guardrail_interval(0)
            .checkpoint_interval(0)
            .build();
        assert_eq!(options.guardrail_interval, 1);
        assert_eq!(options.checkpoints.interval, 1);
    }

    #[test]
    fn test_builder_continuation_installs_builder() {
        let options = StreamOptions::builder(Arc::new(ScriptedProducer::tokens(&["x"])))
            .continue_from_checkpoint(|cp| serde_json::json!(format!("continue: {}", cp.content)))
            .build();
        assert!(options.continue_from_checkpoint);
        let builder = options.continuation_prompt.unwrap();
        let prompt = builder(&Checkpoint {
            content: "abc".into(),
            token_index: 3,
            ts: 0,
        });
        assert_eq!(prompt, serde_json::json!("continue: abc"));
    }
}
