//! Telemetry aggregation, provider-agnostic.
//!
//! Each session accumulates a [`TelemetrySnapshot`] that is frozen at the
//! terminal event. [`MetricSet`] is the minimal text metric surface:
//! labeled counters, gauges, and histograms, renderable as line-oriented
//! text and addressable by name prefix. Exporters (Prometheus,
//! OpenTelemetry) are external collaborators that consume either shape.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::RetryReason;
use crate::guardrail::Violation;

/// Retry counts, grouped the way operators page on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTotals {
    /// Transport-level retries: network, server, timeout, unknown.
    pub network: u32,
    /// Output-quality retries: guardrails, zero tokens, incomplete output.
    pub model: u32,
    /// Provider throttling.
    pub rate_limit: u32,
}

impl RetryTotals {
    pub fn total(&self) -> u32 {
        self.network + self.model + self.rate_limit
    }

    pub(crate) fn tally(&mut self, reason: RetryReason) {
        match reason {
            RetryReason::RateLimit => self.rate_limit += 1,
            RetryReason::GuardrailViolation
            | RetryReason::ZeroTokens
            | RetryReason::Incomplete => self.model += 1,
            RetryReason::NetworkError
            | RetryReason::ServerError
            | RetryReason::Timeout
            | RetryReason::Unknown => self.network += 1,
        }
    }
}

/// Whether continuation was configured and how often it was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationStats {
    pub enabled: bool,
    pub used: bool,
    pub count: u32,
}

/// The frozen per-session telemetry record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub session_id: String,
    pub duration_ms: u64,
    pub tokens_total: usize,
    pub time_to_first_token_ms: Option<u64>,
    pub retries: RetryTotals,
    pub violations_by_rule: BTreeMap<String, u32>,
    pub violations_by_severity: BTreeMap<String, u32>,
    pub continuation: ContinuationStats,
    pub network_errors: BTreeMap<String, u32>,
}

impl TelemetrySnapshot {
    pub(crate) fn tally_violation(&mut self, violation: &Violation) {
        *self
            .violations_by_rule
            .entry(violation.rule.clone())
            .or_insert(0) += 1;
        *self
            .violations_by_severity
            .entry(violation.severity.to_string())
            .or_insert(0) += 1;
    }

    pub(crate) fn tally_network_error(&mut self, label: &str) {
        *self.network_errors.entry(label.to_string()).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Histogram {
        count: u64,
        sum: f64,
        min: f64,
        max: f64,
    },
}

/// Minimal labeled metric surface with line-oriented text rendering.
///
/// # Example
///
/// ```
/// use streamguard::telemetry::MetricSet;
///
/// let metrics = MetricSet::new();
/// metrics.counter("stream_retries", &[("reason", "timeout")], 1.0);
/// metrics.gauge("stream_active", &[], 3.0);
///
/// let text = metrics.render(Some("stream_"));
/// assert!(text.contains(r#"stream_retries{reason="timeout"} 1"#));
/// ```
#[derive(Default)]
pub struct MetricSet {
    inner: Mutex<BTreeMap<MetricKey, MetricValue>>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, labels: &[(&str, &str)]) -> MetricKey {
        MetricKey {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Add to a monotonically increasing counter.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .entry(Self::key(name, labels))
            .or_insert(MetricValue::Counter(0.0))
        {
            MetricValue::Counter(v) => *v += delta,
            other => *other = MetricValue::Counter(delta),
        }
    }

    /// Set a gauge to the given value.
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.inner
            .lock()
            .unwrap()
            .insert(Self::key(name, labels), MetricValue::Gauge(value));
    }

    /// Record one observation into a histogram.
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .entry(Self::key(name, labels))
            .or_insert(MetricValue::Histogram {
                count: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            }) {
            MetricValue::Histogram {
                count,
                sum,
                min,
                max,
            } => {
                *count += 1;
                *sum += value;
                *min = min.min(value);
                *max = max.max(value);
            }
            other => {
                *other = MetricValue::Histogram {
                    count: 1,
                    sum: value,
                    min: value,
                    max: value,
                }
            }
        }
    }

    /// Fold a finished session's snapshot into the shared metrics.
    pub fn record_session(&self, snapshot: &TelemetrySnapshot) {
        self.counter("streamguard_sessions_total", &[], 1.0);
        self.observe("streamguard_session_duration_ms", &[], snapshot.duration_ms as f64);
        self.observe(
            "streamguard_session_tokens",
            &[],
            snapshot.tokens_total as f64,
        );
        if let Some(ttft) = snapshot.time_to_first_token_ms {
            self.observe("streamguard_time_to_first_token_ms", &[], ttft as f64);
        }
        for (group, count) in [
            ("network", snapshot.retries.network),
            ("model", snapshot.retries.model),
            ("rate_limit", snapshot.retries.rate_limit),
        ] {
            if count > 0 {
                self.counter(
                    "streamguard_retries_total",
                    &[("group", group)],
                    count as f64,
                );
            }
        }
        for (rule, count) in &snapshot.violations_by_rule {
            self.counter(
                "streamguard_violations_total",
                &[("rule", rule)],
                *count as f64,
            );
        }
        for (kind, count) in &snapshot.network_errors {
            self.counter(
                "streamguard_network_errors_total",
                &[("kind", kind)],
                *count as f64,
            );
        }
        if snapshot.continuation.count > 0 {
            self.counter(
                "streamguard_continuations_total",
                &[],
                snapshot.continuation.count as f64,
            );
        }
    }

    /// Render metrics as text lines, optionally filtered by name prefix.
    ///
    /// One line per counter/gauge; histograms render `_count`, `_sum`,
    /// `_min`, and `_max` lines. Output is sorted by name then labels.
    pub fn render(&self, prefix: Option<&str>) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();
        for (key, value) in inner.iter() {
            if let Some(p) = prefix {
                if !key.name.starts_with(p) {
                    continue;
                }
            }
            let labels = render_labels(&key.labels);
            match value {
                MetricValue::Counter(v) | MetricValue::Gauge(v) => {
                    out.push_str(&format!("{}{} {}\n", key.name, labels, trim_float(*v)));
                }
                MetricValue::Histogram {
                    count,
                    sum,
                    min,
                    max,
                } => {
                    out.push_str(&format!("{}_count{} {}\n", key.name, labels, count));
                    out.push_str(&format!("{}_sum{} {}\n", key.name, labels, trim_float(*sum)));
                    out.push_str(&format!("{}_min{} {}\n", key.name, labels, trim_float(*min)));
                    out.push_str(&format!("{}_max{} {}\n", key.name, labels, trim_float(*max)));
                }
            }
        }
        out
    }
}

fn render_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", parts.join(","))
}

fn trim_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}
