//! Guardrail pipeline: validation rules over partial and terminal content.
//!
//! A [`Guardrail`] inspects the accumulated content and returns
//! [`Violation`]s. The orchestrator runs the streaming phase as tokens
//! arrive (batched by a configurable interval) and the terminal phase once
//! at completion, then follows the aggregated [`Advice`]: fatal violations
//! abort, recoverable errors schedule a retry, warnings are recorded only.

pub mod rules;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use rules::{DriftCapability, DriftRule, JsonStructureRule, PatternRule, SchemaRule};

/// How bad a violation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// One finding produced by a guardrail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Name of the rule that produced this finding.
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    /// Byte offset into the content, when the rule can point at one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Whether a retry is expected to clear this finding.
    pub recoverable: bool,
}

impl Violation {
    /// A recoverable error-severity violation.
    pub fn error(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message: message.into(),
            position: None,
            recoverable: true,
        }
    }

    /// A warning-severity violation, recorded but never acted on.
    pub fn warning(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Warning,
            message: message.into(),
            position: None,
            recoverable: false,
        }
    }

    /// A fatal violation that aborts the session immediately.
    pub fn fatal(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Fatal,
            message: message.into(),
            position: None,
            recoverable: false,
        }
    }

    /// Attach a content position to the finding.
    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// Which scheduling point the pipeline is running at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailPhase {
    /// After tokens during generation, `completed` is false.
    Streaming,
    /// Once at producer completion, `completed` is true.
    Terminal,
}

/// The content snapshot a rule is checked against.
///
/// Rules are pure with respect to this input and must not mutate session
/// state through side channels.
#[derive(Debug, Clone, Copy)]
pub struct GuardrailContext<'a> {
    /// Accumulated content so far (full content in the terminal phase).
    pub content: &'a str,
    /// True only in the terminal phase.
    pub completed: bool,
    /// Number of tokens received so far.
    pub token_count: usize,
    /// Milliseconds since the session started.
    pub elapsed_ms: u64,
    /// Caller-supplied opaque session context.
    pub session_metadata: Option<&'a Value>,
}

/// A validation rule over partial or terminal content.
pub trait Guardrail: Send + Sync {
    /// Rule name, used in violations and telemetry.
    fn name(&self) -> &str;

    /// Check the content and return any findings.
    fn check(&self, ctx: &GuardrailContext<'_>) -> Vec<Violation>;
}

/// What the orchestrator should do after a phase ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    /// No actionable violation; keep going.
    Proceed,
    /// At least one recoverable error-severity violation; schedule a retry.
    Retry,
    /// A fatal violation fired; abort the session.
    Fail,
}

/// Derive the orchestrator's advice from a batch of violations.
pub fn advise(violations: &[Violation]) -> Advice {
    if violations.iter().any(|v| v.severity == Severity::Fatal) {
        return Advice::Fail;
    }
    if violations
        .iter()
        .any(|v| v.severity == Severity::Error && v.recoverable)
    {
        return Advice::Retry;
    }
    Advice::Proceed
}

/// An ordered set of rules with per-phase duplicate suppression.
///
/// The streaming phase runs many times over one attempt; a finding with the
/// same `(rule, message, position)` is reported once per phase. [`reset`]
/// clears the suppression sets when a new attempt starts.
///
/// [`reset`]: GuardrailSet::reset
pub struct GuardrailSet {
    rules: Vec<Arc<dyn Guardrail>>,
    streaming_seen: HashSet<(String, String, Option<usize>)>,
    terminal_seen: HashSet<(String, String, Option<usize>)>,
}

impl GuardrailSet {
    pub fn new(rules: Vec<Arc<dyn Guardrail>>) -> Self {
        Self {
            rules,
            streaming_seen: HashSet::new(),
            terminal_seen: HashSet::new(),
        }
    }

    /// Whether any rules are installed.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Clear duplicate-suppression state for a fresh attempt.
    pub fn reset(&mut self) {
        self.streaming_seen.clear();
        self.terminal_seen.clear();
    }

    /// Run every rule for one phase, returning new (non-duplicate) findings.
    pub fn run_phase(
        &mut self,
        phase: GuardrailPhase,
        ctx: &GuardrailContext<'_>,
    ) -> Vec<Violation> {
        let seen = match phase {
            GuardrailPhase::Streaming => &mut self.streaming_seen,
            GuardrailPhase::Terminal => &mut self.terminal_seen,
        };

        let mut fresh = Vec::new();
        for rule in &self.rules {
            for violation in rule.check(ctx) {
                let key = (
                    violation.rule.clone(),
                    violation.message.clone(),
                    violation.position,
                );
                if seen.insert(key) {
                    fresh.push(violation);
                }
            }
        }
        fresh
    }
}

impl std::fmt::Debug for GuardrailSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.rules.iter().map(|r| r.name()).collect();
        f.debug_struct("GuardrailSet").field("rules", &names).finish()
    }
}
