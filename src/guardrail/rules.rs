//! Built-in guardrail rule families.
//!
//! Pattern rules flag regex matches with a configurable severity. The JSON
//! structure rule catches delimiter imbalance and trailing commas without a
//! full parse. Schema rules delegate to a
//! [`SchemaCapability`](crate::structured::SchemaCapability), and drift
//! rules wrap an opaque [`DriftCapability`] whose scoring heuristics live
//! outside this crate.

use std::sync::Arc;

use regex::Regex;

use super::{Guardrail, GuardrailContext, Severity, Violation};
use crate::error::Result;
use crate::structured::SchemaCapability;

/// Flags content matching a regular expression.
///
/// # Example
///
/// ```
/// use streamguard::guardrail::{Guardrail, GuardrailContext, PatternRule, Severity};
///
/// let rule = PatternRule::new("no-ssn", r"\d{3}-\d{2}-\d{4}", Severity::Fatal).unwrap();
/// let ctx = GuardrailContext {
///     content: "ssn: 123-45-6789",
///     completed: false,
///     token_count: 4,
///     elapsed_ms: 10,
///     session_metadata: None,
/// };
/// assert_eq!(rule.check(&ctx).len(), 1);
/// ```
pub struct PatternRule {
    name: String,
    pattern: Regex,
    severity: Severity,
    recoverable: bool,
}

impl PatternRule {
    /// Compile a pattern rule. Error-severity rules default to recoverable.
    pub fn new(name: impl Into<String>, pattern: &str, severity: Severity) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| crate::error::StreamError::Other(format!("invalid pattern: {e}")))?;
        Ok(Self {
            name: name.into(),
            pattern,
            severity,
            recoverable: severity == Severity::Error,
        })
    }

    /// Override whether a retry is expected to clear the finding.
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}

impl Guardrail for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, ctx: &GuardrailContext<'_>) -> Vec<Violation> {
        self.pattern
            .find_iter(ctx.content)
            .map(|m| Violation {
                rule: self.name.clone(),
                severity: self.severity,
                message: format!("pattern matched: {:?}", m.as_str()),
                position: Some(m.start()),
                recoverable: self.recoverable,
            })
            .collect()
    }
}

/// Structural JSON checks that run without a full parse.
///
/// During streaming only premature closing delimiters are flagged (the
/// content is expected to be truncated). At the terminal phase the rule
/// additionally requires balanced delimiters, a closed final string, and no
/// trailing commas.
#[derive(Debug, Default)]
pub struct JsonStructureRule;

impl JsonStructureRule {
    pub fn new() -> Self {
        Self
    }
}

impl Guardrail for JsonStructureRule {
    fn name(&self) -> &str {
        "json-structure"
    }

    fn check(&self, ctx: &GuardrailContext<'_>) -> Vec<Violation> {
        let trimmed = ctx.content.trim();
        if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
            return Vec::new();
        }

        let mut violations = Vec::new();
        let mut depth: i64 = 0;
        let mut in_string = false;
        let mut escape_next = false;
        let mut last_comma: Option<usize> = None;

        for (i, ch) in trimmed.char_indices() {
            if escape_next {
                escape_next = false;
                continue;
            }
            if in_string {
                if ch == '\\' {
                    escape_next = true;
                } else if ch == '"' {
                    in_string = false;
                }
                continue;
            }
            match ch {
                '"' => {
                    in_string = true;
                    last_comma = None;
                }
                '{' | '[' => {
                    depth += 1;
                    last_comma = None;
                }
                '}' | ']' => {
                    depth -= 1;
                    if depth < 0 {
                        violations.push(
                            Violation::error(
                                self.name(),
                                format!("unmatched closing '{ch}'"),
                            )
                            .at(i),
                        );
                        return violations;
                    }
                    if let Some(pos) = last_comma {
                        violations.push(
                            Violation::error(self.name(), "trailing comma before close").at(pos),
                        );
                    }
                    last_comma = None;
                }
                ',' => last_comma = Some(i),
                c if c.is_whitespace() => {}
                _ => last_comma = None,
            }
        }

        if ctx.completed {
            if in_string {
                violations.push(Violation::error(self.name(), "unterminated string"));
            }
            if depth > 0 {
                violations.push(Violation::error(
                    self.name(),
                    format!("{depth} unclosed delimiter(s)"),
                ));
            }
        }

        violations
    }
}

/// Validates terminal content against a declared schema.
///
/// The content must parse as JSON and satisfy the capability's
/// `safe_parse`. Findings carry severity `error` with `recoverable = true`
/// so the orchestrator schedules a retry.
pub struct SchemaRule {
    name: String,
    schema: Arc<dyn SchemaCapability>,
}

impl SchemaRule {
    pub fn new(schema: Arc<dyn SchemaCapability>) -> Self {
        Self {
            name: "schema".into(),
            schema,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Guardrail for SchemaRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, ctx: &GuardrailContext<'_>) -> Vec<Violation> {
        if !ctx.completed {
            return Vec::new();
        }
        let value = match serde_json::from_str::<serde_json::Value>(ctx.content.trim()) {
            Ok(v) => v,
            Err(e) => {
                return vec![Violation::error(self.name(), format!("invalid JSON: {e}"))];
            }
        };
        match self.schema.safe_parse(&value) {
            Ok(_) => Vec::new(),
            Err(message) => vec![Violation::error(self.name(), message)],
        }
    }
}

/// Opaque drift heuristic (tone shift, repetition entropy, etc.).
///
/// Scoring thresholds belong to the capability implementation, not to this
/// crate. A `Some` assessment is surfaced as a warning-severity violation
/// and as a DRIFT_DETECTED observability event.
pub trait DriftCapability: Send + Sync {
    /// Short identifier for the heuristic.
    fn name(&self) -> &str;

    /// Return a human-readable finding when drift is detected.
    fn assess(&self, content: &str) -> Option<String>;
}

/// Adapts a [`DriftCapability`] into the guardrail pipeline.
pub struct DriftRule {
    capability: Arc<dyn DriftCapability>,
}

impl DriftRule {
    pub fn new(capability: Arc<dyn DriftCapability>) -> Self {
        Self { capability }
    }
}

impl Guardrail for DriftRule {
    fn name(&self) -> &str {
        "drift"
    }

    fn check(&self, ctx: &GuardrailContext<'_>) -> Vec<Violation> {
        match self.capability.assess(ctx.content) {
            Some(detail) => vec![Violation {
                rule: format!("drift:{}", self.capability.name()),
                severity: Severity::Warning,
                message: detail,
                position: None,
                recoverable: false,
            }],
            None => Vec::new(),
        }
    }
}
