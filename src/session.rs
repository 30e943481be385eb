//! Session state types: checkpoints, the terminal outcome, and the
//! structured failure report.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StreamError};
use crate::event::TokenUsage;
use crate::guardrail::Violation;
use crate::stream_id::StreamId;
use crate::telemetry::TelemetrySnapshot;

/// A prefix of the session's content plus the token index at which it was
/// captured. Lives only for the duration of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub content: String,
    pub token_index: usize,
    pub ts: u64,
}

/// The frozen state of a successfully completed session.
#[derive(Debug)]
pub struct SessionOutcome {
    pub stream_id: StreamId,
    /// Concatenation of every yielded token (checkpoint prefix included
    /// when a continuation occurred).
    pub content: String,
    pub token_count: usize,
    /// 0 for the primary producer, k for the k-th fallback.
    pub fallback_index: usize,
    pub continued_from_checkpoint: bool,
    /// Every violation collected over the session, warnings included.
    pub violations: Vec<Violation>,
    pub usage: Option<TokenUsage>,
    pub telemetry: TelemetrySnapshot,
}

/// The structured error a session terminates with.
///
/// Carries the classified kind, the final underlying error as cause, the
/// last checkpoint if any, and the telemetry accumulated up to the failure.
#[derive(Debug)]
pub struct FailureReport {
    pub stream_id: StreamId,
    pub kind: ErrorKind,
    pub message: String,
    /// The final underlying error, when the failure wraps one.
    pub cause: Option<Box<StreamError>>,
    /// Whether any token was yielded before the failure.
    pub produced_content: bool,
    pub checkpoint: Option<Checkpoint>,
    pub fallback_index: usize,
    pub telemetry: TelemetrySnapshot,
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream {} failed ({}): {}", self.stream_id, self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureReport {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_report_display_includes_cause() {
        let report = FailureReport {
            stream_id: StreamId::from_parts(1_700_000_000_000, 1),
            kind: ErrorKind::ServerError,
            message: "all fallbacks exhausted".into(),
            cause: Some(Box::new(StreamError::Server {
                status: 503,
                message: "unavailable".into(),
            })),
            produced_content: false,
            checkpoint: None,
            fallback_index: 2,
            telemetry: TelemetrySnapshot::default(),
        };

        let text = report.to_string();
        assert!(text.contains("server_error"));
        assert!(text.contains("caused by"));
        assert!(std::error::Error::source(&report).is_some());
    }

    #[test]
    fn test_checkpoint_serde_round_trip() {
        let checkpoint = Checkpoint {
            content: "The quick ".into(),
            token_index: 4,
            ts: 1234,
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
