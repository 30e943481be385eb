//! Error taxonomy and classification for stream sessions.
//!
//! Every failure the kernel can observe maps onto one [`ErrorKind`]. Provider
//! errors arrive as status codes or free-form messages and are classified
//! once, at the adapter boundary, by [`StreamError::from_status`] and
//! [`StreamError::from_message`]. Classification is pure and deterministic.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of error kinds the kernel distinguishes.
///
/// Retry policy, telemetry tallies, and the terminal failure report all key
/// off this enum rather than the concrete [`StreamError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkError,
    RateLimit,
    ServerError,
    ClientError,
    AuthError,
    Timeout,
    Cancelled,
    ZeroTokens,
    GuardrailViolation,
    Incomplete,
    FatalGuardrail,
    NoAdapter,
    AmbiguousAdapter,
    DuplicateAdapter,
    ConsensusTimeout,
    AllStreamsFailed,
    SchemaValidation,
    Unknown,
}

impl ErrorKind {
    /// Stable snake_case label, used in telemetry tallies and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "network_error",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ZeroTokens => "zero_tokens",
            ErrorKind::GuardrailViolation => "guardrail_violation",
            ErrorKind::Incomplete => "incomplete",
            ErrorKind::FatalGuardrail => "fatal_guardrail",
            ErrorKind::NoAdapter => "no_adapter",
            ErrorKind::AmbiguousAdapter => "ambiguous_adapter",
            ErrorKind::DuplicateAdapter => "duplicate_adapter",
            ErrorKind::ConsensusTimeout => "consensus_timeout",
            ErrorKind::AllStreamsFailed => "all_streams_failed",
            ErrorKind::SchemaValidation => "schema_validation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Reasons a retry can be scheduled for.
///
/// The configured `retry_on` set of
/// [`RetryPolicy`](crate::config::RetryPolicy) is a subset of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    NetworkError,
    RateLimit,
    ServerError,
    Timeout,
    GuardrailViolation,
    ZeroTokens,
    Incomplete,
    Unknown,
}

impl RetryReason {
    /// Stable snake_case label for events and recorded retries.
    pub fn label(&self) -> &'static str {
        match self {
            RetryReason::NetworkError => "network_error",
            RetryReason::RateLimit => "rate_limit",
            RetryReason::ServerError => "server_error",
            RetryReason::Timeout => "timeout",
            RetryReason::GuardrailViolation => "guardrail_violation",
            RetryReason::ZeroTokens => "zero_tokens",
            RetryReason::Incomplete => "incomplete",
            RetryReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Classification of a zero-token attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroTokenCategory {
    /// The producer terminated without emitting any token.
    Network,
    /// Tokens arrived but the content carries no meaningful characters.
    Encoding,
    /// Completion came implausibly fast with almost no tokens.
    Transport,
}

impl std::fmt::Display for ZeroTokenCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ZeroTokenCategory::Network => "network",
            ZeroTokenCategory::Encoding => "encoding",
            ZeroTokenCategory::Transport => "transport",
        };
        f.write_str(s)
    }
}

/// Which of the two per-attempt timers expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Time from attempt start to the first token.
    InitialToken,
    /// Maximum gap between successive tokens.
    InterToken,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeoutKind::InitialToken => "initial_token",
            TimeoutKind::InterToken => "inter_token",
        };
        f.write_str(s)
    }
}

/// Errors produced by the kernel and its components.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Connection-level transport failure (refused, reset, DNS, broken pipe).
    #[error("network error: {0}")]
    Network(String),

    /// Provider rate limit, with an optional server-suggested delay.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Provider-side 5xx failure.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Caller-side 4xx failure other than auth or rate limit.
    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },

    /// Authentication or authorization failure.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// One of the per-attempt timers expired.
    #[error("{which} timeout after {elapsed_ms}ms")]
    Timeout { which: TimeoutKind, elapsed_ms: u64 },

    /// The session was cancelled through its abort handle.
    #[error("stream was cancelled")]
    Cancelled,

    /// The attempt produced nothing usable.
    #[error("zero tokens produced ({category} category)")]
    ZeroTokens { category: ZeroTokenCategory },

    /// A guardrail demanded a retry.
    #[error("guardrail violation: {0}")]
    Guardrail(String),

    /// The output stopped short of a usable completion.
    #[error("incomplete output: {0}")]
    Incomplete(String),

    /// A guardrail of fatal severity fired.
    #[error("fatal guardrail violation: {0}")]
    FatalGuardrail(String),

    /// No registered adapter recognized the stream.
    #[error("no adapter matched the stream ({probed} probed, {without_detector} without a detector)")]
    NoAdapter { probed: usize, without_detector: usize },

    /// Two or more adapters claimed the stream.
    #[error("ambiguous adapter detection: {}", matches.join(", "))]
    AmbiguousAdapter { matches: Vec<String> },

    /// An adapter with this name is already registered.
    #[error("adapter '{0}' is already registered")]
    DuplicateAdapter(String),

    /// The consensus engine gave up waiting on pending generations.
    #[error("consensus timed out after {0:?}")]
    ConsensusTimeout(Duration),

    /// Every generation in a consensus run failed.
    #[error("all {0} streams failed")]
    AllStreamsFailed(usize),

    /// The parsed value did not conform to the declared schema.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for errors outside the taxonomy.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Network(_) => ErrorKind::NetworkError,
            StreamError::RateLimit { .. } => ErrorKind::RateLimit,
            StreamError::Server { .. } => ErrorKind::ServerError,
            StreamError::Client { .. } => ErrorKind::ClientError,
            StreamError::Auth(_) => ErrorKind::AuthError,
            StreamError::Timeout { .. } => ErrorKind::Timeout,
            StreamError::Cancelled => ErrorKind::Cancelled,
            StreamError::ZeroTokens { .. } => ErrorKind::ZeroTokens,
            StreamError::Guardrail(_) => ErrorKind::GuardrailViolation,
            StreamError::Incomplete(_) => ErrorKind::Incomplete,
            StreamError::FatalGuardrail(_) => ErrorKind::FatalGuardrail,
            StreamError::NoAdapter { .. } => ErrorKind::NoAdapter,
            StreamError::AmbiguousAdapter { .. } => ErrorKind::AmbiguousAdapter,
            StreamError::DuplicateAdapter(_) => ErrorKind::DuplicateAdapter,
            StreamError::ConsensusTimeout(_) => ErrorKind::ConsensusTimeout,
            StreamError::AllStreamsFailed(_) => ErrorKind::AllStreamsFailed,
            StreamError::SchemaValidation(_) => ErrorKind::SchemaValidation,
            StreamError::Json(_) => ErrorKind::Unknown,
            StreamError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// The retry reason this error maps to, if any.
    ///
    /// Fatal kinds (cancellation, adapter resolution failures, fatal
    /// guardrails) return `None` and are never retried.
    pub fn retry_reason(&self) -> Option<RetryReason> {
        match self.kind() {
            ErrorKind::NetworkError => Some(RetryReason::NetworkError),
            ErrorKind::RateLimit => Some(RetryReason::RateLimit),
            ErrorKind::ServerError => Some(RetryReason::ServerError),
            ErrorKind::Timeout => Some(RetryReason::Timeout),
            ErrorKind::GuardrailViolation => Some(RetryReason::GuardrailViolation),
            ErrorKind::ZeroTokens => Some(RetryReason::ZeroTokens),
            ErrorKind::Incomplete => Some(RetryReason::Incomplete),
            ErrorKind::Unknown => Some(RetryReason::Unknown),
            _ => None,
        }
    }

    /// Whether this error aborts the session regardless of remaining budget.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Cancelled
                | ErrorKind::FatalGuardrail
                | ErrorKind::NoAdapter
                | ErrorKind::AmbiguousAdapter
                | ErrorKind::DuplicateAdapter
        )
    }

    /// Rebuild a representative error from a kind and message.
    ///
    /// Used by scripted producers and the replayer, where only the
    /// classified kind was persisted.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NetworkError => StreamError::Network(message),
            ErrorKind::RateLimit => StreamError::RateLimit {
                message,
                retry_after: None,
            },
            ErrorKind::ServerError => StreamError::Server {
                status: 500,
                message,
            },
            ErrorKind::ClientError => StreamError::Client {
                status: 400,
                message,
            },
            ErrorKind::AuthError => StreamError::Auth(message),
            ErrorKind::Timeout => StreamError::Timeout {
                which: TimeoutKind::InterToken,
                elapsed_ms: 0,
            },
            ErrorKind::Cancelled => StreamError::Cancelled,
            ErrorKind::ZeroTokens => StreamError::ZeroTokens {
                category: ZeroTokenCategory::Network,
            },
            ErrorKind::GuardrailViolation => StreamError::Guardrail(message),
            ErrorKind::Incomplete => StreamError::Incomplete(message),
            ErrorKind::FatalGuardrail => StreamError::FatalGuardrail(message),
            ErrorKind::NoAdapter => StreamError::NoAdapter {
                probed: 0,
                without_detector: 0,
            },
            ErrorKind::AmbiguousAdapter => StreamError::AmbiguousAdapter {
                matches: Vec::new(),
            },
            ErrorKind::DuplicateAdapter => StreamError::DuplicateAdapter(message),
            ErrorKind::ConsensusTimeout => {
                StreamError::ConsensusTimeout(Duration::from_millis(0))
            }
            ErrorKind::AllStreamsFailed => StreamError::AllStreamsFailed(0),
            ErrorKind::SchemaValidation => StreamError::SchemaValidation(message),
            ErrorKind::Unknown => StreamError::Other(message),
        }
    }

    /// Classify an HTTP status code into the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => StreamError::RateLimit {
                message: body,
                retry_after: None,
            },
            401 | 403 => StreamError::Auth(body),
            500..=599 => StreamError::Server {
                status,
                message: body,
            },
            400..=499 => StreamError::Client {
                status,
                message: body,
            },
            _ => StreamError::Other(body),
        }
    }

    /// Classify a free-form provider error message into the taxonomy.
    ///
    /// Matches on well-known substrings; anything unrecognized becomes
    /// [`StreamError::Other`] with kind `unknown`.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();

        if lower.contains("timed out") || lower.contains("timeout") {
            return StreamError::Timeout {
                which: TimeoutKind::InterToken,
                elapsed_ms: 0,
            };
        }
        if lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("429")
        {
            return StreamError::RateLimit {
                message,
                retry_after: None,
            };
        }
        if lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("api key")
            || lower.contains("authentication")
        {
            return StreamError::Auth(message);
        }
        if lower.contains("connection")
            || lower.contains("network")
            || lower.contains("dns")
            || lower.contains("refused")
            || lower.contains("reset")
            || lower.contains("broken pipe")
            || lower.contains("socket")
        {
            return StreamError::Network(message);
        }
        if lower.contains("internal server error")
            || lower.contains("service unavailable")
            || lower.contains("bad gateway")
            || lower.contains("overloaded")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
        {
            return StreamError::Server {
                status: 500,
                message,
            };
        }

        StreamError::Other(message)
    }
}

impl From<anyhow::Error> for StreamError {
    fn from(err: anyhow::Error) -> Self {
        StreamError::from_message(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
