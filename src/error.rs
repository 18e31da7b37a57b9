//! Engine error taxonomy.
//!
//! Every fallible path in the engine returns [`EngineError`]. The variants
//! are kinds, not type identities: the resilience layer pattern-matches on
//! them to decide whether a call is worth retrying, and the operation
//! surface maps them onto its failure envelope.
//!
//! Structural absence (a `find_*` miss) is expressed as `Option::None`,
//! never as an error; the error channel is reserved for failures.

use thiserror::Error;

/// Tagged error sum for the engine core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A row or resource that was expected to exist is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient failure in an external collaborator (LLM, embedding API,
    /// OCR, filesystem).
    #[error("dependency failure: {0}")]
    Dependency(String),

    /// Rate limited by an external service. `retry_after_ms` overrides the
    /// backoff for the next attempt when present.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// An external call exceeded its wall-clock bound.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Fast-fail from an open circuit breaker.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Malformed payload from a dependency (usually JSON).
    #[error("parse error: {0}")]
    Parse(String),

    /// Unrecoverable internal invariant violation, e.g. a dangling
    /// reference discovered during index build.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether the resilience layer may retry a call that failed with self.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Dependency(_)
                | EngineError::RateLimited { .. }
                | EngineError::Timeout(_)
                | EngineError::Parse(_)
        )
    }

    /// Stable kind label used in the operation failure envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Dependency(_) => "dependency_failure",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::Timeout(_) => "timeout",
            EngineError::CircuitOpen(_) => "circuit_open",
            EngineError::Parse(_) => "parse_error",
            EngineError::Fatal(_) => "fatal",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Dependency(format!("database: {}", e))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Dependency(format!("io: {}", e))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
