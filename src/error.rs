//! Error types for crossdiff.
//!
//! All failures inside the service are represented by [`DiffError`]. Errors
//! propagate via `Result<T, DiffError>` throughout the codebase and are
//! converted to HTTP status codes at the API boundary and to a terminal job
//! state by the scheduler.
//!
//! # Error Classification
//!
//! Every error maps to a stable [`ErrorKind`] label used in responses,
//! persisted job records, and metric labels:
//! - **InvalidConfig** — request failed validation. 4xx, no job created.
//! - **Unreachable / AuthFailure / PermissionDenied / NoSuchObject** —
//!   environment problems. Never retried.
//! - **QueryFailure** — driver-level SQL error. Retried with backoff.
//! - **PoolExhausted** — no connection within the acquire timeout. Retried
//!   once, then fails the job.
//! - **Cancelled** — cooperative cancellation. Terminal, partial summary.
//! - **Internal** — invariant violation. Logged with full context, never
//!   swallowed.
//!
//! # Retry Policy
//!
//! [`RetryPolicy`] encapsulates exponential backoff with deterministic
//! jitter. The driver layer uses it for transient SQL failures; everything
//! else bubbles up to the scheduler, which writes the job's terminal state.

use std::fmt;

/// Primary error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    // ── Validation errors — 4xx, no job created ──────────────────────────
    /// The request or comparison configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Connectivity errors — never retried ──────────────────────────────
    /// Network or DNS failure reaching the database endpoint.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Credentials rejected by the database.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Authenticated, but the object is not accessible.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Missing table, namespace, or column.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The dialect is known but its transport is not compiled in, or the
    /// requested operation is not available for it.
    #[error("unsupported for dialect {dialect}: {detail}")]
    Unsupported { dialect: String, detail: String },

    // ── Comparison errors ────────────────────────────────────────────────
    /// Column types cannot be diffed together.
    #[error("incompatible types for column {column}: {source_type} vs {target_type}")]
    TypeIncompatible {
        column: String,
        source_type: String,
        target_type: String,
    },

    // ── Transient errors — retried locally by the driver ─────────────────
    /// Driver-level SQL error.
    #[error("query failed: {0}")]
    QueryFailure(String),

    /// No pooled connection became available within the acquire timeout.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    // ── Terminal states ──────────────────────────────────────────────────
    /// The caller requested cancellation.
    #[error("comparison cancelled")]
    Cancelled,

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error-kind labels, surfaced in responses and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfig,
    Unreachable,
    AuthFailure,
    PermissionDenied,
    NoSuchObject,
    Unsupported,
    TypeIncompatible,
    QueryFailure,
    PoolExhausted,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::Unreachable => "Unreachable",
            ErrorKind::AuthFailure => "AuthFailure",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::NoSuchObject => "NoSuchObject",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::TypeIncompatible => "TypeIncompatible",
            ErrorKind::QueryFailure => "QueryFailure",
            ErrorKind::PoolExhausted => "PoolExhausted",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Parse a persisted kind label back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "InvalidConfig" => ErrorKind::InvalidConfig,
            "Unreachable" => ErrorKind::Unreachable,
            "AuthFailure" => ErrorKind::AuthFailure,
            "PermissionDenied" => ErrorKind::PermissionDenied,
            "NoSuchObject" => ErrorKind::NoSuchObject,
            "Unsupported" => ErrorKind::Unsupported,
            "TypeIncompatible" => ErrorKind::TypeIncompatible,
            "QueryFailure" => ErrorKind::QueryFailure,
            "PoolExhausted" => ErrorKind::PoolExhausted,
            "Cancelled" => ErrorKind::Cancelled,
            "Internal" => ErrorKind::Internal,
            _ => return None,
        })
    }
}

impl DiffError {
    /// Classify the error for responses, persistence, and metrics.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiffError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            DiffError::Unreachable(_) => ErrorKind::Unreachable,
            DiffError::AuthFailure(_) => ErrorKind::AuthFailure,
            DiffError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            DiffError::NoSuchObject(_) => ErrorKind::NoSuchObject,
            DiffError::Unsupported { .. } => ErrorKind::Unsupported,
            DiffError::TypeIncompatible { .. } => ErrorKind::TypeIncompatible,
            DiffError::QueryFailure(_) => ErrorKind::QueryFailure,
            DiffError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            DiffError::Cancelled => ErrorKind::Cancelled,
            DiffError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the driver layer may retry the failed operation.
    ///
    /// Only transient SQL failures qualify; connectivity, auth, validation,
    /// and internal errors fail immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiffError::QueryFailure(_) | DiffError::PoolExhausted(_)
        )
    }

    /// Maximum retry attempts for this error before giving up.
    pub fn max_attempts(&self) -> u32 {
        match self {
            DiffError::QueryFailure(_) => 3,
            DiffError::PoolExhausted(_) => 1,
            _ => 0,
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Retry policy with exponential backoff for transient SQL errors.
///
/// Defaults follow the driver contract: 100ms base delay, doubled each
/// attempt, with deterministic ±20% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay in milliseconds for the given attempt number (0-based).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`, with deterministic
    /// jitter varying ±20% based on attempt parity.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        if attempt % 2 == 0 {
            capped.saturating_mul(4) / 5 // -20%
        } else {
            capped.saturating_mul(6) / 5 // +20%
        }
    }

    /// Whether the given attempt (0-based) is within the retry limit.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
