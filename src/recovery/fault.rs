//! Fault taxonomy with retry classification.
//!
//! Distinguishes faults worth retrying (transient, resource exhaustion) from
//! faults where retrying is useless (permanent, unclassified).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a fault raised by a fallible operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Network/timeout-like failure - worth retrying with backoff.
    Transient,
    /// Invalid input, auth failure - retrying is useless.
    Permanent,
    /// Rate limit or quota - retry after a (possibly hinted) delay.
    ResourceExhausted,
    /// Unclassified. Treated as permanent so silent retries never mask
    /// unclassified bugs; flagged distinctly for operator visibility.
    Unknown,
}

impl FaultKind {
    /// Check if this kind is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FaultKind::Transient | FaultKind::ResourceExhausted)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::Transient => write!(f, "transient"),
            FaultKind::Permanent => write!(f, "permanent"),
            FaultKind::ResourceExhausted => write!(f, "resource_exhausted"),
            FaultKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A classified fault from a tool call, model call or inter-agent request.
#[derive(Debug, Clone)]
pub struct Fault {
    /// The kind of fault.
    pub kind: FaultKind,
    /// Human-readable description.
    pub message: String,
    /// Suggested retry delay (e.g. from a Retry-After header).
    pub retry_after: Option<Duration>,
}

impl Fault {
    /// Create a transient fault (network error, timeout).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Transient,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a permanent fault (invalid input, auth).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Permanent,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a rate-limit style fault, optionally carrying a retry-after hint.
    pub fn resource_exhausted(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: FaultKind::ResourceExhausted,
            message: message.into(),
            retry_after,
        }
    }

    /// Create an unclassified fault.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Unknown,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Check if this fault is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// Classify an HTTP-like status code into a fault kind. Convenience for
/// callers wrapping REST tools.
pub fn classify_status(status: u16) -> FaultKind {
    match status {
        429 => FaultKind::ResourceExhausted,
        500 | 502 | 503 | 504 => FaultKind::Transient,
        400..=499 => FaultKind::Permanent,
        _ => FaultKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FaultKind::Transient.is_retryable());
        assert!(FaultKind::ResourceExhausted.is_retryable());
        assert!(!FaultKind::Permanent.is_retryable());
        // Unknown is conservatively never retried.
        assert!(!FaultKind::Unknown.is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(429), FaultKind::ResourceExhausted);
        assert_eq!(classify_status(503), FaultKind::Transient);
        assert_eq!(classify_status(401), FaultKind::Permanent);
        assert_eq!(classify_status(302), FaultKind::Unknown);
    }
}
