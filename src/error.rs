//! Error taxonomy for the analyzer, capability system, and sandbox executor.
//!
//! Every fallible core operation returns [`CoreResult`]. Analyzer findings are
//! collected as [`crate::analyzer::SecurityIssue`] values rather than errors —
//! analysis itself never fails, it only ever *rejects* (see
//! [`CoreError::ProgramRejected`]).

use std::fmt;

use crate::analyzer::SecurityIssue;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The external parser failed before the analyzer ever saw an AST.
    /// The core does not interpret parse errors; it only propagates them.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The analyzer rejected the program (at least one issue with
    /// severity >= high, or severity >= medium under
    /// `analyzer.treat_medium_as_fatal`).
    #[error("program rejected: {} issue(s), {} fatal", .issues.len(), .fatal_count)]
    ProgramRejected {
        issues: Vec<SecurityIssue>,
        fatal_count: usize,
    },

    /// A capability lookup failed: missing token, constraint violation,
    /// expiry, or usage exhaustion.
    #[error("capability denied for resource '{resource}' op '{operation}': {reason}")]
    CapabilityDenied {
        resource: String,
        operation: String,
        reason: CapabilityDenialReason,
    },

    /// An attribute or function was not present in the safe-attribute
    /// registry (or not whitelisted as a free function) for the gate.
    #[error("operation forbidden: {0}")]
    OperationForbidden(String),

    /// The sandboxed child breached a configured resource limit.
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    /// The sandboxed child died without producing a result (crash, signal,
    /// OOM-kill).
    #[error("sandbox child crashed: {0}")]
    SandboxCrash(String),

    /// The sandboxed execution exceeded its wall-clock budget.
    #[error("execution timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// A token or context was constructed with invalid parameters (empty
    /// patterns/ops, non-positive TTL, operation outside the type's
    /// vocabulary).
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    /// Infrastructure-level I/O failure (spawning the child, reading the IPC
    /// pipe, writing a temp file, ...).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for conditions that don't fit the taxonomy above (kept
    /// narrow and rare by design).
    #[error("{0}")]
    Generic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityDenialReason {
    NotFound,
    PatternMismatch,
    OperationDenied,
    Expired,
    UsageExhausted,
}

impl fmt::Display for CapabilityDenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CapabilityDenialReason::NotFound => "no matching token",
            CapabilityDenialReason::PatternMismatch => "pattern mismatch",
            CapabilityDenialReason::OperationDenied => "operation not allowed",
            CapabilityDenialReason::Expired => "token expired",
            CapabilityDenialReason::UsageExhausted => "usage exhausted",
        };
        f.write_str(s)
    }
}
