//! [`SecurityIssue`] and [`Severity`] — the analyzer's output vocabulary.

use serde::{Deserialize, Serialize};

use crate::ast::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// A `critical` or `high` issue rejects the program outright (spec §4.4).
    pub fn is_fatal_by_default(self) -> bool {
        self >= Severity::High
    }
}

/// A CWE (Common Weakness Enumeration) identifier, e.g. `CWE-749`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cwe(pub u32);

impl std::fmt::Display for Cwe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CWE-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub severity: Severity,
    pub message: String,
    pub position: Position,
    pub suggestion: Option<String>,
    pub cwe: Cwe,
    /// Name of the rule that raised this issue, for debugging/telemetry only.
    pub rule: &'static str,
}

impl SecurityIssue {
    pub fn new(
        severity: Severity,
        rule: &'static str,
        message: impl Into<String>,
        position: Position,
        cwe: Cwe,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            position,
            suggestion: None,
            cwe,
            rule,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}
