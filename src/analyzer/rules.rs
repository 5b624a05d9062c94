//! Rule predicates for the security analyzer (spec §4.4, rules 1-6).
//!
//! Kept as small pure functions so the visitor (the "state machine per call
//! site") stays a thin traversal and every rule is independently testable.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::{BinaryOp, Expression};

/// Calls whose callee is one of these identifiers are rejected outright
/// (spec rule 2, CWE-94). Fixed set, context-insensitive.
pub const FORBIDDEN_CALL_NAMES: &[&str] = &["eval", "exec", "compile", "__import__"];

/// The runtime's dynamic-dispatch primitives (spec rule 6).
pub const SENSITIVE_CALLEES: &[&str] = &["getattr", "setattr", "hasattr", "call"];

/// Host-runtime modules that are always rejected regardless of the
/// configured allowlist (spec rule 3: "OS/process/subprocess/reflection-
/// adjacent modules").
pub const ALWAYS_FORBIDDEN_MODULES: &[&str] = &[
    "os", "sys", "subprocess", "process", "reflect", "reflection", "inspect", "importlib", "ctypes",
];

static INJECTION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(eval\s*\(|exec\s*\(|os\.system\s*\(|subprocess\.)").expect("valid regex")
});

/// Rule 1: an identifier (or member-access attribute name) beginning or
/// ending with `__` is rejected — covers direct dunder access such as
/// `obj.__class__` (CWE-749).
pub fn is_forbidden_identifier(name: &str) -> bool {
    name.starts_with("__") || name.ends_with("__")
}

/// Rule 2: callee identifier in the fixed denylist (CWE-94).
pub fn is_forbidden_call_name(name: &str) -> bool {
    FORBIDDEN_CALL_NAMES.contains(&name)
}

/// Rule 3: import allowlist. `p` is rejected unless it's in
/// `allowed_modules`, and always rejected if it names an OS/process/
/// subprocess/reflection-adjacent module, regardless of the allowlist
/// (CWE-829).
pub fn is_import_rejected(path: &str, allowed_modules: &HashSet<String>) -> bool {
    if ALWAYS_FORBIDDEN_MODULES.contains(&path) {
        return true;
    }
    !allowed_modules.contains(path)
}

/// Rule 4: a string literal beginning/ending with `__`, or matching a
/// code-injection pattern, is rejected. Returns `Some(is_dunder_shaped)` if
/// rejected, `None` if the literal is fine. `is_dunder_shaped` selects the
/// CWE tag at the call site (CWE-749 vs CWE-94).
pub fn dangerous_string_literal(value: &str) -> Option<bool> {
    if value.starts_with("__") || value.ends_with("__") {
        Some(true)
    } else if INJECTION_PATTERN.is_match(value) {
        Some(false)
    } else {
        None
    }
}

/// A fragment is "short enough to be part of a dunder name" per spec rule 5.
const DUNDER_FRAGMENT_MAX_LEN: usize = 10;

/// Rule 5: `BinaryExpression(+, left, right)` where both operands are
/// string literals and either operand begins with `__`, ends with `__`, or
/// contains `__` within a fragment short enough to be a dunder name
/// fragment (CWE-749).
pub fn is_dynamic_dunder_construction(op: BinaryOp, left: &Expression, right: &Expression) -> bool {
    if op != BinaryOp::Add {
        return false;
    }
    let (Expression::StringLiteral { value: l, .. }, Expression::StringLiteral { value: r, .. }) =
        (left, right)
    else {
        return false;
    };
    is_dunder_fragment(l) || is_dunder_fragment(r)
}

fn is_dunder_fragment(s: &str) -> bool {
    s.starts_with("__") || s.ends_with("__") || (s.contains("__") && s.len() <= DUNDER_FRAGMENT_MAX_LEN)
}

/// Rule 6: for a security-sensitive call (`getattr`/`setattr`/`hasattr`/
/// `call`), the attribute-name argument must be a literal string not
/// beginning with `_`. Returns `Some(reason)` describing why the argument
/// is rejected, `None` if it's fine.
pub enum SensitiveArgViolation {
    NotALiteral,
    LeadingUnderscore,
}

pub fn check_sensitive_arg(expr: &Expression) -> Option<SensitiveArgViolation> {
    match expr {
        Expression::StringLiteral { value, .. } => {
            if value.starts_with('_') {
                Some(SensitiveArgViolation::LeadingUnderscore)
            } else {
                None
            }
        }
        _ => Some(SensitiveArgViolation::NotALiteral),
    }
}

/// The attribute-name argument index for a sensitive callee, or `None` if
/// it doesn't take fewer than that many arguments (the callee-name check
/// still decides whether the callee is sensitive at all).
pub fn sensitive_arg_index(callee: &str, arity: usize) -> Option<usize> {
    if SENSITIVE_CALLEES.contains(&callee) && arity > 1 {
        Some(1)
    } else {
        None
    }
}
