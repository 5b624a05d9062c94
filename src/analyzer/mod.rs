//! Security Analyzer (C5) — spec §4.4, the hardest piece.
//!
//! A static-analysis pass over the parsed AST producing [`SecurityIssue`]s.
//! Analysis never fails outright: issues accumulate, and the *driver*
//! (`SecurityAnalyzer::analyze`) decides whether the program is rejected
//! from the accumulated severities (spec "Failure semantics").

pub mod issue;
pub mod rules;
pub mod visitor;

pub use issue::{Cwe, SecurityIssue, Severity};

use std::collections::HashSet;

use tracing::warn;

use crate::ast::Program;
use crate::config::Config;
use visitor::Visitor;

/// Outcome of running the analyzer over a [`Program`].
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub issues: Vec<SecurityIssue>,
    pub fatal_count: usize,
}

impl AnalysisReport {
    pub fn rejected(&self) -> bool {
        self.fatal_count > 0
    }

    /// Bridge to the crate-wide error taxonomy for callers (the CLI/codegen
    /// driver, spec §1 "out of scope") that want a single `CoreResult` rather
    /// than inspecting `rejected()`/`issues` themselves (spec §4.4 "The
    /// driver rejects the program iff any issue has severity >= high").
    pub fn into_result(self) -> crate::error::CoreResult<Vec<SecurityIssue>> {
        if self.rejected() {
            Err(crate::error::CoreError::ProgramRejected {
                fatal_count: self.fatal_count,
                issues: self.issues,
            })
        } else {
            Ok(self.issues)
        }
    }
}

/// Stateless driver: holds only the configuration needed to parameterize
/// the rules (the import allowlist, and whether `medium` severity is also
/// fatal). Constructing one is cheap; it's fine to build a fresh analyzer
/// per compilation unit (spec §5: "single-threaded per compilation unit but
/// may run in parallel across units").
#[derive(Debug, Clone)]
pub struct SecurityAnalyzer {
    allowed_modules: HashSet<String>,
    treat_medium_as_fatal: bool,
}

impl SecurityAnalyzer {
    pub fn new(allowed_modules: HashSet<String>, treat_medium_as_fatal: bool) -> Self {
        Self {
            allowed_modules,
            treat_medium_as_fatal,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.allowed_modules.clone(), config.analyzer.treat_medium_as_fatal)
    }

    /// Idempotent and order-stable (spec §8): running twice on the same
    /// `Program` value yields the same `issues` in the same order, since
    /// the visitor is a pure top-down traversal with no shared state
    /// across runs.
    pub fn analyze(&self, program: &Program) -> AnalysisReport {
        let issues = Visitor::new(&self.allowed_modules).run(program);
        let fatal_count = issues
            .iter()
            .filter(|i| {
                i.severity.is_fatal_by_default()
                    || (self.treat_medium_as_fatal && i.severity == Severity::Medium)
            })
            .count();
        if fatal_count > 0 {
            warn!(fatal_count, total = issues.len(), "program rejected by security analyzer");
        }
        AnalysisReport { issues, fatal_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Expression, Position, Statement};

    fn analyzer() -> SecurityAnalyzer {
        let allowed: HashSet<String> = ["math".to_string()].into_iter().collect();
        SecurityAnalyzer::new(allowed, false)
    }

    fn pos(line: u32) -> Position {
        Position::new(line, 1)
    }

    #[test]
    fn direct_dunder_access_is_rejected() {
        let program = Program::new(vec![Statement::Assignment {
            target: "x".into(),
            value: Expression::MemberAccess {
                object: Box::new(Expression::Identifier {
                    name: "obj".into(),
                    position: pos(1),
                }),
                attr: "__class__".into(),
                position: pos(1),
            },
            position: pos(1),
        }]);
        let report = analyzer().analyze(&program);
        assert!(report.rejected());
        assert!(report
            .issues
            .iter()
            .any(|i| i.severity == Severity::Critical && i.cwe.0 == 749));
    }

    #[test]
    fn dunder_via_literal_getattr_is_rejected() {
        let call = Expression::FunctionCall {
            callee: Box::new(Expression::Identifier {
                name: "getattr".into(),
                position: pos(1),
            }),
            args: vec![
                Expression::Identifier {
                    name: "obj".into(),
                    position: pos(1),
                },
                Expression::StringLiteral {
                    value: "__class__".into(),
                    position: pos(1),
                },
            ],
            position: pos(1),
        };
        let program = Program::new(vec![Statement::Expression(call)]);
        let report = analyzer().analyze(&program);
        assert!(report.rejected());
    }

    #[test]
    fn dunder_via_concat_getattr_is_rejected() {
        let call = Expression::FunctionCall {
            callee: Box::new(Expression::Identifier {
                name: "getattr".into(),
                position: pos(1),
            }),
            args: vec![
                Expression::Identifier {
                    name: "obj".into(),
                    position: pos(1),
                },
                Expression::BinaryExpression {
                    op: BinaryOp::Add,
                    left: Box::new(Expression::StringLiteral {
                        value: "__".into(),
                        position: pos(1),
                    }),
                    right: Box::new(Expression::StringLiteral {
                        value: "class__".into(),
                        position: pos(1),
                    }),
                    position: pos(1),
                },
            ],
            position: pos(1),
        };
        let program = Program::new(vec![Statement::Expression(call)]);
        let report = analyzer().analyze(&program);
        assert!(report.rejected());
    }

    #[test]
    fn nested_getattr_chain_flags_both_levels() {
        let inner = Expression::FunctionCall {
            callee: Box::new(Expression::Identifier {
                name: "getattr".into(),
                position: pos(1),
            }),
            args: vec![
                Expression::Identifier {
                    name: "o".into(),
                    position: pos(1),
                },
                Expression::StringLiteral {
                    value: "__x__".into(),
                    position: pos(1),
                },
            ],
            position: pos(1),
        };
        let outer = Expression::FunctionCall {
            callee: Box::new(Expression::Identifier {
                name: "getattr".into(),
                position: pos(2),
            }),
            args: vec![
                inner,
                Expression::StringLiteral {
                    value: "__y__".into(),
                    position: pos(2),
                },
            ],
            position: pos(2),
        };
        let program = Program::new(vec![Statement::Expression(outer)]);
        let report = analyzer().analyze(&program);
        let at_line_1 = report.issues.iter().filter(|i| i.position.line == 1).count();
        let at_line_2 = report.issues.iter().filter(|i| i.position.line == 2).count();
        assert!(at_line_1 > 0);
        assert!(at_line_2 > 0);
    }

    #[test]
    fn forbidden_eval_call_is_rejected() {
        let call = Expression::FunctionCall {
            callee: Box::new(Expression::Identifier {
                name: "eval".into(),
                position: pos(1),
            }),
            args: vec![Expression::StringLiteral {
                value: "1 + 1".into(),
                position: pos(1),
            }],
            position: pos(1),
        };
        let program = Program::new(vec![Statement::Expression(call)]);
        let report = analyzer().analyze(&program);
        assert!(report.rejected());
    }

    #[test]
    fn disallowed_import_is_rejected() {
        let program = Program::new(vec![Statement::ImportStatement {
            path: "os".into(),
            position: pos(1),
        }]);
        let report = analyzer().analyze(&program);
        assert!(report.rejected());
    }

    #[test]
    fn allowed_import_passes() {
        let program = Program::new(vec![Statement::ImportStatement {
            path: "math".into(),
            position: pos(1),
        }]);
        let report = analyzer().analyze(&program);
        assert!(!report.rejected());
    }

    #[test]
    fn benign_program_is_not_rejected() {
        let program = Program::new(vec![Statement::Assignment {
            target: "x".into(),
            value: Expression::BinaryExpression {
                op: BinaryOp::Add,
                left: Box::new(Expression::IntegerLiteral {
                    value: 1,
                    position: pos(1),
                }),
                right: Box::new(Expression::IntegerLiteral {
                    value: 2,
                    position: pos(1),
                }),
                position: pos(1),
            },
            position: pos(1),
        }]);
        let report = analyzer().analyze(&program);
        assert!(!report.rejected());
        assert!(report.issues.is_empty());
    }

    #[test]
    fn into_result_carries_the_issues_on_rejection() {
        let program = Program::new(vec![Statement::ImportStatement {
            path: "os".into(),
            position: pos(1),
        }]);
        let report = analyzer().analyze(&program);
        let err = report.into_result().unwrap_err();
        match err {
            crate::error::CoreError::ProgramRejected { fatal_count, issues } => {
                assert_eq!(fatal_count, 1);
                assert_eq!(issues.len(), 1);
            }
            other => panic!("expected ProgramRejected, got {:?}", other),
        }
    }

    #[test]
    fn into_result_is_ok_for_a_benign_program() {
        let program = Program::new(vec![Statement::ImportStatement {
            path: "math".into(),
            position: pos(1),
        }]);
        let report = analyzer().analyze(&program);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn analysis_is_idempotent_and_order_stable() {
        let program = Program::new(vec![
            Statement::ImportStatement {
                path: "os".into(),
                position: pos(1),
            },
            Statement::Assignment {
                target: "x".into(),
                value: Expression::Identifier {
                    name: "__dunder__".into(),
                    position: pos(2),
                },
                position: pos(2),
            },
        ]);
        let a = analyzer().analyze(&program);
        let b = analyzer().analyze(&program);
        assert_eq!(a.issues.len(), b.issues.len());
        for (x, y) in a.issues.iter().zip(b.issues.iter()) {
            assert_eq!(x.rule, y.rule);
            assert_eq!(x.position, y.position);
        }
    }
}
