//! Top-down AST visitor for the security analyzer (spec §4.4 "Traversal",
//! "State machine per call site").

use std::collections::HashSet;

use crate::analyzer::issue::{Cwe, SecurityIssue, Severity};
use crate::analyzer::rules::{
    check_sensitive_arg, dangerous_string_literal, is_dynamic_dunder_construction,
    is_forbidden_call_name, is_forbidden_identifier, is_import_rejected, sensitive_arg_index,
    SensitiveArgViolation,
};
use crate::ast::{Expression, Program, Statement};

/// Context stack tracking the enclosing function and whether the
/// expression being visited is the attribute-name argument to a
/// security-sensitive callee (spec: "a context stack tracking the
/// enclosing function and whether an expression appears as an argument to
/// a security-sensitive callee").
pub struct Visitor<'a> {
    allowed_modules: &'a HashSet<String>,
    function_stack: Vec<String>,
    issues: Vec<SecurityIssue>,
}

impl<'a> Visitor<'a> {
    pub fn new(allowed_modules: &'a HashSet<String>) -> Self {
        Self {
            allowed_modules,
            function_stack: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn run(mut self, program: &Program) -> Vec<SecurityIssue> {
        for stmt in &program.statements {
            self.visit_statement(stmt);
        }
        self.issues.sort_by_key(|i| (i.position.line, i.position.column));
        self.issues
    }

    fn push(&mut self, issue: SecurityIssue) {
        self.issues.push(issue);
    }

    fn visit_statement(&mut self, stmt: &Statement) {
        match stmt {
            Statement::Expression(e) => self.visit_expression(e, false),
            Statement::Assignment { value, .. } => self.visit_expression(value, false),
            Statement::Return { value, .. } => {
                if let Some(v) = value {
                    self.visit_expression(v, false);
                }
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                self.visit_expression(condition, false);
                for s in then_branch {
                    self.visit_statement(s);
                }
                for s in else_branch {
                    self.visit_statement(s);
                }
            }
            Statement::While { condition, body, .. } => {
                self.visit_expression(condition, false);
                for s in body {
                    self.visit_statement(s);
                }
            }
            Statement::FunctionDef { name, body, .. } => {
                self.function_stack.push(name.clone());
                for s in body {
                    self.visit_statement(s);
                }
                self.function_stack.pop();
            }
            Statement::ImportStatement { path, position } => {
                if is_import_rejected(path, self.allowed_modules) {
                    self.push(
                        SecurityIssue::new(
                            Severity::Critical,
                            "import_allowlist",
                            format!("import of '{}' is not permitted", path),
                            *position,
                            Cwe(829),
                        )
                        .with_suggestion("remove the import or add the module to `allowed_modules`"),
                    );
                }
            }
            Statement::CapabilityDeclaration(_) => {}
            Statement::Block(stmts) => {
                for s in stmts {
                    self.visit_statement(s);
                }
            }
        }
    }

    fn visit_expression(&mut self, expr: &Expression, in_sensitive_arg: bool) {
        match expr {
            Expression::Identifier { name, position } => {
                if is_forbidden_identifier(name) {
                    self.push(SecurityIssue::new(
                        Severity::Critical,
                        "forbidden_identifier",
                        format!("identifier '{}' uses reflective dunder naming", name),
                        *position,
                        Cwe(749),
                    ));
                }
                if in_sensitive_arg {
                    self.reject_sensitive_arg(expr, *position);
                }
            }
            Expression::StringLiteral { value, position } => {
                if let Some(dunder_shaped) = dangerous_string_literal(value) {
                    let cwe = if dunder_shaped { Cwe(749) } else { Cwe(94) };
                    self.push(SecurityIssue::new(
                        Severity::Critical,
                        "dangerous_string_literal",
                        format!("string literal '{}' is not permitted", value),
                        *position,
                        cwe,
                    ));
                }
                if in_sensitive_arg {
                    self.reject_sensitive_arg(expr, *position);
                }
            }
            Expression::IntegerLiteral { .. } | Expression::BooleanLiteral { .. } => {
                if in_sensitive_arg {
                    self.reject_sensitive_arg(expr, expr.position());
                }
            }
            Expression::BinaryExpression {
                op,
                left,
                right,
                position,
            } => {
                if is_dynamic_dunder_construction(*op, left, right) {
                    self.push(SecurityIssue::new(
                        Severity::Critical,
                        "dynamic_dunder_construction",
                        "dunder-shaped name assembled via string concatenation",
                        *position,
                        Cwe(749),
                    ));
                }
                if in_sensitive_arg {
                    self.reject_sensitive_arg(expr, *position);
                }
                self.visit_expression(left, false);
                self.visit_expression(right, false);
            }
            Expression::MemberAccess { object, attr, position } => {
                if is_forbidden_identifier(attr) {
                    self.push(SecurityIssue::new(
                        Severity::Critical,
                        "forbidden_identifier",
                        format!("attribute access '.{}' uses reflective dunder naming", attr),
                        *position,
                        Cwe(749),
                    ));
                }
                self.visit_expression(object, false);
            }
            Expression::IndexAccess { object, index, .. } => {
                self.visit_expression(object, false);
                self.visit_expression(index, false);
            }
            Expression::FunctionCall { callee, args, position } => {
                if let Some(name) = expr.callee_identifier() {
                    if is_forbidden_call_name(name) {
                        self.push(SecurityIssue::new(
                            Severity::Critical,
                            "forbidden_call",
                            format!("call to '{}' is not permitted", name),
                            *position,
                            Cwe(94),
                        ));
                    }
                    let sensitive_index = sensitive_arg_index(name, args.len());
                    for (i, arg) in args.iter().enumerate() {
                        self.visit_expression(arg, Some(i) == sensitive_index);
                    }
                } else {
                    for arg in args {
                        self.visit_expression(arg, false);
                    }
                }
                self.visit_expression(callee, false);
            }
        }
    }

    /// Rule 6: reject whatever the security-sensitive attribute argument
    /// turned out to be, unless it already passed as a safe literal.
    fn reject_sensitive_arg(&mut self, expr: &Expression, position: crate::ast::Position) {
        if let Some(violation) = check_sensitive_arg(expr) {
            let message = match violation {
                SensitiveArgViolation::NotALiteral => {
                    "attribute-name argument to a dynamic-dispatch primitive must be a literal string"
                        .to_string()
                }
                SensitiveArgViolation::LeadingUnderscore => {
                    "attribute-name argument must not begin with '_'".to_string()
                }
            };
            self.push(SecurityIssue::new(
                Severity::Critical,
                "sensitive_call_argument",
                message,
                position,
                Cwe(470),
            ));
        }
    }
}
