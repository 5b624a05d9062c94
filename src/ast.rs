//! AST contract consumed by the security analyzer.
//!
//! The lexer/parser is an external collaborator (see spec §1); this module
//! only fixes the shape of the tree the analyzer walks. Every node carries a
//! [`Position`] so issues can be reported precisely, and the whole tree is
//! `serde`-(de)serializable so fixtures can live as JSON/TOML and so a parsed
//! program can be content-hashed for the optional analyzer-issue cache.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    Gt,
    And,
    Or,
}

/// A `capability <Name> { resource "<pattern>"; allow <op>; ... }` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    pub name: String,
    pub resources: Vec<String>,
    pub allowed_ops: Vec<String>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Identifier {
        name: String,
        position: Position,
    },
    StringLiteral {
        value: String,
        position: Position,
    },
    IntegerLiteral {
        value: i64,
        position: Position,
    },
    BooleanLiteral {
        value: bool,
        position: Position,
    },
    BinaryExpression {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
        position: Position,
    },
    MemberAccess {
        object: Box<Expression>,
        attr: String,
        position: Position,
    },
    IndexAccess {
        object: Box<Expression>,
        index: Box<Expression>,
        position: Position,
    },
    FunctionCall {
        callee: Box<Expression>,
        args: Vec<Expression>,
        position: Position,
    },
}

impl Expression {
    pub fn position(&self) -> Position {
        match self {
            Expression::Identifier { position, .. }
            | Expression::StringLiteral { position, .. }
            | Expression::IntegerLiteral { position, .. }
            | Expression::BooleanLiteral { position, .. }
            | Expression::BinaryExpression { position, .. }
            | Expression::MemberAccess { position, .. }
            | Expression::IndexAccess { position, .. }
            | Expression::FunctionCall { position, .. } => *position,
        }
    }

    /// Name of the callee identifier, if this call's callee is a bare
    /// identifier (as opposed to a computed/member expression).
    pub fn callee_identifier(&self) -> Option<&str> {
        match self {
            Expression::FunctionCall { callee, .. } => match callee.as_ref() {
                Expression::Identifier { name, .. } => Some(name.as_str()),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Expression(Expression),
    Assignment {
        target: String,
        value: Expression,
        position: Position,
    },
    Return {
        value: Option<Expression>,
        position: Position,
    },
    If {
        condition: Expression,
        then_branch: Vec<Statement>,
        else_branch: Vec<Statement>,
        position: Position,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
        position: Position,
    },
    FunctionDef {
        name: String,
        params: Vec<Param>,
        body: Vec<Statement>,
        position: Position,
    },
    ImportStatement {
        path: String,
        position: Position,
    },
    CapabilityDeclaration(CapabilityDeclaration),
    Block(Vec<Statement>),
}

impl Statement {
    pub fn position(&self) -> Position {
        match self {
            Statement::Expression(e) => e.position(),
            Statement::Assignment { position, .. }
            | Statement::Return { position, .. }
            | Statement::If { position, .. }
            | Statement::While { position, .. }
            | Statement::FunctionDef { position, .. }
            | Statement::ImportStatement { position, .. } => *position,
            Statement::CapabilityDeclaration(d) => d.position,
            Statement::Block(stmts) => stmts.first().map(Statement::position).unwrap_or_default(),
        }
    }
}

/// A parsed compilation unit: an ordered sequence of top-level statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Program {
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }

    /// Stable content hash, used to key the optional analyzer-issue cache
    /// (spec §6 "Persisted state").
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_order_sensitive() {
        let a = Program::new(vec![Statement::ImportStatement {
            path: "math".into(),
            position: Position::new(1, 1),
        }]);
        let b = Program::new(vec![Statement::ImportStatement {
            path: "math".into(),
            position: Position::new(1, 1),
        }]);
        assert_eq!(a.content_hash(), b.content_hash());

        let c = Program::new(vec![Statement::ImportStatement {
            path: "os".into(),
            position: Position::new(1, 1),
        }]);
        assert_ne!(a.content_hash(), c.content_hash());
    }
}
