//! mlsec-core: security analyzer, capability system, and sandbox executor
//! for the ML scripting language.
//!
//! Three tightly-coupled subsystems (spec §1):
//!
//! - [`analyzer`] (C5) — static AST analysis that rejects dangerous source
//!   patterns before any code generation happens.
//! - [`capabilities`] (C1-C4) — the token/context/manager/registry layer
//!   enforced at run time.
//! - [`sandbox`] (C7) plus [`gate`] (C6) — the subprocess isolator and the
//!   single chokepoint generated code uses for every dynamic call and
//!   attribute access.
//!
//! The lexer/parser, code generator, and CLI are external collaborators
//! (spec §1) — this crate only fixes the [`ast`] contract they produce and
//! consume.

pub mod analyzer;
pub mod ast;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod gate;
pub mod sandbox;

pub use analyzer::{AnalysisReport, SecurityAnalyzer, SecurityIssue, Severity};
pub use capabilities::{
    CapabilityContext, CapabilityManager, CapabilityToken, Restriction, SafeAttributeRegistry,
};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use gate::SafeCallGate;
pub use sandbox::{ExecOutcome, ExecStatus, Program, SandboxExecutor};
