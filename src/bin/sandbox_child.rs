//! Reference sandbox-child harness (spec §4.6 point 4).
//!
//! Feature-gated (`sandbox-child-bin`), not part of the default build: the
//! real code generator and target host runtime are external collaborators
//! (spec §1), so this binary stands in for "the child reconstructs a
//! capability manager seeded with the snapshot tokens in a fresh root
//! context, then loads generated code and runs it" using the minimal
//! arithmetic/string expression language described in
//! [`mlsec_core::sandbox::ChildProgram`].
//!
//! Protocol: reads one framed [`IpcMessage::CodeAndContext`] from stdin,
//! writes one framed [`IpcMessage::ResultOk`]/[`IpcMessage::ResultErr`] to
//! stdout. Applies its own rlimits before evaluating, mirroring "child
//! applies OS-level limits before loading any user code" for the case
//! where this binary is exec'd directly as the sandboxed interpreter
//! rather than launched underneath an already-limited parent.

use std::io::{self, Write};

use mlsec_core::capabilities::{CapabilityManager, CapabilityToken};
use mlsec_core::sandbox::{ChildProgram, IpcMessage};

fn main() {
    #[cfg(unix)]
    {
        // Best-effort: if stdin carries no context yet (e.g. launched for
        // a smoke test), there's nothing to size limits against but the
        // process' own default settings, applied the same way the parent
        // would before a `Program::Script` exec.
        let defaults = mlsec_core::config::SandboxSettings::default();
        if let Err(e) = mlsec_core::sandbox::apply_unix_limits(&defaults) {
            eprintln!("sandbox-child: failed to apply default limits: {}", e);
        }
    }

    let mut stdin = io::stdin().lock();
    let message = match mlsec_core::sandbox::read_message(&mut stdin) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("sandbox-child: failed to read IPC message: {}", e);
            std::process::exit(1);
        }
    };

    let payload = match message {
        IpcMessage::CodeAndContext(p) => p,
        other => {
            eprintln!("sandbox-child: expected CodeAndContext, got {:?}", other);
            std::process::exit(1);
        }
    };

    let manager = CapabilityManager::new();
    let root = manager.root();
    for snapshot in payload.context.tokens {
        match CapabilityToken::from_snapshot(snapshot) {
            Ok(token) => root.grant(std::sync::Arc::new(token)),
            Err(e) => eprintln!("sandbox-child: dropping malformed token snapshot: {}", e),
        }
    }

    let result = match &payload.program {
        ChildProgram::Expression(source) => evaluate_expression(source),
    };

    let mut stdout = io::stdout().lock();
    let outcome = match result {
        Ok(value) => IpcMessage::ResultOk(mlsec_core::sandbox::ResultOkPayload { value }),
        Err(message) => IpcMessage::ResultErr(mlsec_core::sandbox::ResultErrPayload {
            kind: "EvaluationError".to_string(),
            message,
        }),
    };
    if let Err(e) = mlsec_core::sandbox::write_message(&mut stdout, &outcome) {
        eprintln!("sandbox-child: failed to write IPC result: {}", e);
        std::process::exit(1);
    }
    let _ = stdout.flush();
}

/// A tiny `<left> + <right>` expression language: both operands are either
/// integer literals or double-quoted string literals. Exactly enough to
/// exercise the IPC round trip end to end (spec §4.6 points 4-5) without
/// embedding a real target-language interpreter, which is out of scope
/// (spec §1).
fn evaluate_expression(source: &str) -> Result<serde_json::Value, String> {
    let parts: Vec<&str> = source.splitn(2, '+').collect();
    let (left_src, right_src) = match parts.as_slice() {
        [l, r] => (l.trim(), r.trim()),
        [single] => return parse_operand(single.trim()),
        _ => return Err(format!("cannot parse expression '{}'", source)),
    };
    let left = parse_operand(left_src)?;
    let right = parse_operand(right_src)?;
    match (left, right) {
        (serde_json::Value::Number(a), serde_json::Value::Number(b)) => {
            let sum = a.as_i64().ok_or("non-integer operand")?
                + b.as_i64().ok_or("non-integer operand")?;
            Ok(serde_json::Value::Number(sum.into()))
        }
        (serde_json::Value::String(a), serde_json::Value::String(b)) => {
            Ok(serde_json::Value::String(a + &b))
        }
        _ => Err("operands must both be integers or both be strings".to_string()),
    }
}

fn parse_operand(src: &str) -> Result<serde_json::Value, String> {
    if let Some(inner) = src.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Ok(serde_json::Value::String(inner.to_string()))
    } else {
        src.parse::<i64>()
            .map(|n| serde_json::Value::Number(n.into()))
            .map_err(|_| format!("cannot parse operand '{}'", src))
    }
}
