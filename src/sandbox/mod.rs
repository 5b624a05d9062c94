//! Sandbox Executor (C7) — spec §4.6.
//!
//! Owns the boundary between analyzed/gate-checked code and the outside
//! world: either a real OS-isolated subprocess (`executor::Program::Script`)
//! or an in-process, gate-mediated program (`executor::Program::Native`).

pub mod executor;
pub mod ipc;
#[cfg(unix)]
pub mod limits;

pub use executor::{ExecOutcome, ExecStatus, GeneratedProgram, Program, SandboxExecutor};
pub use ipc::{
    read_message, write_message, ChildProgram, CodeAndContextPayload, ContextSnapshot, IpcMessage,
    MessageKind, ResultErrPayload, ResultOkPayload, ViolationPayload, IPC_VERSION,
};
#[cfg(unix)]
pub use limits::apply_unix_limits;
