//! Sandbox IPC wire format (spec §6 "Sandbox IPC format").
//!
//! Framed messages over a pipe: `[u32 length][u8 kind][payload]`. The
//! payload is a versioned, `bincode`-encoded form of one of the
//! [`IpcMessage`] variants — "no host-specific serialization of live
//! objects" (spec §6), just plain data.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::capabilities::TokenSnapshot;
use crate::config::SandboxSettings;

/// Wire-format version. Bump when [`IpcMessage`]'s payload shapes change.
pub const IPC_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    CodeAndContext = 1,
    ResultOk = 2,
    ResultErr = 3,
    Violation = 4,
    Terminate = 5,
}

impl MessageKind {
    fn from_u8(b: u8) -> io::Result<Self> {
        match b {
            1 => Ok(MessageKind::CodeAndContext),
            2 => Ok(MessageKind::ResultOk),
            3 => Ok(MessageKind::ResultErr),
            4 => Ok(MessageKind::Violation),
            5 => Ok(MessageKind::Terminate),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown IPC message kind byte {}", other),
            )),
        }
    }
}

/// The minimal "generated code" the reference sandbox child binary knows
/// how to run (spec §1: the real code generator/target runtime are out of
/// scope; this stands in for them in the reference harness).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChildProgram {
    /// A tiny arithmetic/string expression, e.g. `"1 + 2"` or
    /// `"\"a\" + \"b\""`.
    Expression(String),
}

/// A frozen view of one capability context's reachable tokens, handed
/// across the process boundary (spec §4.6 point 2: "a frozen snapshot of
/// the capability context (tokens reduced to their public fields; secrets
/// never cross)").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextSnapshot {
    pub tokens: Vec<TokenSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAndContextPayload {
    pub version: u8,
    pub program: ChildProgram,
    pub context: ContextSnapshot,
    pub limits: SandboxSettings,
    pub entropy_seed: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultOkPayload {
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultErrPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationPayload {
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcMessage {
    CodeAndContext(CodeAndContextPayload),
    ResultOk(ResultOkPayload),
    ResultErr(ResultErrPayload),
    Violation(ViolationPayload),
    Terminate,
}

impl IpcMessage {
    fn kind(&self) -> MessageKind {
        match self {
            IpcMessage::CodeAndContext(_) => MessageKind::CodeAndContext,
            IpcMessage::ResultOk(_) => MessageKind::ResultOk,
            IpcMessage::ResultErr(_) => MessageKind::ResultErr,
            IpcMessage::Violation(_) => MessageKind::Violation,
            IpcMessage::Terminate => MessageKind::Terminate,
        }
    }
}

pub fn write_message<W: Write>(writer: &mut W, message: &IpcMessage) -> io::Result<()> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&[message.kind() as u8])?;
    writer.write_all(&payload)?;
    writer.flush()
}

pub fn read_message<R: Read>(reader: &mut R) -> io::Result<IpcMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut kind_buf = [0u8; 1];
    reader.read_exact(&mut kind_buf)?;
    let _kind = MessageKind::from_u8(kind_buf[0])?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    bincode::deserialize(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
