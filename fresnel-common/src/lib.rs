// ABOUTME: defines the wire constants and shared types used by fresnelsh and fresnel-commd.
// ABOUTME: decodes raw socket payloads into the opaque command lines the daemon executes.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SOCKET_PATH: &str = ".fresnel.sock";

/// Upper bound for a single payload. The daemon performs exactly one read of
/// this size per connection, so anything past it is dropped.
pub const MAX_MESSAGE_BYTES: usize = 1024;

/// A shell command line exactly as received over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandLine(String);

impl CommandLine {
    pub fn new(line: impl Into<String>) -> Self {
        Self(line.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decodes the bytes of one read into a command line.
///
/// An empty read is an orderly close with nothing sent and yields `None`.
/// Input longer than [`MAX_MESSAGE_BYTES`] is truncated, and invalid UTF-8 is
/// replaced rather than rejected so a character split at the boundary does not
/// discard the whole message.
pub fn decode_message(bytes: &[u8]) -> Option<CommandLine> {
    if bytes.is_empty() {
        return None;
    }
    let bytes = &bytes[..bytes.len().min(MAX_MESSAGE_BYTES)];
    Some(CommandLine(String::from_utf8_lossy(bytes).into_owned()))
}

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitReport {
    Exited { code: i32 },
    Signaled { signal: i32 },
}

impl ExitReport {
    pub fn success(&self) -> bool {
        matches!(self, ExitReport::Exited { code: 0 })
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitReport::Exited { code },
            None => ExitReport::Signaled {
                signal: status.signal().unwrap_or_default(),
            },
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReport::Exited { code } => write!(f, "{code}"),
            ExitReport::Signaled { signal } => write!(f, "signal {signal}"),
        }
    }
}
