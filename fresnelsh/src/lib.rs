// ABOUTME: provides fresnelsh helpers for building and delivering command payloads to the daemon.
// ABOUTME: the client writes one payload per connection and never waits for a reply.

use std::path::Path;

use anyhow::Context;
use fresnel_common::{decode_message, MAX_MESSAGE_BYTES};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

/// Joins the command words with single spaces, refusing a blank result.
pub fn command_payload(words: &[String]) -> anyhow::Result<String> {
    let line = words.join(" ");
    if line.trim().is_empty() {
        return Err(anyhow::anyhow!("command must be non-empty"));
    }
    Ok(line)
}

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CheckVerdict {
    pub ok: bool,
    pub bytes: usize,
    pub truncated: bool,
    /// The command line the daemon would actually run.
    pub effective_command: Option<String>,
    pub error: Option<String>,
}

pub fn check_verdict(words: &[String]) -> CheckVerdict {
    match command_payload(words) {
        Ok(payload) => CheckVerdict {
            ok: true,
            bytes: payload.len(),
            truncated: payload.len() > MAX_MESSAGE_BYTES,
            effective_command: decode_message(payload.as_bytes()).map(|c| c.to_string()),
            error: None,
        },
        Err(err) => CheckVerdict {
            ok: false,
            bytes: 0,
            truncated: false,
            effective_command: None,
            error: Some(err.to_string()),
        },
    }
}

pub async fn send(socket_path: &Path, payload: &str) -> anyhow::Result<()> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connect {}", socket_path.display()))?;
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
