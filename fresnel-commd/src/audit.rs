// ABOUTME: writes append-only audit records for each command the daemon evaluates.
// ABOUTME: one json line per command with the caller's credentials and the outcome.

use std::path::PathBuf;

use anyhow::Context;
use fresnel_common::{CommandLine, ExitReport};
use tokio::io::AsyncWriteExt;

use crate::exec::{Evaluation, ExecError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuditRecord<'a> {
    pub ts_unix_ms: u64,
    pub peer: Option<PeerCredentials>,
    pub command: &'a str,
    pub stdout_lines: Option<usize>,
    pub exit: Option<ExitReport>,
    pub error: Option<String>,
}

impl<'a> AuditRecord<'a> {
    pub fn new(
        ts_unix_ms: u64,
        peer: Option<PeerCredentials>,
        command: &'a CommandLine,
        outcome: &Result<Evaluation, ExecError>,
    ) -> Self {
        let (stdout_lines, exit, error) = match outcome {
            Ok(evaluation) => (Some(evaluation.stdout_lines), Some(evaluation.report), None),
            Err(err) => (None, None, Some(err.to_string())),
        };
        Self {
            ts_unix_ms,
            peer,
            command: command.as_str(),
            stdout_lines,
            exit,
            error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append(&self, record: &AuditRecord<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open audit log at {}", self.path.display()))?;

        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        let peer = Some(PeerCredentials { pid: 42, uid: 1000, gid: 1000 });

        let ok_cmd = CommandLine::new("exit 3");
        let ok: Result<Evaluation, ExecError> = Ok(Evaluation {
            report: ExitReport::Exited { code: 3 },
            stdout_lines: 0,
        });
        log.append(&AuditRecord::new(1, peer, &ok_cmd, &ok)).await.unwrap();

        let failed_cmd = CommandLine::new("echo hi");
        let failed: Result<Evaluation, ExecError> = Err(ExecError::Spawn(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no shell",
        )));
        log.append(&AuditRecord::new(2, None, &failed_cmd, &failed)).await.unwrap();

        let text = tokio::fs::read_to_string(dir.path().join("audit.jsonl")).await.unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);

        assert_eq!(lines[0]["command"], "exit 3");
        assert_eq!(lines[0]["peer"]["pid"], 42);
        assert_eq!(lines[0]["exit"]["code"], 3);
        assert!(lines[0]["error"].is_null());

        assert_eq!(lines[1]["ts_unix_ms"], 2);
        assert!(lines[1]["peer"].is_null());
        assert!(lines[1]["exit"].is_null());
        assert!(lines[1]["error"].as_str().unwrap().contains("spawn failed"));
    }

    #[tokio::test]
    async fn open_failure_has_context() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("missing").join("audit.jsonl"));
        let cmd = CommandLine::new("true");
        let outcome: Result<Evaluation, ExecError> = Err(ExecError::TimedOut(std::time::Duration::from_secs(5)));
        let err = log.append(&AuditRecord::new(0, None, &cmd, &outcome)).await.unwrap_err();
        assert!(err.to_string().contains("open audit log"));
    }
}
