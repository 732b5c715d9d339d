// ABOUTME: executes one received command line through a shell with a bounded wait for exit.
// ABOUTME: streams stdout into the transcript line by line, then reports how the child terminated.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use fresnel_common::{CommandLine, ExitReport};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ExecError {
    Spawn(std::io::Error),
    Read(std::io::Error),
    Transcript(std::io::Error),
    Wait(std::io::Error),
    /// The child outlived the bounded wait and was killed.
    TimedOut(Duration),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Spawn(err) => write!(f, "spawn failed: {err}"),
            ExecError::Read(err) => write!(f, "reading child output failed: {err}"),
            ExecError::Transcript(err) => write!(f, "writing transcript failed: {err}"),
            ExecError::Wait(err) => write!(f, "wait failed: {err}"),
            ExecError::TimedOut(limit) => {
                write!(f, "child still running after {}ms, killed", limit.as_millis())
            }
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Spawn(err)
            | ExecError::Read(err)
            | ExecError::Transcript(err)
            | ExecError::Wait(err) => Some(err),
            ExecError::TimedOut(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub report: ExitReport,
    pub stdout_lines: usize,
}

/// Runs command lines through `<shell> -c`, one at a time.
#[derive(Debug, Clone)]
pub struct Executor {
    shell: String,
    wait_timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL, DEFAULT_WAIT_TIMEOUT)
    }
}

impl Executor {
    pub fn new(shell: impl Into<String>, wait_timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            wait_timeout,
        }
    }

    /// Echoes `$ <command>`, runs it, and writes each stdout line followed by
    /// the exit report to `transcript`.
    ///
    /// Output is drained to end-of-file before waiting on the child. Waiting
    /// first can deadlock once the child fills its pipe.
    pub async fn eval<W>(&self, command: &CommandLine, transcript: &mut W) -> Result<Evaluation, ExecError>
    where
        W: AsyncWrite + Unpin,
    {
        write_line(transcript, &format!("$ {command}")).await?;

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecError::Spawn)?;
        debug!(pid = child.id(), "spawned");

        // Anything the command line forks shares the shell's group, so an
        // abandoned evaluation takes the whole group down with it.
        let mut group = ProcessGroup::of(&child);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout_lines, stderr_lines) =
            tokio::join!(drain_stdout(stdout, transcript), drain_stderr(stderr));
        let stdout_lines = stdout_lines?;
        stderr_lines?;

        let status = match tokio::time::timeout(self.wait_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(ExecError::Wait(err)),
            Err(_) => {
                group.kill();
                if let Err(err) = child.wait().await {
                    warn!(error = %err, "failed to reap timed out child");
                }
                return Err(ExecError::TimedOut(self.wait_timeout));
            }
        };
        group.release();

        let report = ExitReport::from(status);
        write_line(transcript, &report.to_string()).await?;

        Ok(Evaluation { report, stdout_lines })
    }
}

/// The process group led by a spawned shell. Dropping it while still held
/// sends SIGKILL to every member.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<libc::pid_t>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid, error = %err, "failed to kill process group");
            }
        }
    }

    /// Stops tracking the group once the shell has exited on its own.
    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn drain_stdout<R, W>(stdout: Option<R>, transcript: &mut W) -> Result<usize, ExecError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(stdout) = stdout else {
        return Ok(0);
    };

    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut count = 0;
    while let Some(line) = next_line(&mut reader, &mut buf).await.map_err(ExecError::Read)? {
        write_line(transcript, &line).await?;
        count += 1;
    }
    Ok(count)
}

async fn drain_stderr<R>(stderr: Option<R>) -> Result<usize, ExecError>
where
    R: AsyncRead + Unpin,
{
    let Some(stderr) = stderr else {
        return Ok(0);
    };

    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut count = 0;
    while let Some(line) = next_line(&mut reader, &mut buf).await.map_err(ExecError::Read)? {
        warn!(stream = "stderr", "{line}");
        count += 1;
    }
    Ok(count)
}

/// Reads one line, stripping `\n` or `\r\n`. Invalid UTF-8 is replaced.
async fn next_line<R>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn write_line<W>(transcript: &mut W, line: &str) -> Result<(), ExecError>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    transcript.write_all(&bytes).await.map_err(ExecError::Transcript)?;
    transcript.flush().await.map_err(ExecError::Transcript)
}

/// True once `pid` has exited. An unreaped zombie counts as exited.
#[cfg(test)]
pub(crate) fn process_gone(pid: libc::pid_t) -> bool {
    if unsafe { libc::kill(pid, 0) } != 0 {
        return true;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map_or(false, |state| state == 'Z' || state == 'X'),
        Err(_) => true,
    }
}
