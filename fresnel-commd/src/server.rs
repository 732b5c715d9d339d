// ABOUTME: owns the daemon's unix socket and runs the sequential accept loop.
// ABOUTME: reads one command per connection and hands it to the executor before accepting again.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use fresnel_common::{decode_message, CommandLine, DEFAULT_SOCKET_PATH, MAX_MESSAGE_BYTES};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::audit::{AuditLog, AuditRecord, PeerCredentials};
use crate::exec::{self, Executor};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub shell: String,
    pub wait_timeout: Duration,
    pub read_timeout: Duration,
    pub audit_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            shell: exec::DEFAULT_SHELL.to_string(),
            wait_timeout: exec::DEFAULT_WAIT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            audit_path: None,
        }
    }
}

/// The listening socket together with the filesystem entry backing it.
///
/// The entry is removed by [`BoundSocket::close`], or on drop if the socket
/// is abandoned on an error or unwind path.
#[derive(Debug)]
pub struct BoundSocket {
    listener: UnixListener,
    path: Option<PathBuf>,
}

impl BoundSocket {
    pub fn bind(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        remove_stale_socket(&path).with_context(|| format!("remove existing socket at {}", path.display()))?;

        let listener = UnixListener::bind(&path).with_context(|| format!("bind {}", path.display()))?;
        Ok(Self {
            listener,
            path: Some(path),
        })
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn close(mut self) -> std::io::Result<()> {
        match self.path.take() {
            Some(path) => remove_stale_socket(&path),
            None => Ok(()),
        }
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match remove_stale_socket(&path) {
                Ok(()) => debug!(path = %path.display(), "removed socket file"),
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove socket file"),
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    Read(std::io::Error),
    IdleTimeout(Duration),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Read(err) => write!(f, "read failed: {err}"),
            ConnectionError::IdleTimeout(limit) => {
                write!(f, "no data within {}ms", limit.as_millis())
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Performs the single read a connection gets.
pub async fn read_message<R>(stream: &mut R, read_timeout: Duration) -> Result<Option<CommandLine>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_MESSAGE_BYTES];
    let n = match tokio::time::timeout(read_timeout, stream.read(&mut buf)).await {
        Ok(res) => res.map_err(ConnectionError::Read)?,
        Err(_) => return Err(ConnectionError::IdleTimeout(read_timeout)),
    };
    Ok(decode_message(&buf[..n]))
}

pub struct Server {
    executor: Executor,
    audit: Option<AuditLog>,
    read_timeout: Duration,
}

impl Server {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            executor: Executor::new(config.shell.clone(), config.wait_timeout),
            audit: config.audit_path.as_ref().map(AuditLog::new),
            read_timeout: config.read_timeout,
        }
    }

    /// Accepts and handles connections one at a time. Never returns; every
    /// failure past bind is logged and the loop moves on.
    pub async fn serve<W>(&self, socket: &BoundSocket, transcript: &mut W)
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let stream = accept_with_backoff(|| socket.accept(), ACCEPT_BACKOFF).await;

            let peer = match peer_credentials(&stream) {
                Ok(peer) => Some(peer),
                Err(err) => {
                    warn!(error = %err, "peer credentials unavailable");
                    None
                }
            };
            let span = info_span!(
                "connection",
                pid = peer.map(|p| p.pid),
                uid = peer.map(|p| p.uid)
            );
            self.handle_connection(stream, peer, transcript).instrument(span).await;
        }
    }

    async fn handle_connection<W>(&self, mut stream: UnixStream, peer: Option<PeerCredentials>, transcript: &mut W)
    where
        W: AsyncWrite + Unpin,
    {
        let command = match read_message(&mut stream, self.read_timeout).await {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!("connection closed without a command");
                return;
            }
            Err(err) => {
                warn!(error = %err, "dropping connection");
                return;
            }
        };
        drop(stream);

        info!(command = %command, "executing");
        let outcome = self.executor.eval(&command, transcript).await;
        match &outcome {
            Ok(evaluation) => info!(status = %evaluation.report, lines = evaluation.stdout_lines, "command finished"),
            Err(err) => error!(error = %err, "command failed"),
        }

        if let Some(audit) = &self.audit {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            let record = AuditRecord::new(now_ms, peer, &command, &outcome);
            if let Err(err) = audit.append(&record).await {
                warn!(error = %err, "audit write failed");
            }
        }
    }
}

/// Retries `accept` until it yields a connection. Failures such as EMFILE
/// tend to persist, so each one is followed by a pause of `backoff`.
async fn accept_with_backoff<T, F, Fut>(mut accept: F, backoff: Duration) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(err) => {
                warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "accept failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Binds the socket, serves until `shutdown` resolves, then removes the
/// socket file.
pub async fn run<W, F>(config: ServerConfig, mut transcript: W, shutdown: F) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let socket = BoundSocket::bind(&config.socket_path)?;
    info!(path = %config.socket_path.display(), "listening");

    let server = Server::new(&config);
    tokio::select! {
        _ = server.serve(&socket, &mut transcript) => {}
        _ = shutdown => info!("shutting down"),
    }

    socket
        .close()
        .with_context(|| format!("remove socket at {}", config.socket_path.display()))
}

#[cfg(target_os = "linux")]
fn peer_credentials(stream: &UnixStream) -> std::io::Result<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let expected = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let mut len = expected;
    // SAFETY: `cred` and `len` outlive the call and `len` is the size of `cred`.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if len != expected {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("SO_PEERCRED returned {len} bytes, expected {expected}"),
        ));
    }

    Ok(PeerCredentials {
        pid: cred.pid,
        uid: cred.uid,
        gid: cred.gid,
    })
}

#[cfg(not(target_os = "linux"))]
fn peer_credentials(_stream: &UnixStream) -> std::io::Result<PeerCredentials> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "peer credentials need SO_PEERCRED",
    ))
}
