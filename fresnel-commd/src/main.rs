// ABOUTME: runs the daemon that executes shell command lines received on a local unix socket.
// ABOUTME: command output and exit status go to stdout; diagnostics are logged to stderr.

mod audit;
mod exec;
mod server;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use server::ServerConfig;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value = fresnel_common::DEFAULT_SOCKET_PATH)]
    socket_path: PathBuf,

    /// Interpreter invoked as `<shell> -c <command>`.
    #[arg(long, default_value = exec::DEFAULT_SHELL)]
    shell: String,

    #[arg(long, default_value_t = exec::DEFAULT_WAIT_TIMEOUT.as_secs())]
    wait_timeout_secs: u64,

    #[arg(long, default_value_t = server::DEFAULT_READ_TIMEOUT.as_millis() as u64)]
    read_timeout_ms: u64,

    #[arg(long)]
    audit_path: Option<PathBuf>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            socket_path: args.socket_path,
            shell: args.shell,
            wait_timeout: Duration::from_secs(args.wait_timeout_secs),
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            audit_path: args.audit_path,
        }
    }
}

const DEFAULT_LOG_FILTER: &str = "info";

/// Builds the log filter from `RUST_LOG`, falling back to `info` when it is
/// unset or does not parse.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref()))
        .init();

    let args = Args::parse();

    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    };

    server::run(args.into(), tokio::io::stdout(), shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{Layer, Registry};

    fn max_level(filter: &EnvFilter) -> Option<LevelFilter> {
        <EnvFilter as Layer<Registry>>::max_level_hint(filter)
    }

    #[test]
    fn log_filter_defaults_to_info() {
        assert_eq!(max_level(&log_filter(None)), Some(LevelFilter::INFO));
    }

    #[test]
    fn log_filter_follows_rust_log_level() {
        assert_eq!(max_level(&log_filter(Some("debug"))), Some(LevelFilter::DEBUG));
        assert_eq!(max_level(&log_filter(Some("warn"))), Some(LevelFilter::WARN));
    }

    #[test]
    fn log_filter_falls_back_on_bad_directives() {
        assert_eq!(max_level(&log_filter(Some("fresnel=notalevel"))), Some(LevelFilter::INFO));
    }
}
