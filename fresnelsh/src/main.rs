// ABOUTME: provides a user-facing cli for sending shell command lines to the fresnel-commd daemon.
// ABOUTME: output of the command appears in the daemon's transcript, not here.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fresnel_common::MAX_MESSAGE_BYTES;

use fresnelsh::{check_verdict, command_payload, send};

#[derive(Debug, Parser)]
#[command(name = "fresnelsh")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deliver a command line to the daemon.
    Send {
        #[arg(long, default_value = fresnel_common::DEFAULT_SOCKET_PATH)]
        socket_path: PathBuf,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },
    /// Show what the daemon would run for these words, without connecting.
    Check {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Send { socket_path, words } => {
            let payload = command_payload(&words)?;
            if payload.len() > MAX_MESSAGE_BYTES {
                eprintln!(
                    "warning: command is {} bytes; the daemon will only run the first {MAX_MESSAGE_BYTES}",
                    payload.len()
                );
            }
            send(&socket_path, &payload).await?;
        }
        Command::Check { words } => {
            let verdict = check_verdict(&words);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
    }

    Ok(())
}
