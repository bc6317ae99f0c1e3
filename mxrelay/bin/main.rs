#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mxrelay::{Relay, Submission};
use mxrelay_delivery::{DsnParameters, MessageBody, RelayStatus};
use mxrelay_smtp::{DsnNotify, DsnRet};

/// Relay mail to its destination over SMTP
#[derive(Parser, Debug)]
#[command(name = "mxrelay")]
#[command(about = "Relay mail to its destination over SMTP", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: `MXRELAY_CONFIG`, ./mxrelay.config.ron,
    /// /etc/mxrelay/mxrelay.config.ron)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Relay a message file to one or more recipients
    Send {
        /// Envelope sender
        #[arg(long)]
        from: String,

        /// Envelope recipient, may be repeated
        #[arg(long, required = true)]
        to: Vec<String>,

        /// The message, headers included
        message: PathBuf,

        /// Message id used in logs (default: generated)
        #[arg(long)]
        message_id: Option<String>,

        /// DSN envelope id
        #[arg(long)]
        envid: Option<String>,

        /// DSN return content (FULL or HDRS)
        #[arg(long)]
        ret: Option<DsnRet>,

        /// DSN notify conditions (NEVER, or a list of SUCCESS, FAILURE, DELAY)
        #[arg(long)]
        notify: Option<DsnNotify>,
    },
    /// Validate the configuration
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let relay = Relay::from_file(&config_path)?;

    match cli.command {
        Commands::Check => {
            println!("{} is valid", config_path.display());
            Ok(())
        }
        Commands::Send {
            from,
            to,
            message,
            message_id,
            envid,
            ret,
            notify,
        } => {
            if !message.is_file() {
                anyhow::bail!("Message file {} does not exist", message.display());
            }

            let submission = Submission {
                from,
                to,
                message_id: message_id.unwrap_or_else(|| ulid::Ulid::new().to_string()),
                body: MessageBody::File(message),
                dsn: DsnParameters {
                    ret,
                    envid,
                    notify,
                    orcpt: None,
                },
            };

            let outcomes = relay.send(submission).await?;

            for outcome in &outcomes {
                match &outcome.status {
                    RelayStatus::Relayed => println!("{}: relayed", outcome.recipient),
                    RelayStatus::Failed { reason, permanent } => println!(
                        "{}: {} failure: {reason}",
                        outcome.recipient,
                        if *permanent { "permanent" } else { "temporary" }
                    ),
                    RelayStatus::Pending | RelayStatus::InProgress => {
                        println!("{}: not attempted", outcome.recipient);
                    }
                }
            }

            let failed = outcomes.iter().filter(|o| !o.is_relayed()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} recipient(s) not relayed", outcomes.len());
            }

            Ok(())
        }
    }
}

/// Find the configuration file using the following precedence:
/// 1. `MXRELAY_CONFIG` environment variable
/// 2. ./mxrelay.config.ron (current working directory)
/// 3. /etc/mxrelay/mxrelay.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("MXRELAY_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "MXRELAY_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./mxrelay.config.ron"),
        PathBuf::from("/etc/mxrelay/mxrelay.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - MXRELAY_CONFIG environment variable\n{paths_tried}"
    )
}
