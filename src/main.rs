use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerchat")]
#[command(version, about = "Peer-to-peer chat and file transfer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a peer to connect using your ticket
    Listen {
        /// Where received files are saved (defaults to $PEERCHAT_DOWNLOAD_DIR, then the current directory)
        #[arg(short, long)]
        download_dir: Option<PathBuf>,
    },

    /// Connect to a peer
    Connect {
        /// The peer's ticket (interactive if not provided)
        ticket: Option<String>,

        /// Where received files are saved (defaults to $PEERCHAT_DOWNLOAD_DIR, then the current directory)
        #[arg(short, long)]
        download_dir: Option<PathBuf>,
    },

    /// Run two in-process peers that chat and exchange a file
    Demo {
        /// File to send (a generated 40 KB file if not provided)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Listen { download_dir } => {
            peerchat_cli::run_listen(download_dir).await?;
        }
        Commands::Connect {
            ticket,
            download_dir,
        } => {
            peerchat_cli::run_connect(ticket, download_dir).await?;
        }
        Commands::Demo { path } => {
            peerchat_cli::run_demo(path).await?;
        }
    }

    Ok(())
}
