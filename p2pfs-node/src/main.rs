//! p2pfs: serve or fetch files, chat lines and greetings between two peers.

mod client;
mod config;
mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use client::{ClientArgs, Mode};

/// Peer-to-peer file sharing and chat over encrypted streams
#[derive(Parser)]
#[command(name = "p2pfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for peers and serve files from a directory
    Server {
        /// Listen address, e.g. /ip4/0.0.0.0/tcp/8080
        #[arg(short, long)]
        listen: Option<String>,

        /// Directory to serve
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Bytes per chunk
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Connect to a server and chat, fetch a file, or ask for a greeting
    Client {
        /// Server address including /p2p/<peer-id>
        peer: String,

        /// Exchange to run; asked interactively when omitted
        #[arg(short, long, value_enum)]
        mode: Option<Mode>,

        /// File to request in file mode
        #[arg(short, long)]
        file: Option<String>,

        /// Directory for received files
        #[arg(long)]
        receive_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Server {
            listen,
            root,
            chunk_size,
        } => {
            if let Some(listen) = listen {
                cfg.listen = listen;
            }
            if let Some(root) = root {
                cfg.root = root;
            }
            if let Some(chunk_size) = chunk_size {
                cfg.chunk_size = chunk_size;
            }
            cfg.validate()?;
            server::run(&cfg).await?;
        }
        Commands::Client {
            peer,
            mode,
            file,
            receive_dir,
        } => {
            if let Some(dir) = receive_dir {
                cfg.receive_dir = dir;
            }
            cfg.validate()?;
            client::run(&cfg, ClientArgs { peer, mode, file }).await?;
        }
    }

    Ok(())
}
