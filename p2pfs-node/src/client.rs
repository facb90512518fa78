//! `p2pfs client`: dial a server and run one exchange.

use std::time::Duration;

use anyhow::{bail, Context};
use clap::ValueEnum;
use p2pfs_core::chat::chat_session;
use p2pfs_core::hello::read_greeting;
use p2pfs_core::{
    FileRequester, Host, Keypair, PeerAddress, CHAT_PROTOCOL, FILE_SHARE_PROTOCOL,
    HELLO_PROTOCOL,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::config::Config;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Chat,
    File,
    Hello,
}

impl Mode {
    fn protocol(self) -> &'static str {
        match self {
            Mode::Chat => CHAT_PROTOCOL,
            Mode::File => FILE_SHARE_PROTOCOL,
            Mode::Hello => HELLO_PROTOCOL,
        }
    }

    /// Menu answer: `1`/`chat`, `2`/`file`, `3`/`hello`.
    fn from_choice(choice: &str) -> Option<Mode> {
        match choice.trim().to_ascii_lowercase().as_str() {
            "1" | "chat" => Some(Mode::Chat),
            "2" | "file" => Some(Mode::File),
            "3" | "hello" => Some(Mode::Hello),
            _ => None,
        }
    }
}

pub struct ClientArgs {
    pub peer: String,
    pub mode: Option<Mode>,
    pub file: Option<String>,
}

pub async fn run(cfg: &Config, args: ClientArgs) -> anyhow::Result<()> {
    let addr: PeerAddress = args
        .peer
        .parse()
        .with_context(|| format!("invalid peer address {:?}", args.peer))?;
    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();

    let host = Host::new(Keypair::generate());
    host.connect(&addr)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    println!("Connected to {}", addr.peer_id());

    let result = exchange(&host, &addr, cfg, args, &mut input, &mut output).await;
    if tokio::time::timeout(CLOSE_TIMEOUT, host.close()).await.is_err() {
        warn!("connection did not close in time");
    }
    result
}

async fn exchange<I, O>(
    host: &Host,
    addr: &PeerAddress,
    cfg: &Config,
    args: ClientArgs,
    input: &mut I,
    output: &mut O,
) -> anyhow::Result<()>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mode = match args.mode {
        Some(mode) => mode,
        None => choose_mode(input, output).await?,
    };
    let mut stream = host
        .new_stream(addr.peer_id(), mode.protocol())
        .await
        .with_context(|| format!("opening {} stream", mode.protocol()))?;

    match mode {
        Mode::Chat => {
            let rounds = chat_session(stream, input, output).await?;
            output
                .write_all(format!("Chat ended after {} message(s)\n", rounds).as_bytes())
                .await?;
        }
        Mode::File => {
            let name = match args.file {
                Some(name) => name,
                None => prompt(input, output, "Enter the filename to request: ")
                    .await?
                    .context("no filename given")?,
            };
            let received = FileRequester::new(&cfg.receive_dir)
                .fetch(&mut stream, &name)
                .await
                .with_context(|| format!("requesting {:?}", name))?;
            output
                .write_all(
                    format!(
                        "File received and saved as {} ({} bytes)\n",
                        received.path.display(),
                        received.bytes
                    )
                    .as_bytes(),
                )
                .await?;
        }
        Mode::Hello => {
            let greeting = read_greeting(&mut stream).await?;
            output
                .write_all(format!("Received: {}\n", greeting).as_bytes())
                .await?;
        }
    }
    output.flush().await?;
    Ok(())
}

async fn choose_mode<I, O>(input: &mut I, output: &mut O) -> anyhow::Result<Mode>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let menu = "Choose mode:\n  1) chat\n  2) file\n  3) hello\n> ";
    loop {
        let Some(choice) = prompt(input, output, menu).await? else {
            bail!("no mode chosen");
        };
        if let Some(mode) = Mode::from_choice(&choice) {
            return Ok(mode);
        }
        output
            .write_all(format!("Unknown mode {:?}\n", choice.trim()).as_bytes())
            .await?;
    }
}

/// Print `text` and read one line. `None` at end of input.
async fn prompt<I, O>(input: &mut I, output: &mut O, text: &str) -> anyhow::Result<Option<String>>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    output.write_all(text.as_bytes()).await?;
    output.flush().await?;
    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
