//! Line chat: the client sends one line, the server answers with a fixed acknowledgment.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::host::StreamHandler;
use crate::stream::Stream;

/// Reply to every chat line.
pub const CHAT_ACK: &str = "Message received";

const MESSAGE_PROMPT: &str = "Enter a message to send to the server: ";
const CONTINUE_PROMPT: &str = "Do you want to continue (yes/no)? ";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("server closed the stream")]
    Closed,
}

/// Answer every line on `stream` with [`CHAT_ACK`] until the client closes it.
/// Returns the number of messages answered.
pub async fn serve_chat<S>(stream: S) -> Result<u64, ChatError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let reply = format!("{}\n", CHAT_ACK);
    let mut answered = 0;
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(answered);
        }
        debug!(message = line.trim_end(), "chat message");
        stream.write_all(reply.as_bytes()).await?;
        stream.flush().await?;
        answered += 1;
    }
}

/// Server side handler for the chat protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatResponder;

#[async_trait]
impl StreamHandler for ChatResponder {
    async fn handle(&self, stream: Stream) {
        let peer = stream.remote_peer();
        match serve_chat(stream).await {
            Ok(answered) => info!(peer = %peer, answered, "chat ended"),
            Err(e) => warn!(peer = %peer, error = %e, "chat aborted"),
        }
    }
}

/// `yes` or `y`, ignoring case and surrounding whitespace.
pub fn is_affirmative(answer: &str) -> bool {
    let answer = answer.trim();
    answer.eq_ignore_ascii_case("yes") || answer.eq_ignore_ascii_case("y")
}

async fn ask<I, O>(input: &mut I, output: &mut O, prompt: &str) -> Result<Option<String>, ChatError>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    output.write_all(prompt.as_bytes()).await?;
    output.flush().await?;
    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Client side: prompt on `output`, read the user's lines from `input`, and
/// exchange them over `stream` until the user declines to continue or input
/// ends. Returns the number of completed rounds.
pub async fn chat_session<S, I, O>(stream: S, input: &mut I, output: &mut O) -> Result<u64, ChatError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut rounds = 0;
    loop {
        let Some(message) = ask(input, output, MESSAGE_PROMPT).await? else {
            break;
        };
        stream.write_all(format!("{}\n", message).as_bytes()).await?;
        stream.flush().await?;

        let mut response = String::new();
        if stream.read_line(&mut response).await? == 0 {
            return Err(ChatError::Closed);
        }
        let response = format!("Received response from server: {}\n", response.trim_end());
        output.write_all(response.as_bytes()).await?;
        rounds += 1;

        match ask(input, output, CONTINUE_PROMPT).await? {
            Some(answer) if is_affirmative(&answer) => {}
            _ => break,
        }
    }
    let _ = stream.shutdown().await;
    Ok(rounds)
}
