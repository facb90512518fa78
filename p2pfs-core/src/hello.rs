//! Greeting protocol: the server writes one greeting and closes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::host::StreamHandler;
use crate::stream::Stream;

pub const HELLO_GREETING: &str = "Hello, client!";
const MAX_GREETING: u64 = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct HelloResponder;

#[async_trait]
impl StreamHandler for HelloResponder {
    async fn handle(&self, mut stream: Stream) {
        let sent = async {
            stream.write_all(HELLO_GREETING.as_bytes()).await?;
            stream.close().await
        };
        if let Err(e) = sent.await {
            warn!(peer = %stream.remote_peer(), error = %e, "greeting failed");
        }
    }
}

/// Read the greeting until the server closes the stream.
pub async fn read_greeting<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<String> {
    let mut raw = Vec::new();
    stream.take(MAX_GREETING).read_to_end(&mut raw).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
