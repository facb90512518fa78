//! Application side of a multiplexed stream.
//!
//! Each stream is an in-memory duplex pipe: the application holds one end as a
//! [`Stream`], the connection driver pumps the other end to and from frames.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::future::Future;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::oneshot;

use crate::identity::PeerId;
use crate::protocol::StreamId;

/// Bytes buffered inside each stream pipe before writers wait.
pub(crate) const STREAM_BUFFER: usize = 64 * 1024;

/// Flags shared between a stream and its driver.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    /// Remote reset the stream or the connection went away.
    remote_reset: AtomicBool,
    /// Local side asked for a reset instead of a graceful close.
    local_abort: AtomicBool,
}

impl StreamState {
    pub(crate) fn mark_remote_reset(&self) {
        self.remote_reset.store(true, Ordering::Release);
    }

    pub(crate) fn is_remote_reset(&self) -> bool {
        self.remote_reset.load(Ordering::Acquire)
    }

    pub(crate) fn is_local_abort(&self) -> bool {
        self.local_abort.load(Ordering::Acquire)
    }
}

/// Ordered, reliable byte stream to one remote peer, tagged with a protocol.
///
/// Reading returns end-of-stream once the remote closed its side. If the remote
/// reset the stream or the connection was lost, reads return
/// [`io::ErrorKind::ConnectionReset`] after any bytes already delivered.
pub struct Stream {
    id: StreamId,
    protocol: String,
    remote: PeerId,
    io: DuplexStream,
    state: Arc<StreamState>,
    /// Completes once the driver has put the end frame on the wire.
    finished: Option<oneshot::Receiver<()>>,
}

/// The connection driver's half of a stream.
pub(crate) struct DriverEnd {
    pub(crate) io: DuplexStream,
    pub(crate) state: Arc<StreamState>,
    /// Dropped by the driver when the end frame is written or the stream is abandoned.
    pub(crate) finished: oneshot::Sender<()>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Create a stream and the driver's end of its pipe.
pub(crate) fn pair(id: StreamId, protocol: &str, remote: PeerId) -> (Stream, DriverEnd) {
    let (app, io) = tokio::io::duplex(STREAM_BUFFER);
    let state = Arc::new(StreamState::default());
    let (finished, finished_rx) = oneshot::channel();
    let stream = Stream {
        id,
        protocol: protocol.to_string(),
        remote,
        io: app,
        state: state.clone(),
        finished: Some(finished_rx),
    };
    (
        stream,
        DriverEnd {
            io,
            state,
            finished,
        },
    )
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

impl Stream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    /// Finish writing. The remote reads end-of-stream once buffered bytes are
    /// delivered. Returns after the close has been written to the connection, so
    /// closing the host right afterwards does not turn it into a reset.
    pub async fn close(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }

    /// Abort the stream. Bytes already written are still delivered, then the
    /// remote reader gets an error instead of end-of-stream.
    pub async fn reset(mut self) {
        self.state.local_abort.store(true, Ordering::Release);
        let _ = AsyncWriteExt::shutdown(&mut self).await;
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let eof = buf.filled().len() == before && buf.remaining() > 0;
                if eof && this.state.is_remote_reset() {
                    return Poll::Ready(Err(reset_error()));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state.is_remote_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state.is_remote_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.io).poll_shutdown(cx))?;
        if let Some(finished) = this.finished.as_mut() {
            // Err only means the driver dropped its end; either way it is done.
            let _ = ready!(Pin::new(finished).poll(cx));
            this.finished = None;
        }
        Poll::Ready(Ok(()))
    }
}
