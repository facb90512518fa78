//! Encrypted connection to one peer: handshake, record loop, stream multiplexing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::host::{DriverContext, TransportError};
use crate::identity::{derive_session_keys, Keypair, PeerId, PublicKey, SessionKeys};
use crate::protocol::{Frame, StreamId, PROTOCOL_VERSION};
use crate::stream::{self, DriverEnd, Stream, StreamState};
use crate::wire::{read_record, write_record};

const HANDSHAKE_SIZE: usize = 1 + 16 + 32; // version + peer_id + public_key
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the writer keeps flushing queued frames once the host shuts down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Largest payload carried by one Data frame.
const MAX_DATA_PAYLOAD: usize = 16 * 1024;
/// Frames queued for the writer before stream pumps wait.
const OUTBOUND_QUEUE: usize = 64;
/// Payloads queued per stream before the reader stops reading the socket.
const INBOUND_QUEUE: usize = 16;

/// A frame for the writer, optionally acknowledged once it is on the socket.
pub(crate) struct Outbound {
    frame: Frame,
    written: Option<oneshot::Sender<()>>,
}

impl From<Frame> for Outbound {
    fn from(frame: Frame) -> Self {
        Self {
            frame,
            written: None,
        }
    }
}

/// One established connection. Shared by the host (for opening streams) and its
/// reader task (for dispatching inbound frames).
pub(crate) struct Connection {
    remote: PeerId,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    pending: Mutex<HashMap<StreamId, oneshot::Sender<Result<(), String>>>>,
    next_id: AtomicU32,
    closed: watch::Sender<bool>,
    ctx: DriverContext,
}

/// Driver-side handle of an open stream.
struct StreamSlot {
    inbound: mpsc::Sender<Vec<u8>>,
    state: Arc<StreamState>,
}

/// Run the handshake on `tcp` and start the reader and writer tasks.
/// `expected` is the peer ID the dialer expects; listeners pass `None`.
pub(crate) async fn establish(
    mut tcp: TcpStream,
    keypair: &Keypair,
    expected: Option<PeerId>,
    ctx: DriverContext,
) -> Result<Arc<Connection>, TransportError> {
    if ctx.is_shutting_down() {
        return Err(TransportError::Closed);
    }
    let initiator = expected.is_some();
    let remote_addr = tcp.peer_addr()?;
    let (remote, keys) =
        tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut tcp, keypair, initiator))
            .await
            .map_err(|_| TransportError::Handshake("timed out".into()))??;
    if let Some(expected) = expected {
        if expected != remote {
            return Err(TransportError::PeerMismatch {
                expected,
                actual: remote,
            });
        }
    }
    let _ = tcp.set_nodelay(true);

    let (reader, writer) = tcp.into_split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (closed, closed_rx) = watch::channel(false);
    let closed_rx_reader = closed_rx.clone();
    let conn = Arc::new(Connection {
        remote,
        remote_addr,
        outbound,
        streams: Mutex::new(HashMap::new()),
        pending: Mutex::new(HashMap::new()),
        next_id: AtomicU32::new(if initiator { 1 } else { 2 }),
        closed,
        ctx: ctx.clone(),
    });

    if let Some(previous) = ctx.connections.lock().await.insert(remote, conn.clone()) {
        debug!(peer = %remote, "replacing existing connection");
        previous.mark_closed();
    }

    ctx.tasks.spawn(write_loop(
        writer,
        outbound_rx,
        keys.send,
        ctx.shutdown.clone(),
        closed_rx,
    ));
    let reader_conn = conn.clone();
    let recv_key = keys.recv;
    ctx.tasks.spawn(async move {
        reader_conn
            .read_loop(reader, recv_key, closed_rx_reader)
            .await
    });

    debug!(peer = %remote, addr = %remote_addr, initiator, "connection established");
    Ok(conn)
}

async fn handshake(
    tcp: &mut TcpStream,
    keypair: &Keypair,
    initiator: bool,
) -> Result<(PeerId, SessionKeys), TransportError> {
    let out = handshake_bytes(keypair);
    let mut buf = [0u8; HANDSHAKE_SIZE];
    if initiator {
        tcp.write_all(&out).await?;
        tcp.flush().await?;
        tcp.read_exact(&mut buf).await?;
    } else {
        tcp.read_exact(&mut buf).await?;
        tcp.write_all(&out).await?;
        tcp.flush().await?;
    }

    if buf[0] != PROTOCOL_VERSION {
        return Err(TransportError::Handshake(format!(
            "unsupported protocol version {}",
            buf[0]
        )));
    }
    let mut peer_id = [0u8; 16];
    peer_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    let peer_id = PeerId::from_bytes(peer_id);
    if PeerId::from_public_key(&public_key) != peer_id {
        return Err(TransportError::Handshake(
            "peer id does not match public key".into(),
        ));
    }
    let secret = keypair.shared_secret(&PublicKey::from_bytes(public_key));
    Ok((peer_id, derive_session_keys(&secret, initiator)))
}

fn handshake_bytes(keypair: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.peer_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

/// Seal and send frames in queue order. When the host shuts down between
/// records, frames already queued (such as the Close of a stream that just
/// finished) are still sent; nothing new is accepted.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    key: [u8; 32],
    mut shutdown: watch::Receiver<bool>,
    mut closed: watch::Receiver<bool>,
) {
    let mut nonce: u64 = 0;
    let mut draining = false;
    loop {
        let out = tokio::select! {
            out = rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
            _ = shutdown.changed() => {
                draining = true;
                break;
            }
            _ = closed.changed() => break,
        };
        // A record cut off here leaves the socket unusable, so no draining after it.
        tokio::select! {
            written = send(&mut writer, &key, &mut nonce, out) => {
                if !written {
                    break;
                }
            }
            _ = shutdown.changed() => break,
            _ = closed.changed() => break,
        }
    }
    if draining {
        rx.close();
        let drain = async {
            while let Ok(out) = rx.try_recv() {
                if !send(&mut writer, &key, &mut nonce, out).await {
                    break;
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("gave up flushing queued frames");
        }
    }
    let _ = writer.shutdown().await;
}

/// Write one frame and acknowledge it. Returns false once the socket failed.
async fn send(writer: &mut OwnedWriteHalf, key: &[u8; 32], nonce: &mut u64, out: Outbound) -> bool {
    if let Err(e) = write_record(writer, key, *nonce, &out.frame).await {
        debug!(error = %e, "connection write failed");
        return false;
    }
    *nonce = nonce.saturating_add(1);
    if let Some(written) = out.written {
        let _ = written.send(());
    }
    true
}

impl Connection {
    pub(crate) fn remote(&self) -> PeerId {
        self.remote
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
    }

    /// Open an outbound stream and wait for the remote to accept the protocol.
    pub(crate) async fn open_stream(&self, protocol: &str) -> Result<Stream, TransportError> {
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Closed);
        }
        let stream = self.attach(id, protocol).await;
        let open = Frame::Open {
            stream: id,
            protocol: protocol.to_string(),
        };
        if self.outbound.send(open.into()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Closed);
        }
        match rx.await {
            Ok(Ok(())) => {
                debug!(peer = %self.remote, stream = id, protocol, "stream opened");
                Ok(stream)
            }
            Ok(Err(reason)) => Err(TransportError::ProtocolRejected {
                protocol: protocol.to_string(),
                reason,
            }),
            Err(_) => Err(TransportError::Closed),
        }
    }

    /// Register a stream and start its pump and delivery tasks.
    async fn attach(&self, id: StreamId, protocol: &str) -> Stream {
        let (stream, driver) = stream::pair(id, protocol, self.remote);
        let DriverEnd {
            io,
            state,
            finished,
        } = driver;
        let (driver_read, driver_write) = tokio::io::split(io);
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        self.streams.lock().await.insert(
            id,
            StreamSlot {
                inbound,
                state: state.clone(),
            },
        );
        self.ctx.tasks.spawn(pump(
            id,
            driver_read,
            self.outbound.clone(),
            state,
            self.closed.subscribe(),
            finished,
        ));
        self.ctx.tasks.spawn(deliver(inbound_rx, driver_write));
        stream
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        key: [u8; 32],
        mut closed: watch::Receiver<bool>,
    ) {
        let mut shutdown = self.ctx.shutdown.clone();
        let mut nonce: u64 = 0;
        loop {
            let step = async {
                let frame = read_record(&mut reader, &key, nonce).await?;
                nonce = nonce.saturating_add(1);
                self.dispatch(frame).await;
                Ok::<(), TransportError>(())
            };
            tokio::select! {
                stepped = step => {
                    if let Err(e) = stepped {
                        debug!(peer = %self.remote, error = %e, "connection read ended");
                        break;
                    }
                }
                _ = shutdown.changed() => break,
                _ = closed.changed() => break,
            }
        }
        self.teardown().await;
    }

    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Open { stream, protocol } => self.on_open(stream, protocol).await,
            Frame::Accept { stream } => {
                if let Some(tx) = self.pending.lock().await.remove(&stream) {
                    let _ = tx.send(Ok(()));
                }
            }
            Frame::Reject { stream, reason } => {
                self.streams.lock().await.remove(&stream);
                if let Some(tx) = self.pending.lock().await.remove(&stream) {
                    let _ = tx.send(Err(reason));
                }
            }
            Frame::Data { stream, payload } => {
                let inbound = self
                    .streams
                    .lock()
                    .await
                    .get(&stream)
                    .map(|slot| slot.inbound.clone());
                // Waits while the application is behind; that stalls the socket.
                if let Some(inbound) = inbound {
                    let _ = inbound.send(payload).await;
                }
            }
            Frame::Close { stream } => {
                // Dropping the sender ends the stream once queued data is delivered.
                self.streams.lock().await.remove(&stream);
            }
            Frame::Reset { stream } => {
                if let Some(slot) = self.streams.lock().await.remove(&stream) {
                    slot.state.mark_remote_reset();
                }
                if let Some(tx) = self.pending.lock().await.remove(&stream) {
                    let _ = tx.send(Err("stream reset".into()));
                }
            }
        }
    }

    async fn on_open(&self, id: StreamId, protocol: String) {
        let handler = self.ctx.handlers.read().await.get(&protocol).cloned();
        let duplicate = self.streams.lock().await.contains_key(&id);
        let reply = match handler {
            _ if duplicate => Frame::Reset { stream: id },
            None => {
                warn!(peer = %self.remote, protocol = %protocol, "no handler for protocol");
                Frame::Reject {
                    stream: id,
                    reason: "protocol not supported".into(),
                }
            }
            Some(handler) => {
                let stream = self.attach(id, &protocol).await;
                debug!(peer = %self.remote, stream = id, protocol = %protocol, "inbound stream");
                self.ctx
                    .tasks
                    .spawn(async move { handler.handle(stream).await });
                Frame::Accept { stream: id }
            }
        };
        let _ = self.outbound.send(reply.into()).await;
    }

    /// Fail every open stream and pending open, and forget this connection.
    async fn teardown(&self) {
        self.mark_closed();
        for (_, slot) in self.streams.lock().await.drain() {
            slot.state.mark_remote_reset();
        }
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err("connection closed".into()));
        }
        let mut connections = self.ctx.connections.lock().await;
        if let Some(current) = connections.get(&self.remote) {
            if std::ptr::eq(Arc::as_ptr(current), self as *const Connection) {
                connections.remove(&self.remote);
            }
        }
        debug!(peer = %self.remote, "connection closed");
    }
}

/// Copy bytes the application wrote into Data frames; end with Close or Reset.
/// `finished` is dropped once the end frame is on the socket or the stream is
/// abandoned, which completes the application's shutdown.
async fn pump(
    id: StreamId,
    mut driver_read: ReadHalf<DuplexStream>,
    outbound: mpsc::Sender<Outbound>,
    state: Arc<StreamState>,
    mut closed: watch::Receiver<bool>,
    finished: oneshot::Sender<()>,
) {
    let mut buf = vec![0u8; MAX_DATA_PAYLOAD];
    if *closed.borrow() {
        return;
    }
    let end = loop {
        let read = tokio::select! {
            read = driver_read.read(&mut buf) => read,
            _ = closed.changed() => return,
        };
        match read {
            Ok(0) if state.is_local_abort() => break Frame::Reset { stream: id },
            Ok(0) => break Frame::Close { stream: id },
            Ok(n) => {
                let data = Frame::Data {
                    stream: id,
                    payload: buf[..n].to_vec(),
                };
                if outbound.send(data.into()).await.is_err() {
                    return;
                }
            }
            Err(_) => break Frame::Reset { stream: id },
        }
    };
    let (written, on_socket) = oneshot::channel();
    let end = Outbound {
        frame: end,
        written: Some(written),
    };
    if outbound.send(end).await.is_ok() {
        tokio::select! {
            _ = on_socket => {}
            _ = closed.changed() => {}
        }
    }
    drop(finished);
}

/// Write inbound payloads into the application's pipe; end-of-stream when the
/// slot is dropped.
async fn deliver(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut driver_write: WriteHalf<DuplexStream>,
) {
    while let Some(chunk) = inbound.recv().await {
        if driver_write.write_all(&chunk).await.is_err() {
            return;
        }
    }
    let _ = driver_write.shutdown().await;
}
