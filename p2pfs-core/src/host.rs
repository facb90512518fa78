//! Peer host: identity, listeners, connections and protocol handlers.
//!
//! A [`Host`] is created once per process and passed to whatever needs the
//! network. It listens on TCP, dials peer addresses, and multiplexes
//! protocol-tagged [`Stream`]s over one encrypted connection per peer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::address::{AddressError, ListenAddress, PeerAddress};
use crate::connection::{self, Connection};
use crate::identity::{Keypair, PeerId};
use crate::stream::Stream;
use crate::wire::WireError;

/// Invoked once per inbound stream carrying the protocol it was registered for.
/// The handler owns the stream; dropping it closes the stream.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, stream: Stream);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("address: {0}")]
    Address(#[from] AddressError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("expected peer {expected}, connected to {actual}")]
    PeerMismatch { expected: PeerId, actual: PeerId },
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error("peer rejected protocol {protocol}: {reason}")]
    ProtocolRejected { protocol: String, reason: String },
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("connection closed")]
    Closed,
}

pub(crate) type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn StreamHandler>>>>;
pub(crate) type ConnectionMap = Arc<Mutex<HashMap<PeerId, Arc<Connection>>>>;

/// Counts spawned tasks so shutdown can wait for them to finish.
#[derive(Clone, Default)]
pub(crate) struct TaskCounter {
    inner: Arc<TaskCounterInner>,
}

#[derive(Default)]
struct TaskCounterInner {
    active: AtomicUsize,
    idle: Notify,
}

struct TaskGuard(Arc<TaskCounterInner>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl TaskCounter {
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let guard = TaskGuard(self.inner.clone());
        tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    pub(crate) fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.active() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// State every connection task needs from its host.
#[derive(Clone)]
pub(crate) struct DriverContext {
    pub(crate) handlers: HandlerMap,
    pub(crate) connections: ConnectionMap,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) tasks: TaskCounter,
}

impl DriverContext {
    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Process-wide peer host. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    keypair: Arc<Keypair>,
    ctx: DriverContext,
    shutdown: watch::Sender<bool>,
    listen_addrs: Mutex<Vec<ListenAddress>>,
}

impl Host {
    pub fn new(keypair: Keypair) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = DriverContext {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown: shutdown_rx,
            tasks: TaskCounter::default(),
        };
        Self {
            inner: Arc::new(HostInner {
                keypair: Arc::new(keypair),
                ctx,
                shutdown,
                listen_addrs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.keypair.peer_id()
    }

    /// Bind `addr` and accept connections until [`Host::close`]. Returns the bound
    /// address (port 0 is replaced by the actual port).
    pub async fn listen(&self, addr: &ListenAddress) -> Result<ListenAddress, TransportError> {
        let sock = addr.resolve().await?;
        let listener = TcpListener::bind(sock).await?;
        let bound = ListenAddress::from_socket_addr(listener.local_addr()?);
        self.inner.listen_addrs.lock().await.push(bound.clone());
        info!(addr = %bound, peer = %self.peer_id(), "listening");

        let keypair = self.inner.keypair.clone();
        let ctx = self.inner.ctx.clone();
        self.inner
            .ctx
            .tasks
            .spawn(accept_loop(listener, keypair, ctx));
        Ok(bound)
    }

    pub async fn listen_addrs(&self) -> Vec<ListenAddress> {
        self.inner.listen_addrs.lock().await.clone()
    }

    /// Listen addresses with this host's peer ID attached; what clients dial.
    pub async fn peer_addresses(&self) -> Vec<PeerAddress> {
        let id = self.peer_id();
        self.listen_addrs()
            .await
            .into_iter()
            .map(|a| a.with_peer(id))
            .collect()
    }

    /// Register `handler` for inbound streams tagged `protocol`, replacing any previous one.
    pub async fn set_stream_handler<H: StreamHandler>(&self, protocol: &str, handler: H) {
        self.inner
            .ctx
            .handlers
            .write()
            .await
            .insert(protocol.to_string(), Arc::new(handler));
        debug!(protocol, "stream handler registered");
    }

    pub async fn remove_stream_handler(&self, protocol: &str) -> bool {
        self.inner
            .ctx
            .handlers
            .write()
            .await
            .remove(protocol)
            .is_some()
    }

    /// Connect to `addr` unless a live connection to that peer already exists.
    pub async fn connect(&self, addr: &PeerAddress) -> Result<(), TransportError> {
        if self.live_connection(addr.peer_id()).await.is_some() {
            return Ok(());
        }
        let sock = addr.locator().resolve().await?;
        let tcp = TcpStream::connect(sock).await?;
        let conn = connection::establish(
            tcp,
            &self.inner.keypair,
            Some(addr.peer_id()),
            self.inner.ctx.clone(),
        )
        .await?;
        info!(peer = %conn.remote(), addr = %conn.remote_addr(), "connected");
        Ok(())
    }

    pub async fn is_connected(&self, peer: PeerId) -> bool {
        self.live_connection(peer).await.is_some()
    }

    /// Open a stream for `protocol` on the existing connection to `peer`.
    pub async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream, TransportError> {
        let conn = self
            .live_connection(peer)
            .await
            .ok_or(TransportError::NotConnected(peer))?;
        conn.open_stream(protocol).await
    }

    async fn live_connection(&self, peer: PeerId) -> Option<Arc<Connection>> {
        self.inner
            .ctx
            .connections
            .lock()
            .await
            .get(&peer)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Stop listening, drop every connection, and wait for connection and handler
    /// tasks to finish. Open streams fail with a reset. Callers bound the wait
    /// with a timeout if handlers may be slow to notice.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        debug!(tasks = self.inner.ctx.tasks.active(), "host closing");
        self.inner.ctx.tasks.wait_idle().await;
        info!(peer = %self.peer_id(), "host closed");
    }
}

async fn accept_loop(listener: TcpListener, keypair: Arc<Keypair>, ctx: DriverContext) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let (tcp, from) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        let keypair = keypair.clone();
        let conn_ctx = ctx.clone();
        ctx.tasks.spawn(async move {
            match connection::establish(tcp, &keypair, None, conn_ctx).await {
                Ok(conn) => info!(peer = %conn.remote(), addr = %from, "inbound connection"),
                Err(e) => warn!(addr = %from, error = %e, "inbound handshake failed"),
            }
        });
    }
    debug!("listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn task_counter_waits_for_tasks() {
        let tasks = TaskCounter::default();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(tasks.active(), 1);
        let waiting = tokio::time::timeout(Duration::from_millis(50), tasks.wait_idle()).await;
        assert!(waiting.is_err());
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.wait_idle())
            .await
            .unwrap();
        assert_eq!(tasks.active(), 0);
    }

    #[tokio::test]
    async fn new_stream_requires_connection() {
        let host = Host::new(Keypair::generate());
        let other = Keypair::generate().peer_id();
        assert!(matches!(
            host.new_stream(other, "/x").await,
            Err(TransportError::NotConnected(p)) if p == other
        ));
    }

    #[tokio::test]
    async fn listen_reports_bound_port() {
        let host = Host::new(Keypair::generate());
        let bound = host
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(bound.port(), 0);
        let addrs = host.peer_addresses().await;
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].peer_id(), host.peer_id());
        tokio::time::timeout(Duration::from_secs(5), host.close())
            .await
            .unwrap();
    }
}
