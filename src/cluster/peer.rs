//! Peer link management
//!
//! One TCP link per live neighbor. A dialing node sends `Hello` first so the
//! acceptor knows who showed up; after that both directions carry requests,
//! responses, and registry events. Each link has a writer task owning the
//! write half (serializing all outbound frames) and a reader loop feeding the
//! streaming codec. Calls park on a oneshot keyed by correlation id and give
//! up after the configured timeout; nothing is retried.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::rpc::{self, OpResult, RegistryRequest, RemoteOp};
use crate::cluster::wire::{encode, PeerFrame, WireCodec};
use crate::error::{NodeError, OpError, Result};
use crate::registry::RegistryEvent;
use crate::server::node::Node;
use crate::NodeId;

type CallResult = std::result::Result<OpResult, OpError>;

/// One live link to a neighbor
pub struct PeerLink {
    node: NodeId,
    tx: mpsc::UnboundedSender<PeerFrame>,
}

impl PeerLink {
    fn send(&self, frame: PeerFrame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| NodeError::peer(format!("link to {} is down", self.node)))
    }
}

/// All peer links of one node, plus the in-flight call table
pub struct Peers {
    node_id: NodeId,
    coordinator: NodeId,
    /// Configured dial addresses of every other node
    addresses: HashMap<NodeId, String>,
    call_timeout: Duration,
    links: RwLock<HashMap<NodeId, Arc<PeerLink>>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<CallResult>>>,
    /// The node this transport serves; set once at startup
    node: OnceLock<Weak<Node>>,
    cancel: CancellationToken,
}

impl Peers {
    pub fn new(
        node_id: NodeId,
        coordinator: NodeId,
        addresses: HashMap<NodeId, String>,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            coordinator,
            addresses,
            call_timeout,
            links: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            node: OnceLock::new(),
            cancel,
        })
    }

    /// Bind the owning node so incoming requests can be executed
    pub fn bind_node(&self, node: &Arc<Node>) {
        let _ = self.node.set(Arc::downgrade(node));
    }

    fn owning_node(&self) -> Result<Arc<Node>> {
        self.node
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| NodeError::internal("peer transport has no bound node"))
    }

    /// Accept inbound peer connections until cancelled
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("peer listener stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("inbound peer connection from {}", addr);
                        let peers = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = peers.handle_inbound(stream).await {
                                warn!("inbound peer connection failed: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("peer accept error: {}", e);
                    }
                }
            }
        }
    }

    /// Read the Hello, then promote the connection to a registered link
    async fn handle_inbound(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        let (mut read, write) = stream.into_split();
        let mut codec = WireCodec::new();
        let mut buf = vec![0u8; 8192];

        let peer_id = loop {
            if let Some(frame) = codec.decode_next()? {
                match frame {
                    PeerFrame::Hello { node } => break node,
                    other => {
                        return Err(NodeError::protocol(format!(
                            "expected Hello, got {:?}",
                            other
                        )))
                    }
                }
            }
            let n = read.read(&mut buf).await?;
            if n == 0 {
                return Err(NodeError::peer("connection closed before Hello"));
            }
            codec.feed(&buf[..n]);
        };

        info!("peer {} connected", peer_id);
        self.install_link(peer_id, read, write, codec, false).await;
        Ok(())
    }

    /// Wire up writer task and reader loop for a connected peer. `announce`
    /// queues our Hello as the very first outbound frame (dialed links only).
    async fn install_link(
        self: &Arc<Self>,
        peer_id: NodeId,
        mut read: OwnedReadHalf,
        mut write: OwnedWriteHalf,
        mut codec: WireCodec,
        announce: bool,
    ) -> Arc<PeerLink> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PeerFrame>();
        let link = Arc::new(PeerLink {
            node: peer_id.clone(),
            tx,
        });
        if announce {
            let _ = link.send(PeerFrame::Hello {
                node: self.node_id.clone(),
            });
        }

        {
            let mut links = self.links.write().await;
            links.insert(peer_id.clone(), Arc::clone(&link));
        }

        // Writer task: owns the write half, serializes outbound frames
        let writer_peer = peer_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let data = match encode(&frame) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("dropping unencodable frame for {}: {}", writer_peer, e);
                        continue;
                    }
                };
                if let Err(e) = write.write_all(&data).await {
                    debug!("write to {} failed: {}", writer_peer, e);
                    break;
                }
            }
        });

        // Reader loop: drain whatever is already buffered (frames may have
        // ridden in right behind the Hello), then keep decoding reads until
        // the socket goes away.
        let peers = Arc::clone(self);
        let reader_link = Arc::clone(&link);
        let reader_peer = peer_id.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            'conn: loop {
                loop {
                    match codec.decode_next() {
                        Ok(Some(frame)) => {
                            peers.handle_frame(&reader_peer, frame, &reader_link).await
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("frame decode error from {}: {}", reader_peer, e);
                            break 'conn;
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    n = read.read(&mut buf) => match n {
                        Ok(0) => break,
                        Ok(n) => codec.feed(&buf[..n]),
                        Err(e) => {
                            debug!("read from {} failed: {}", reader_peer, e);
                            break;
                        }
                    }
                }
            }

            let mut links = peers.links.write().await;
            if let Some(current) = links.get(&reader_peer) {
                if Arc::ptr_eq(current, &reader_link) {
                    links.remove(&reader_peer);
                    info!("peer {} disconnected", reader_peer);
                }
            }
        });

        // A fresh link to the coordinator means our registry mirror may be
        // arbitrarily stale; pull a full snapshot.
        if peer_id == self.coordinator && self.node_id != self.coordinator {
            let peers = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = peers.sync_registry().await {
                    warn!("registry snapshot sync failed: {}", e);
                }
            });
        }

        link
    }

    /// Fetch and apply the coordinator's full registry map
    async fn sync_registry(self: &Arc<Self>) -> Result<()> {
        let coordinator = self.coordinator.clone();
        let result = self
            .call(&coordinator, RemoteOp::Registry(RegistryRequest::Snapshot))
            .await?;
        match result {
            OpResult::Snapshot(entries) => {
                let node = self.owning_node()?;
                node.registry()
                    .apply_event(RegistryEvent::Snapshot { entries })
                    .await;
                Ok(())
            }
            other => Err(NodeError::protocol(format!(
                "unexpected snapshot response: {:?}",
                other
            ))),
        }
    }

    /// Existing link or a fresh dial to the configured address
    async fn link(self: &Arc<Self>, node: &NodeId) -> Result<Arc<PeerLink>> {
        {
            let links = self.links.read().await;
            if let Some(link) = links.get(node) {
                return Ok(Arc::clone(link));
            }
        }

        let addr = self
            .addresses
            .get(node)
            .ok_or_else(|| NodeError::peer(format!("unknown node '{}'", node)))?;

        debug!("dialing {} at {}", node, addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NodeError::peer(format!("dial {} failed: {}", node, e)))?;
        let (read, write) = stream.into_split();
        let link = self
            .install_link(node.clone(), read, write, WireCodec::new(), true)
            .await;
        Ok(link)
    }

    /// Invoke an operation on a node. A call addressed to this very node is
    /// executed in place; everything else goes over a link with the
    /// per-call timeout.
    ///
    /// Boxed up front because executing the op can itself issue further
    /// calls (a created room registers its name), which would otherwise
    /// make this future's type recursive.
    pub fn call<'a>(
        self: &'a Arc<Self>,
        target: &'a NodeId,
        op: RemoteOp,
    ) -> Pin<Box<dyn Future<Output = Result<OpResult>> + Send + 'a>> {
        Box::pin(async move {
            if *target == self.node_id {
                let node = self.owning_node()?;
                let fut: Pin<
                    Box<dyn Future<Output = std::result::Result<OpResult, OpError>> + Send>,
                > = Box::pin(async move { rpc::handle(&node, op).await });
                return fut.await.map_err(NodeError::Op);
            }

            let link = self.link(target).await?;
            let id = Uuid::new_v4();
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = self.pending.lock().await;
                pending.insert(id, tx);
            }

            if let Err(e) = link.send(PeerFrame::Request { id, op }) {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                return Err(e);
            }

            match timeout(self.call_timeout, rx).await {
                Ok(Ok(result)) => result.map_err(NodeError::Op),
                Ok(Err(_)) => Err(NodeError::peer(format!("link to {} dropped mid-call", target))),
                Err(_) => {
                    let mut pending = self.pending.lock().await;
                    pending.remove(&id);
                    Err(NodeError::timeout(format!(
                        "call to {} timed out after {:?}",
                        target, self.call_timeout
                    )))
                }
            }
        })
    }

    /// Push a registry event to every connected peer
    pub async fn broadcast_event(&self, event: RegistryEvent) {
        let links = self.links.read().await;
        for link in links.values() {
            if let Err(e) = link.send(PeerFrame::Event {
                event: event.clone(),
            }) {
                debug!("event broadcast to {} failed: {}", link.node, e);
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, from: &NodeId, frame: PeerFrame, link: &Arc<PeerLink>) {
        match frame {
            PeerFrame::Request { id, op } => {
                let peers = Arc::clone(self);
                let link = Arc::clone(link);
                tokio::spawn(async move {
                    let result = match peers.owning_node() {
                        Ok(node) => rpc::handle(&node, op).await,
                        Err(e) => Err(e.into_op()),
                    };
                    if let Err(e) = link.send(PeerFrame::Response { id, result }) {
                        debug!("response send failed: {}", e);
                    }
                });
            }

            PeerFrame::Response { id, result } => {
                let sender = {
                    let mut pending = self.pending.lock().await;
                    pending.remove(&id)
                };
                match sender {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("late response {} from {}", id, from),
                }
            }

            PeerFrame::Event { event } => match self.owning_node() {
                Ok(node) => node.registry().apply_event(event).await,
                Err(e) => debug!("dropping event from {}: {}", from, e),
            },

            PeerFrame::Hello { node } => {
                debug!("unexpected Hello from {} (already known as {})", node, from);
            }
        }
    }
}
