/// Network layer for hostmesh replicas.
///
/// This module provides the wire protocol and the TCP transport used between
/// replicas:
///
/// - Node identity
/// - Gossip message types and their envelope
/// - Length-prefixed framing over TCP
/// - [`TcpTransport`], a [`Transport`] backed by one connection per send
///
/// # Protocol Design
///
/// Gossip is fire-and-forget. Each frame is a 4-byte big-endian length header
/// followed by a bincode-encoded [`Envelope`]. No responses are expected;
/// replies (such as a reciprocal digest) travel as separate frames.
use crate::clock::Timestamp;
use crate::error::{HostError, HostResult};
use crate::transport::{Membership, Transport};
use crate::types::{FragmentId, HostDescriptor, HostId, ProviderId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default port for replica-to-replica gossip.
pub const DEFAULT_PORT: u16 = 7979;

/// Maximum frame size (16 MB).
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Unique identifier for a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a node ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Compact id stamped into timestamps issued by this node.
    pub fn origin(&self) -> u32 {
        let bytes = self.0.as_bytes();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A create or update of one host, as applied by its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// Provider that reported the host.
    pub provider_id: ProviderId,
    /// The host.
    pub host_id: HostId,
    /// What to apply.
    pub descriptor: HostDescriptor,
    /// Version of the update.
    pub timestamp: Timestamp,
}

/// A removal of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMsg {
    /// The removed host.
    pub host_id: HostId,
    /// When it was removed.
    pub timestamp: Timestamp,
}

/// Compact summary of a replica's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiEntropyDigest {
    /// Replica that built the digest.
    pub sender: NodeId,
    /// Timestamp of every live host, keyed by provenance.
    pub fragments: HashMap<FragmentId, Timestamp>,
    /// Timestamp of every tombstone.
    pub tombstones: HashMap<HostId, Timestamp>,
    /// Set on a digest sent back in answer to another digest. Replies are
    /// never answered again.
    pub reply: bool,
}

impl AntiEntropyDigest {
    /// Create an empty digest.
    pub fn new(sender: NodeId) -> Self {
        Self {
            sender,
            fragments: HashMap::new(),
            tombstones: HashMap::new(),
            reply: false,
        }
    }

    /// Mark this digest as a reply.
    pub fn into_reply(mut self) -> Self {
        self.reply = true;
        self
    }

    /// Check whether the digest describes no state at all.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty() && self.tombstones.is_empty()
    }
}

/// Messages exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipMessage {
    // ─────────────────────────────────────────────────────────────────────
    // Broadcast path
    // ─────────────────────────────────────────────────────────────────────
    /// A host was created or updated.
    Update(UpdateMsg),

    /// A host was removed.
    Remove(RemoveMsg),

    // ─────────────────────────────────────────────────────────────────────
    // Anti-entropy
    // ─────────────────────────────────────────────────────────────────────
    /// Summary of the sender's state.
    Digest(AntiEntropyDigest),
}

impl GossipMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::Remove(_) => "remove",
            Self::Digest(_) => "digest",
        }
    }
}

/// A message tagged with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending replica.
    pub sender: NodeId,
    /// Payload.
    pub message: GossipMessage,
}

impl Envelope {
    /// Wrap a message.
    pub fn new(sender: NodeId, message: GossipMessage) -> Self {
        Self { sender, message }
    }

    /// Serialize envelope to bytes.
    pub fn to_bytes(&self) -> HostResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize envelope from bytes.
    pub fn from_bytes(bytes: &[u8]) -> HostResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Network connection to a peer.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Create a new connection from a TCP stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    /// Connect to a peer.
    pub async fn connect(addr: SocketAddr) -> HostResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HostError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        Ok(Self::new(stream, addr))
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send an envelope to the peer.
    pub async fn send(&mut self, envelope: &Envelope) -> HostResult<()> {
        let bytes = envelope.to_bytes()?;

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(HostError::Transport(format!(
                "Message too large: {} bytes (max: {})",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        // Write length header (4 bytes, big-endian).
        let len = bytes.len() as u32;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| HostError::Transport(format!("Failed to write message length: {}", e)))?;

        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| HostError::Transport(format!("Failed to write message body: {}", e)))?;

        self.stream
            .flush()
            .await
            .map_err(|e| HostError::Transport(format!("Failed to flush stream: {}", e)))?;

        Ok(())
    }

    /// Receive an envelope from the peer.
    pub async fn receive(&mut self) -> HostResult<Envelope> {
        let mut len_bytes = [0u8; 4];
        self.stream
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| HostError::Transport(format!("Failed to read message length: {}", e)))?;

        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(HostError::Transport(format!(
                "Message too large: {} bytes (max: {})",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut bytes = vec![0u8; len];
        self.stream
            .read_exact(&mut bytes)
            .await
            .map_err(|e| HostError::Transport(format!("Failed to read message body: {}", e)))?;

        Envelope::from_bytes(&bytes)
    }
}

/// TCP listener for incoming gossip connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to an address and start listening.
    pub async fn bind(addr: SocketAddr) -> HostResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HostError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| HostError::Transport(format!("Failed to get local address: {}", e)))?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> HostResult<Connection> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| HostError::Transport(format!("Failed to accept connection: {}", e)))?;

        Ok(Connection::new(stream, peer_addr))
    }
}

/// Accept gossip connections and forward every received envelope to `inbox`.
///
/// The task ends when the receiving side of `inbox` is dropped.
pub fn spawn_listener(listener: Listener, inbox: mpsc::Sender<Envelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(conn) => {
                            let inbox = inbox.clone();
                            tokio::spawn(async move {
                                read_frames(conn, inbox).await;
                            });
                        }
                        Err(e) => tracing::debug!("{}", e),
                    }
                }
                _ = inbox.closed() => {
                    break;
                }
            }
        }
        tracing::debug!(addr = %listener.local_addr(), "Gossip listener stopped");
    })
}

async fn read_frames(mut conn: Connection, inbox: mpsc::Sender<Envelope>) {
    loop {
        let envelope = match conn.receive().await {
            Ok(envelope) => envelope,
            Err(_) => break, // Connection closed.
        };
        tracing::trace!(
            from = %envelope.sender,
            addr = %conn.peer_addr(),
            kind = envelope.message.kind(),
            "Received gossip frame"
        );
        if inbox.send(envelope).await.is_err() {
            break;
        }
    }
}

/// Gossip over TCP, one connection per message.
pub struct TcpTransport {
    node_id: NodeId,
    peers: DashMap<NodeId, SocketAddr>,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport for `node_id` with no known peers.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            peers: DashMap::new(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add or update a peer's address.
    pub fn add_peer(&self, node_id: NodeId, addr: SocketAddr) {
        if node_id != self.node_id {
            self.peers.insert(node_id, addr);
        }
    }

    /// Forget a peer.
    pub fn remove_peer(&self, node_id: &NodeId) -> Option<SocketAddr> {
        self.peers.remove(node_id).map(|(_, addr)| addr)
    }

    /// Address of a peer.
    pub fn peer_addr(&self, node_id: &NodeId) -> Option<SocketAddr> {
        self.peers.get(node_id).map(|entry| *entry.value())
    }

    async fn send_to(&self, addr: SocketAddr, envelope: &Envelope) -> HostResult<()> {
        let mut conn = tokio::time::timeout(self.connect_timeout, Connection::connect(addr))
            .await
            .map_err(|_| HostError::Transport(format!("Timed out connecting to {}", addr)))??;
        conn.send(envelope).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn unicast(&self, peer: &NodeId, message: GossipMessage) -> HostResult<()> {
        let addr = self
            .peer_addr(peer)
            .ok_or_else(|| HostError::Transport(format!("Unknown peer {}", peer)))?;
        self.send_to(addr, &Envelope::new(self.node_id, message)).await
    }

    async fn broadcast(&self, message: GossipMessage) -> HostResult<()> {
        let envelope = Envelope::new(self.node_id, message);
        let targets: Vec<(NodeId, SocketAddr)> = self
            .peers
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let sends = targets.iter().map(|(peer, addr)| {
            let envelope = &envelope;
            async move { (*peer, self.send_to(*addr, envelope).await) }
        });

        for (peer, result) in futures::future::join_all(sends).await {
            if let Err(e) = result {
                tracing::debug!(peer = %peer, "Broadcast delivery failed: {}", e);
            }
        }
        Ok(())
    }
}

impl Membership for TcpTransport {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.peers.iter().map(|entry| *entry.key()).collect();
        members.push(self.node_id);
        members
    }
}
