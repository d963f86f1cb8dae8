//! Transport and membership seams.
//!
//! The store never opens sockets itself. It talks to peers through a
//! [`Transport`] and learns who its peers are from a [`Membership`]. Delivery
//! is best-effort: a returned error means the message was not handed off,
//! never that it will be retried.
//!
//! [`MemoryNetwork`] wires replicas together in-process. Links can be cut
//! individually or by partition, which makes lost-broadcast scenarios easy to
//! reproduce deterministically.
use crate::error::{HostError, HostResult};
use crate::network::{Envelope, GossipMessage, NodeId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default capacity of a replica inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Receiving side of a replica's inbound message queue.
pub type Inbox = mpsc::Receiver<Envelope>;

/// Best-effort message delivery to peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` to one peer.
    async fn unicast(&self, peer: &NodeId, message: GossipMessage) -> HostResult<()>;

    /// Send `message` to every other member. Individual delivery failures are
    /// not reported.
    async fn broadcast(&self, message: GossipMessage) -> HostResult<()>;
}

/// Cluster membership view.
pub trait Membership: Send + Sync {
    /// This replica.
    fn local_node(&self) -> NodeId;

    /// Every member, including this replica.
    fn members(&self) -> Vec<NodeId>;

    /// Every member except this replica.
    fn peers(&self) -> Vec<NodeId> {
        let local = self.local_node();
        self.members()
            .into_iter()
            .filter(|member| *member != local)
            .collect()
    }
}

/// A fixed member list that can be edited at runtime.
#[derive(Debug)]
pub struct StaticMembership {
    local: NodeId,
    members: RwLock<Vec<NodeId>>,
}

impl StaticMembership {
    /// Create a membership view. `local` is added if missing.
    pub fn new(local: NodeId, members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut members: Vec<NodeId> = members.into_iter().collect();
        if !members.contains(&local) {
            members.push(local);
        }
        Self {
            local,
            members: RwLock::new(members),
        }
    }

    /// Add a member.
    pub fn add_member(&self, node_id: NodeId) {
        let mut members = self.members.write();
        if !members.contains(&node_id) {
            members.push(node_id);
        }
    }

    /// Remove a member. The local node cannot be removed.
    pub fn remove_member(&self, node_id: &NodeId) -> bool {
        if *node_id == self.local {
            return false;
        }
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|member| member != node_id);
        members.len() != before
    }
}

impl Membership for StaticMembership {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn members(&self) -> Vec<NodeId> {
        self.members.read().clone()
    }
}

/// In-process hub connecting replicas, with fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<DashMap<NodeId, mpsc::Sender<Envelope>>>,
    blocked: Arc<DashSet<(NodeId, NodeId)>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a replica, returning its transport and inbox.
    pub fn join(&self, node_id: NodeId) -> (MemoryTransport, Inbox) {
        self.join_with_capacity(node_id, DEFAULT_INBOX_CAPACITY)
    }

    /// Attach a replica with a custom inbox capacity.
    pub fn join_with_capacity(&self, node_id: NodeId, capacity: usize) -> (MemoryTransport, Inbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.routes.insert(node_id, tx);
        let transport = MemoryTransport {
            node_id,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Detach a replica. Messages to it are dropped from now on.
    pub fn leave(&self, node_id: &NodeId) {
        self.routes.remove(node_id);
    }

    /// Every attached replica.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.routes.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop messages from `from` to `to`.
    pub fn block(&self, from: NodeId, to: NodeId) {
        self.blocked.insert((from, to));
    }

    /// Restore the link from `from` to `to`.
    pub fn unblock(&self, from: NodeId, to: NodeId) {
        self.blocked.remove(&(from, to));
    }

    /// Cut every link between the two groups, in both directions.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.block(*a, *b);
                self.block(*b, *a);
            }
        }
    }

    /// Restore every link between the two groups.
    pub fn heal(&self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.unblock(*a, *b);
                self.unblock(*b, *a);
            }
        }
    }

    /// Restore every link.
    pub fn heal_all(&self) {
        self.blocked.clear();
    }

    /// Check whether `from` can currently reach `to`.
    pub fn is_linked(&self, from: &NodeId, to: &NodeId) -> bool {
        !self.blocked.contains(&(*from, *to)) && self.routes.contains_key(to)
    }

    fn deliver(&self, from: NodeId, to: &NodeId, message: GossipMessage) -> HostResult<()> {
        if self.blocked.contains(&(from, *to)) {
            tracing::trace!(from = %from, to = %to, kind = message.kind(), "Link blocked, dropping message");
            return Ok(());
        }
        let sender = self
            .routes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HostError::Transport(format!("Unknown peer {}", to)))?;

        match sender.try_send(Envelope::new(from, message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(HostError::Transport(format!("Inbox of {} is full", to)))
            }
            Err(TrySendError::Closed(_)) => {
                Err(HostError::Transport(format!("Inbox of {} is closed", to)))
            }
        }
    }
}

/// A replica's handle on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    node_id: NodeId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// The network this transport is attached to.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn unicast(&self, peer: &NodeId, message: GossipMessage) -> HostResult<()> {
        self.network.deliver(self.node_id, peer, message)
    }

    async fn broadcast(&self, message: GossipMessage) -> HostResult<()> {
        for peer in self.peers() {
            if let Err(e) = self.network.deliver(self.node_id, &peer, message.clone()) {
                tracing::debug!(peer = %peer, "Broadcast delivery failed: {}", e);
            }
        }
        Ok(())
    }
}

impl Membership for MemoryTransport {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    fn members(&self) -> Vec<NodeId> {
        self.network.nodes()
    }
}
