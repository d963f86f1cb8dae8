//! # hostmesh: replicated end-host location store
//!
//! hostmesh tracks where end-hosts (identified by MAC and VLAN) are attached
//! to the network, replicated across a cluster of controller instances with
//! no leader. Every replica accepts writes; replicas converge through two
//! paths:
//!
//! - **Broadcast**: each local change is gossiped to every peer immediately.
//! - **Anti-entropy**: every few seconds a replica exchanges a compact digest
//!   with one random peer and repairs whatever the broadcast path lost.
//!
//! Conflicts resolve by last-writer-wins over per-host logical timestamps.
//! Removals leave tombstones so that late copies of older updates cannot
//! bring a host back.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hostmesh::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let node_id = NodeId::new();
//!     let (transport, inbox) = network.join(node_id);
//!
//!     let store = HostStore::with_transport(
//!         HostStoreConfig::default(),
//!         Arc::new(HybridClock::new(node_id.origin())),
//!         Arc::new(transport),
//!     )?;
//!     store.start(inbox).await?;
//!
//!     let mac: MacAddress = "AA:BB:CC:DD:EE:01".parse()?;
//!     let host_id = HostId::new(mac, VlanId::None);
//!     let location = ConnectPoint::new(DeviceId::new("of:0000000000000001"), 1);
//!     let descriptor = HostDescriptor::new(mac, VlanId::None, location)
//!         .with_ip("10.0.0.1".parse()?);
//!
//!     let event = store
//!         .create_or_update_host(&ProviderId::new("arp"), &host_id, descriptor)
//!         .await?;
//!     println!("{:?}", event.map(|e| e.event_type));
//!
//!     store.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`types`]: host identities, descriptors, stored hosts
//! - [`clock`]: the clock oracle and its implementations
//! - [`registry`], [`tombstones`], [`index`]: the replicated state, guarded as
//!   one unit
//! - [`bindings`]: addresses configured on ports, local to each replica
//! - [`events`]: listeners and subscriptions
//! - [`anti_entropy`]: digests and reconciliation planning
//! - [`network`], [`transport`]: wire protocol and transports
//! - [`store`]: the replica itself

pub mod anti_entropy;
pub mod bindings;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod network;
pub mod registry;
pub mod store;
pub mod tombstones;
pub mod transport;
pub mod types;

// Public API exports
pub use bindings::{AddressBindings, InterfaceAddress, PortAddresses};
pub use clock::{ClockOracle, HybridClock, SequentialClock, Timestamp};
pub use config::HostStoreConfig;
pub use error::{HostError, HostResult};
pub use events::{EventNotifier, HostEvent, HostEventListener, HostEventType, ListenerId};
pub use network::{AntiEntropyDigest, Envelope, GossipMessage, NodeId, RemoveMsg, TcpTransport, UpdateMsg};
pub use store::{HostStore, StoreStats};
pub use transport::{Inbox, Membership, MemoryNetwork, MemoryTransport, StaticMembership, Transport};
pub use types::{
    Annotations, ConnectPoint, DeviceId, FragmentId, Host, HostDescriptor, HostId, MacAddress,
    PortNumber, ProviderId, VlanId,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        ConnectPoint, DeviceId, Host, HostDescriptor, HostError, HostEvent, HostEventType, HostId,
        HostResult, HostStore, HostStoreConfig, HybridClock, MacAddress, MemoryNetwork, NodeId,
        ProviderId, SequentialClock, TcpTransport, Timestamp, VlanId,
    };
}
