//! Shared helpers for integration tests.
#![allow(dead_code)]

use hostmesh::transport::{Inbox, MemoryNetwork};
use hostmesh::{
    ConnectPoint, DeviceId, HostDescriptor, HostId, HostStore, HostStoreConfig, MacAddress,
    NodeId, ProviderId, SequentialClock, Timestamp, VlanId,
};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// A replica driven by hand: its inbox is pumped explicitly instead of by the
/// dispatcher.
pub struct Replica {
    pub store: HostStore,
    pub inbox: Inbox,
}

impl Replica {
    pub fn node_id(&self) -> NodeId {
        self.store.node_id()
    }

    /// Handle everything currently queued. Returns the number of messages.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.inbox.try_recv() {
            self.store.handle_message(envelope).await;
            handled += 1;
        }
        handled
    }
}

/// Create `n` hand-driven replicas sharing one counter clock.
pub fn replicas(network: &MemoryNetwork, n: usize) -> Vec<Replica> {
    let clock = SequentialClock::new();
    (0..n)
        .map(|i| {
            let (transport, inbox) = network.join(NodeId::new());
            let store = HostStore::with_transport(
                HostStoreConfig::default(),
                Arc::new(clock.with_origin(i as u32 + 1)),
                Arc::new(transport),
            )
            .unwrap();
            Replica { store, inbox }
        })
        .collect()
}

/// Pump every replica until no messages are left in flight.
pub async fn settle(replicas: &mut [Replica]) {
    loop {
        let mut handled = 0;
        for replica in replicas.iter_mut() {
            handled += replica.pump().await;
        }
        if handled == 0 {
            return;
        }
    }
}

/// Store config with fast background tasks.
pub fn fast_config() -> HostStoreConfig {
    HostStoreConfig::new()
        .anti_entropy(Duration::from_millis(20), Duration::from_millis(40))
        .index_check_period(Some(Duration::from_millis(100)))
        .shutdown_timeout(Duration::from_secs(1))
}

/// Create `n` replicas with running background tasks.
pub async fn running_cluster(network: &MemoryNetwork, n: usize) -> Vec<HostStore> {
    let clock = SequentialClock::new();
    let mut stores = Vec::with_capacity(n);
    for i in 0..n {
        let (transport, inbox) = network.join(NodeId::new());
        let store = HostStore::with_transport(
            fast_config(),
            Arc::new(clock.with_origin(i as u32 + 1)),
            Arc::new(transport),
        )
        .unwrap();
        store.start(inbox).await.unwrap();
        stores.push(store);
    }
    stores
}

/// Poll `check` until it holds or `timeout` expires.
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Live hosts and tombstones of a replica, comparable across replicas.
pub type Snapshot = (
    BTreeMap<HostId, (ConnectPoint, Vec<IpAddr>, Timestamp)>,
    BTreeMap<HostId, Timestamp>,
);

pub fn snapshot(store: &HostStore) -> Snapshot {
    let live = store
        .get_hosts()
        .into_iter()
        .map(|host| {
            let ts = store.host_timestamp(&host.id).unwrap();
            (
                host.id,
                (host.location, host.ip_addresses.into_iter().collect(), ts),
            )
        })
        .collect();
    let digest = store.digest();
    let tombstones = digest.tombstones.into_iter().collect();
    (live, tombstones)
}

/// Live hosts of a replica without their timestamps. Merged states are
/// restamped by whichever replica merged them, so only the observable part is
/// comparable with a replica that applied the same updates itself.
pub type Observed = BTreeMap<HostId, (ConnectPoint, Vec<IpAddr>)>;

pub fn observed(store: &HostStore) -> Observed {
    store
        .get_hosts()
        .into_iter()
        .map(|host| (host.id, (host.location, host.ip_addresses.into_iter().collect())))
        .collect()
}

pub fn mac(n: u8) -> MacAddress {
    MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, n])
}

pub fn host_id(n: u8) -> HostId {
    HostId::new(mac(n), VlanId::None)
}

pub fn cp(device: &str, port: u64) -> ConnectPoint {
    ConnectPoint::new(DeviceId::new(device), port)
}

pub fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

pub fn provider() -> ProviderId {
    ProviderId::new("arp")
}

pub fn descr(n: u8, location: ConnectPoint) -> HostDescriptor {
    HostDescriptor::new(mac(n), VlanId::None, location)
}
