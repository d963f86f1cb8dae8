//! Anti-entropy reconciliation.
//!
//! A round sends this replica's [`AntiEntropyDigest`] to one random peer. The
//! receiver compares it with its own inventory and works out a
//! [`ReconciliationPlan`]:
//!
//! - live hosts the peer is missing or holds an older version of are pushed
//!   to it in full; the peer unions the pushed IP set into its own
//! - live hosts the peer has removed at or after our version are removed here
//! - tombstones the peer has not seen are pushed to it
//! - peer tombstones newer than anything we hold are recorded here
//! - if the peer knows something newer than we do, our own digest is sent
//!   back so the peer can push it
//!
//! Planning is pure; the store executes the plan outside the inventory lock.
use crate::clock::Timestamp;
use crate::network::{AntiEntropyDigest, NodeId, RemoveMsg, UpdateMsg};
use crate::registry::Inventory;
use crate::types::{HostId, ProviderId};
use std::collections::HashMap;

/// Summarize an inventory.
pub fn build_digest(sender: NodeId, inventory: &Inventory) -> AntiEntropyDigest {
    let mut digest = AntiEntropyDigest::new(sender);
    for stored in inventory.registry.iter() {
        digest
            .fragments
            .insert(stored.fragment_id(), stored.timestamp());
    }
    for tombstone in inventory.tombstones.iter() {
        digest
            .tombstones
            .insert(tombstone.host_id, tombstone.timestamp);
    }
    digest
}

/// What to do in response to a peer's digest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationPlan {
    /// Full-state updates to send to the peer.
    pub push_updates: Vec<UpdateMsg>,
    /// Removals to send to the peer.
    pub push_removals: Vec<RemoveMsg>,
    /// Removals to apply locally.
    pub local_removals: Vec<RemoveMsg>,
    /// Whether to answer with our own digest.
    pub reciprocate: bool,
}

impl ReconciliationPlan {
    /// Check if the replicas already agree.
    pub fn is_empty(&self) -> bool {
        self.push_updates.is_empty()
            && self.push_removals.is_empty()
            && self.local_removals.is_empty()
            && !self.reciprocate
    }
}

/// The peer's knowledge of one host.
#[derive(Debug, Default)]
struct PeerView<'a> {
    live: Option<(Timestamp, &'a ProviderId)>,
    removed_at: Option<Timestamp>,
}

fn peer_views(digest: &AntiEntropyDigest) -> HashMap<HostId, PeerView<'_>> {
    let mut views: HashMap<HostId, PeerView<'_>> = HashMap::new();
    for (fragment, timestamp) in &digest.fragments {
        let view = views.entry(fragment.host_id).or_default();
        let version = (*timestamp, &fragment.provider_id);
        if view.live.is_none_or(|current| version > current) {
            view.live = Some(version);
        }
    }
    for (host_id, timestamp) in &digest.tombstones {
        views.entry(*host_id).or_default().removed_at = Some(*timestamp);
    }
    views
}

/// Compare a peer's digest with local state.
pub fn plan(inventory: &Inventory, digest: &AntiEntropyDigest) -> ReconciliationPlan {
    let views = peer_views(digest);
    let unknown = PeerView::default();
    let mut plan = ReconciliationPlan::default();

    for stored in inventory.registry.iter() {
        let host = stored.host();
        let local_ts = stored.timestamp();
        let view = views.get(&host.id).unwrap_or(&unknown);

        if let Some(removed_at) = view.removed_at.filter(|removed| *removed >= local_ts) {
            plan.local_removals.push(RemoveMsg {
                host_id: host.id,
                timestamp: removed_at,
            });
            continue;
        }

        let peer_is_behind = view
            .live
            .is_none_or(|peer| peer < (local_ts, &host.provider_id));
        if peer_is_behind {
            plan.push_updates.push(UpdateMsg {
                provider_id: host.provider_id.clone(),
                host_id: host.id,
                descriptor: host.to_descriptor(),
                timestamp: local_ts,
            });
        }
    }

    for tombstone in inventory.tombstones.iter() {
        let view = views.get(&tombstone.host_id).unwrap_or(&unknown);
        let tomb_is_new = view
            .removed_at
            .is_none_or(|removed| removed < tombstone.timestamp);
        let live_is_older = view
            .live
            .is_none_or(|(ts, _)| ts <= tombstone.timestamp);
        if tomb_is_new && live_is_older {
            plan.push_removals.push(RemoveMsg {
                host_id: tombstone.host_id,
                timestamp: tombstone.timestamp,
            });
        }
    }

    for (host_id, view) in &views {
        let local = inventory.registry.get(host_id);
        let local_removed = inventory.tombstones.get(host_id);

        if let (None, Some(removed_at)) = (local, view.removed_at) {
            if local_removed.is_none_or(|ours| ours < removed_at) {
                plan.local_removals.push(RemoveMsg {
                    host_id: *host_id,
                    timestamp: removed_at,
                });
            }
        }

        if let Some((peer_ts, peer_provider)) = view.live {
            let newer_than_live =
                local.is_none_or(|stored| stored.is_superseded_by(peer_ts, peer_provider));
            let newer_than_tomb = local_removed.is_none_or(|removed| peer_ts > removed);
            if newer_than_live && newer_than_tomb {
                plan.reciprocate = true;
            }
        }
    }

    // Answering a reply could bounce digests back and forth forever.
    if digest.reply {
        plan.reciprocate = false;
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectPoint, DeviceId, FragmentId, Host, HostDescriptor, MacAddress, StoredHost, VlanId};

    fn host_id(n: u8) -> HostId {
        HostId::new(MacAddress::new([0, 0, 0, 0, 0, n]), VlanId::None)
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(n, 0, 0)
    }

    fn provider() -> ProviderId {
        ProviderId::new("arp")
    }

    fn stored(n: u8, at: u64) -> StoredHost {
        let id = host_id(n);
        let descr = HostDescriptor::new(id.mac, id.vlan, ConnectPoint::new(DeviceId::new("D1"), n as u64));
        StoredHost::new(Host::from_descriptor(provider(), id, &descr), ts(at))
    }

    fn peer_digest() -> AntiEntropyDigest {
        AntiEntropyDigest::new(NodeId::new())
    }

    #[test]
    fn test_digest_reflects_inventory() {
        let mut inventory = Inventory::new();
        inventory.commit(stored(1, 3));
        inventory.tombstones.record(host_id(2), ts(4));

        let digest = build_digest(NodeId::new(), &inventory);
        assert_eq!(
            digest.fragments.get(&FragmentId::new(host_id(1), provider())),
            Some(&ts(3))
        );
        assert_eq!(digest.tombstones.get(&host_id(2)), Some(&ts(4)));
        assert!(!digest.reply);
    }

    #[test]
    fn test_identical_state_needs_nothing() {
        let mut inventory = Inventory::new();
        inventory.commit(stored(1, 3));
        inventory.tombstones.record(host_id(2), ts(4));

        let digest = build_digest(NodeId::new(), &inventory);
        assert!(plan(&inventory, &digest).is_empty());
    }

    #[test]
    fn test_push_missing_and_older_hosts() {
        let mut inventory = Inventory::new();
        inventory.commit(stored(1, 3));
        inventory.commit(stored(2, 5));

        let mut digest = peer_digest();
        digest
            .fragments
            .insert(FragmentId::new(host_id(2), provider()), ts(4));

        let plan = plan(&inventory, &digest);
        assert_eq!(plan.push_updates.len(), 2);
        assert!(plan.push_updates.iter().all(|u| !u.descriptor.replace_ips));
        assert!(!plan.reciprocate);
    }

    #[test]
    fn test_newer_peer_tombstone_removes_locally() {
        let mut inventory = Inventory::new();
        inventory.commit(stored(1, 3));

        let mut digest = peer_digest();
        digest.tombstones.insert(host_id(1), ts(3));

        let plan = plan(&inventory, &digest);
        assert_eq!(
            plan.local_removals,
            vec![RemoveMsg {
                host_id: host_id(1),
                timestamp: ts(3)
            }]
        );
        assert!(plan.push_updates.is_empty());
    }

    #[test]
    fn test_older_peer_tombstone_gets_live_state() {
        let mut inventory = Inventory::new();
        inventory.commit(stored(1, 5));

        let mut digest = peer_digest();
        digest.tombstones.insert(host_id(1), ts(2));

        let plan = plan(&inventory, &digest);
        assert!(plan.local_removals.is_empty());
        assert_eq!(plan.push_updates.len(), 1);
    }

    #[test]
    fn test_push_tombstone_over_older_live_copy() {
        let mut inventory = Inventory::new();
        inventory.tombstones.record(host_id(1), ts(6));

        let mut digest = peer_digest();
        digest
            .fragments
            .insert(FragmentId::new(host_id(1), provider()), ts(5));

        let plan = plan(&inventory, &digest);
        assert_eq!(plan.push_removals.len(), 1);
        assert!(!plan.reciprocate);
    }

    #[test]
    fn test_unknown_peer_tombstone_recorded_locally() {
        let inventory = Inventory::new();
        let mut digest = peer_digest();
        digest.tombstones.insert(host_id(9), ts(2));

        let plan = plan(&inventory, &digest);
        assert_eq!(plan.local_removals.len(), 1);
        assert!(plan.push_removals.is_empty());
    }

    #[test]
    fn test_reciprocate_when_peer_knows_more() {
        let inventory = Inventory::new();
        let mut digest = peer_digest();
        digest
            .fragments
            .insert(FragmentId::new(host_id(1), provider()), ts(1));

        assert!(plan(&inventory, &digest).reciprocate);
        assert!(!plan(&inventory, &digest.into_reply()).reciprocate);
    }
}
