//! Host registry and last-writer-wins conflict resolution.
//!
//! [`Inventory`] bundles the three pieces of replicated state (live hosts,
//! tombstones, location index) so they can sit behind one lock and change as
//! a unit. The replica-local port address bindings live alongside them. Resolution of an incoming update is a pure function of the current
//! entry, the tombstone, and the update itself: [`resolve`] computes what
//! should happen, and the store commits it with a compare-and-swap against
//! the state it resolved from.
use crate::bindings::AddressBindings;
use crate::clock::Timestamp;
use crate::events::HostEventType;
use crate::index::LocationIndex;
use crate::tombstones::TombstoneRegistry;
use crate::types::{Host, HostDescriptor, HostId, ProviderId, StoredHost};
use std::collections::HashMap;

/// Live hosts keyed by identity.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: HashMap<HostId, StoredHost>,
}

impl HostRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live host.
    pub fn get(&self, host_id: &HostId) -> Option<&StoredHost> {
        self.hosts.get(host_id)
    }

    /// Insert or replace an entry, returning the previous one.
    pub fn insert(&mut self, stored: StoredHost) -> Option<StoredHost> {
        self.hosts.insert(stored.host().id, stored)
    }

    /// Remove an entry.
    pub fn remove(&mut self, host_id: &HostId) -> Option<StoredHost> {
        self.hosts.remove(host_id)
    }

    /// Number of live hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Iterate over live entries.
    pub fn iter(&self) -> impl Iterator<Item = &StoredHost> {
        self.hosts.values()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.hosts.clear();
    }
}

/// Outcome of resolving an update against current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A tombstone at or after the update's timestamp exists.
    Suppressed {
        /// Removal timestamp that won.
        removed_at: Timestamp,
    },
    /// The live entry is at least as new as the update.
    Outdated {
        /// Timestamp of the live entry.
        current: Timestamp,
    },
    /// No live entry: the host is new.
    Create(Host),
    /// The update supersedes the live entry.
    Update {
        /// Result of merging the update into the live entry.
        merged: Host,
        /// Event to emit, `None` if the observable state is unchanged.
        kind: Option<HostEventType>,
        /// The merge folded in local information the update did not carry,
        /// so the stored timestamp must be advanced past the update's.
        restamp: bool,
    },
}

/// Resolve an update stamped `timestamp` against the current entry and
/// tombstone of its host.
pub fn resolve(
    current: Option<&StoredHost>,
    removed_at: Option<Timestamp>,
    provider_id: &ProviderId,
    host_id: &HostId,
    descr: &HostDescriptor,
    timestamp: Timestamp,
) -> Resolution {
    if let Some(removed_at) = removed_at.filter(|removed| *removed >= timestamp) {
        return Resolution::Suppressed { removed_at };
    }

    let Some(current) = current else {
        return Resolution::Create(Host::from_descriptor(provider_id.clone(), *host_id, descr));
    };

    if !current.is_superseded_by(timestamp, provider_id) {
        return Resolution::Outdated {
            current: current.timestamp(),
        };
    }

    let (merged, restamp) = merge(current.host(), provider_id, descr);
    let kind = classify(current.host(), &merged);
    Resolution::Update {
        merged,
        kind,
        restamp,
    }
}

/// Merge a descriptor into an existing host.
///
/// Location is replaced. IPs are unioned unless the descriptor asks for
/// replacement. Annotations merge key-wise with the descriptor winning.
/// The returned flag is set when the result differs from the raw descriptor.
pub fn merge(existing: &Host, provider_id: &ProviderId, descr: &HostDescriptor) -> (Host, bool) {
    let ip_addresses = if descr.replace_ips {
        descr.ip_addresses.clone()
    } else {
        existing
            .ip_addresses
            .union(&descr.ip_addresses)
            .copied()
            .collect()
    };
    let annotations = existing.annotations.merge(&descr.annotations);

    let differs = ip_addresses != descr.ip_addresses || annotations != descr.annotations;
    let merged = Host {
        provider_id: provider_id.clone(),
        id: existing.id,
        mac: existing.mac,
        vlan: existing.vlan,
        location: descr.location.clone(),
        ip_addresses,
        annotations,
    };
    (merged, differs)
}

/// Event type for a transition between two states of the same host.
pub fn classify(previous: &Host, next: &Host) -> Option<HostEventType> {
    if previous.location != next.location {
        Some(HostEventType::Moved)
    } else if !previous.same_state(next) {
        Some(HostEventType::Updated)
    } else {
        None
    }
}

/// Registry, tombstones and location index, mutated together.
#[derive(Debug, Default)]
pub struct Inventory {
    /// Live hosts.
    pub registry: HostRegistry,
    /// Removal markers.
    pub tombstones: TombstoneRegistry,
    /// Attachment point index.
    pub locations: LocationIndex,
    /// Addresses configured on ports.
    pub bindings: AddressBindings,
}

impl Inventory {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// The `(live entry, tombstone)` pair an update of `host_id` resolves
    /// against.
    pub fn snapshot(&self, host_id: &HostId) -> (Option<StoredHost>, Option<Timestamp>) {
        (
            self.registry.get(host_id).cloned(),
            self.tombstones.get(host_id),
        )
    }

    /// Check that the state of `host_id` is still what it was when
    /// `snapshot` was taken.
    pub fn unchanged_since(
        &self,
        host_id: &HostId,
        live: Option<&StoredHost>,
        removed_at: Option<Timestamp>,
    ) -> bool {
        self.registry.get(host_id) == live && self.tombstones.get(host_id) == removed_at
    }

    /// Store a host, moving its index entry and clearing any older tombstone.
    pub fn commit(&mut self, stored: StoredHost) {
        let host_id = stored.host().id;
        let location = stored.host().location.clone();
        if self
            .tombstones
            .get(&host_id)
            .is_some_and(|removed| removed < stored.timestamp())
        {
            self.tombstones.clear(&host_id);
        }
        match self.registry.insert(stored) {
            Some(previous) => self
                .locations
                .relocate(&previous.host().location, location, host_id),
            None => self.locations.insert(location, host_id),
        }
    }

    /// Remove a live host and record its tombstone.
    pub fn remove(&mut self, host_id: &HostId, timestamp: Timestamp) -> Option<StoredHost> {
        let removed = self.registry.remove(host_id)?;
        self.locations.remove(&removed.host().location, host_id);
        self.tombstones.record(*host_id, timestamp);
        Some(removed)
    }

    /// Rebuild the location index if it disagrees with the registry. Returns
    /// the number of entries that were wrong.
    pub fn repair_index(&mut self) -> usize {
        let expected = LocationIndex::rebuild(
            self.registry
                .iter()
                .map(|stored| (&stored.host().location, stored.host().id)),
        );
        let wrong = self.locations.discrepancies(&expected);
        if wrong > 0 {
            self.locations = expected;
        }
        wrong
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.tombstones.reset();
        self.locations.clear();
        self.bindings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectPoint, DeviceId, MacAddress, VlanId};
    use std::net::{IpAddr, Ipv4Addr};

    fn mac() -> MacAddress {
        MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01])
    }

    fn host_id() -> HostId {
        HostId::new(mac(), VlanId::None)
    }

    fn cp(device: &str, port: u64) -> ConnectPoint {
        ConnectPoint::new(DeviceId::new(device), port)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(n, 0, 0)
    }

    fn provider() -> ProviderId {
        ProviderId::new("arp")
    }

    fn descr(location: ConnectPoint) -> HostDescriptor {
        HostDescriptor::new(mac(), VlanId::None, location)
    }

    fn stored(location: ConnectPoint, ips: &[u8], at: u64) -> StoredHost {
        let d = descr(location).with_ips(ips.iter().map(|n| ip(*n)));
        StoredHost::new(Host::from_descriptor(provider(), host_id(), &d), ts(at))
    }

    #[test]
    fn test_resolve_create() {
        let d = descr(cp("D1", 1)).with_ip(ip(1));
        match resolve(None, None, &provider(), &host_id(), &d, ts(1)) {
            Resolution::Create(host) => {
                assert_eq!(host.location, cp("D1", 1));
                assert!(host.ip_addresses.contains(&ip(1)));
            }
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_tombstone_suppresses_older_and_equal() {
        let d = descr(cp("D1", 1));
        assert_eq!(
            resolve(None, Some(ts(5)), &provider(), &host_id(), &d, ts(5)),
            Resolution::Suppressed { removed_at: ts(5) }
        );
        assert!(matches!(
            resolve(None, Some(ts(5)), &provider(), &host_id(), &d, ts(6)),
            Resolution::Create(_)
        ));
    }

    #[test]
    fn test_resolve_outdated() {
        let current = stored(cp("D1", 1), &[1], 5);
        let d = descr(cp("D2", 1));
        assert_eq!(
            resolve(Some(&current), None, &provider(), &host_id(), &d, ts(4)),
            Resolution::Outdated { current: ts(5) }
        );
        // Identical version is a duplicate delivery.
        assert_eq!(
            resolve(Some(&current), None, &provider(), &host_id(), &d, ts(5)),
            Resolution::Outdated { current: ts(5) }
        );
    }

    #[test]
    fn test_resolve_moved() {
        let current = stored(cp("D1", 1), &[1], 1);
        let d = descr(cp("D2", 3)).with_ip(ip(1));
        match resolve(Some(&current), None, &provider(), &host_id(), &d, ts(2)) {
            Resolution::Update {
                merged,
                kind,
                restamp,
            } => {
                assert_eq!(kind, Some(HostEventType::Moved));
                assert_eq!(merged.location, cp("D2", 3));
                assert!(!restamp);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_ip_only_change_is_update_with_restamp() {
        let current = stored(cp("D1", 1), &[1], 1);
        let d = descr(cp("D1", 1)).with_ip(ip(2));
        match resolve(Some(&current), None, &provider(), &host_id(), &d, ts(2)) {
            Resolution::Update {
                merged,
                kind,
                restamp,
            } => {
                assert_eq!(kind, Some(HostEventType::Updated));
                assert_eq!(merged.ip_addresses.len(), 2);
                // The merge kept 10.0.0.1, which the descriptor lacked.
                assert!(restamp);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_identical_state_has_no_event() {
        let current = stored(cp("D1", 1), &[1], 1);
        let d = descr(cp("D1", 1)).with_ip(ip(1));
        match resolve(Some(&current), None, &provider(), &host_id(), &d, ts(2)) {
            Resolution::Update { kind, restamp, .. } => {
                assert_eq!(kind, None);
                assert!(!restamp);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_replace_ips() {
        let current = stored(cp("D1", 1), &[1, 2], 1);
        let d = descr(cp("D1", 1)).with_ip(ip(3)).replacing_ips();
        let (merged, differs) = merge(current.host(), &provider(), &d);
        assert_eq!(merged.ip_addresses.len(), 1);
        assert!(merged.ip_addresses.contains(&ip(3)));
        assert!(!differs);
        assert_eq!(classify(current.host(), &merged), Some(HostEventType::Updated));
    }

    #[test]
    fn test_merge_annotations() {
        let d0 = descr(cp("D1", 1)).with_annotation("rack", "r1");
        let current = StoredHost::new(Host::from_descriptor(provider(), host_id(), &d0), ts(1));
        let d = descr(cp("D1", 1)).with_annotation("name", "web");
        let (merged, differs) = merge(current.host(), &provider(), &d);

        assert_eq!(merged.annotations.get("rack"), Some("r1"));
        assert_eq!(merged.annotations.get("name"), Some("web"));
        assert!(differs);
    }

    #[test]
    fn test_inventory_commit_keeps_index_in_lockstep() {
        let mut inventory = Inventory::new();
        inventory.commit(stored(cp("D1", 1), &[1], 1));
        assert_eq!(inventory.locations.hosts_at(&cp("D1", 1)), vec![host_id()]);

        inventory.commit(stored(cp("D2", 3), &[1], 2));
        assert!(inventory.locations.hosts_at(&cp("D1", 1)).is_empty());
        assert_eq!(inventory.locations.hosts_at(&cp("D2", 3)), vec![host_id()]);
        assert_eq!(inventory.locations.entry_count(), 1);

        let removed = inventory.remove(&host_id(), ts(3));
        assert!(removed.is_some());
        assert_eq!(inventory.locations.entry_count(), 0);
        assert_eq!(inventory.tombstones.get(&host_id()), Some(ts(3)));
    }

    #[test]
    fn test_commit_clears_older_tombstone() {
        let mut inventory = Inventory::new();
        inventory.tombstones.record(host_id(), ts(3));
        inventory.commit(stored(cp("D1", 1), &[1], 4));
        assert!(inventory.tombstones.get(&host_id()).is_none());
    }

    #[test]
    fn test_repair_index() {
        let mut inventory = Inventory::new();
        inventory.commit(stored(cp("D1", 1), &[1], 1));
        assert_eq!(inventory.repair_index(), 0);

        // Corrupt the index behind the registry's back.
        inventory.locations.insert(cp("D9", 9), host_id());
        inventory.locations.remove(&cp("D1", 1), &host_id());
        assert_eq!(inventory.repair_index(), 2);
        assert_eq!(inventory.locations.hosts_at(&cp("D1", 1)), vec![host_id()]);
        assert_eq!(inventory.repair_index(), 0);
    }
}
