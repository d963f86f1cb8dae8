//! Location index: attachment point -> hosts attached there.
//!
//! The index only stores host ids. The host registry stays the single source
//! of truth, so the index can always be rebuilt from it.
use crate::types::{ConnectPoint, DeviceId, HostId};
use std::collections::{HashMap, HashSet};

/// Multimap from attachment point to host ids.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocationIndex {
    locations: HashMap<ConnectPoint, HashSet<HostId>>,
}

impl LocationIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `host_id` at `location`.
    pub fn insert(&mut self, location: ConnectPoint, host_id: HostId) {
        self.locations.entry(location).or_default().insert(host_id);
    }

    /// Remove `host_id` from `location`. Empty sets are dropped.
    pub fn remove(&mut self, location: &ConnectPoint, host_id: &HostId) -> bool {
        let Some(hosts) = self.locations.get_mut(location) else {
            return false;
        };
        let removed = hosts.remove(host_id);
        if hosts.is_empty() {
            self.locations.remove(location);
        }
        removed
    }

    /// Move `host_id` between attachment points.
    pub fn relocate(&mut self, from: &ConnectPoint, to: ConnectPoint, host_id: HostId) {
        if *from != to {
            self.remove(from, &host_id);
        }
        self.insert(to, host_id);
    }

    /// Hosts at `location`.
    pub fn hosts_at(&self, location: &ConnectPoint) -> Vec<HostId> {
        self.locations
            .get(location)
            .map(|hosts| hosts.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Hosts on any port of `device_id`.
    pub fn hosts_on_device(&self, device_id: &DeviceId) -> Vec<HostId> {
        self.locations
            .iter()
            .filter(|(location, _)| location.device_id == *device_id)
            .flat_map(|(_, hosts)| hosts.iter().copied())
            .collect()
    }

    /// Number of occupied attachment points.
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Total number of `(location, host)` entries.
    pub fn entry_count(&self) -> usize {
        self.locations.values().map(HashSet::len).sum()
    }

    /// Build an index from `(location, host)` pairs.
    pub fn rebuild<'a>(entries: impl IntoIterator<Item = (&'a ConnectPoint, HostId)>) -> Self {
        let mut index = Self::new();
        for (location, host_id) in entries {
            index.insert(location.clone(), host_id);
        }
        index
    }

    /// Number of entries that differ between two indexes.
    pub fn discrepancies(&self, other: &LocationIndex) -> usize {
        let missing = |a: &LocationIndex, b: &LocationIndex| -> usize {
            a.locations
                .iter()
                .map(|(location, hosts)| match b.locations.get(location) {
                    Some(theirs) => hosts.difference(theirs).count(),
                    None => hosts.len(),
                })
                .sum()
        };
        missing(self, other) + missing(other, self)
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.locations.clear();
    }
}
