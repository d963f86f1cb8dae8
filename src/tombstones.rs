//! Tombstone registry: removal markers keyed by host.
//!
//! A tombstone at `T` suppresses every create or update of the same host
//! carrying a timestamp `<= T`, which is what stops a delayed message from
//! resurrecting a removed host. Tombstones are never expired automatically;
//! see [`TombstoneRegistry::purge_before`].
use crate::clock::Timestamp;
use crate::types::HostId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A recorded deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// The removed host.
    pub host_id: HostId,
    /// When it was removed.
    pub timestamp: Timestamp,
}

/// Map of removed hosts to their removal timestamp.
#[derive(Debug, Default)]
pub struct TombstoneRegistry {
    removed: HashMap<HostId, Timestamp>,
}

impl TombstoneRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removal timestamp of a host, if any.
    pub fn get(&self, host_id: &HostId) -> Option<Timestamp> {
        self.removed.get(host_id).copied()
    }

    /// Check whether an update stamped `timestamp` is suppressed.
    pub fn suppresses(&self, host_id: &HostId, timestamp: Timestamp) -> bool {
        self.get(host_id).is_some_and(|removed| removed >= timestamp)
    }

    /// Record a removal, keeping the newest timestamp. Returns `true` if the
    /// stored tombstone changed.
    pub fn record(&mut self, host_id: HostId, timestamp: Timestamp) -> bool {
        match self.removed.get_mut(&host_id) {
            Some(existing) if *existing >= timestamp => false,
            Some(existing) => {
                *existing = timestamp;
                true
            }
            None => {
                self.removed.insert(host_id, timestamp);
                true
            }
        }
    }

    /// Drop the tombstone of a host that came back to life.
    pub fn clear(&mut self, host_id: &HostId) -> Option<Timestamp> {
        self.removed.remove(host_id)
    }

    /// Remove every tombstone strictly older than `cutoff`. Returns how many
    /// were removed.
    pub fn purge_before(&mut self, cutoff: Timestamp) -> usize {
        let before = self.removed.len();
        self.removed.retain(|_, ts| *ts >= cutoff);
        before - self.removed.len()
    }

    /// Number of tombstones.
    pub fn len(&self) -> usize {
        self.removed.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }

    /// All tombstones.
    pub fn iter(&self) -> impl Iterator<Item = Tombstone> + '_ {
        self.removed.iter().map(|(host_id, timestamp)| Tombstone {
            host_id: *host_id,
            timestamp: *timestamp,
        })
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.removed.clear();
    }
}
