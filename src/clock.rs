//! Clock oracle: per-host logical timestamps.
//!
//! The store never reads wall-clock time directly. It asks a [`ClockOracle`]
//! for a timestamp whenever it stamps a mutation, and tells the oracle about
//! every timestamp it receives from a peer so that later local stamps order
//! after it.
//!
//! Two implementations are provided:
//!
//! - [`HybridClock`]: a hybrid logical clock (wall milliseconds, a logical
//!   counter, and the issuing replica's origin id). This is what a running
//!   node uses.
//! - [`SequentialClock`]: a plain counter, deterministic, handy in tests. Clones
//!   made with [`SequentialClock::with_origin`] share the counter, which models
//!   a perfectly synchronized cluster.
use crate::types::HostId;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A totally ordered logical timestamp. Greater means more recent.
///
/// Ordering is lexicographic over `(physical, logical, origin)`. The origin
/// component makes timestamps issued by different replicas distinct, so two
/// nodes can never produce equal stamps for conflicting updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    physical: u64,
    logical: u32,
    origin: u32,
}

impl Timestamp {
    /// The smallest timestamp.
    pub const ZERO: Timestamp = Timestamp {
        physical: 0,
        logical: 0,
        origin: 0,
    };

    /// Create a timestamp from its parts.
    pub const fn new(physical: u64, logical: u32, origin: u32) -> Self {
        Self {
            physical,
            logical,
            origin,
        }
    }

    /// Physical component (milliseconds for [`HybridClock`], a counter for
    /// [`SequentialClock`]).
    pub fn physical(&self) -> u64 {
        self.physical
    }

    /// Logical counter within one physical tick.
    pub fn logical(&self) -> u32 {
        self.logical
    }

    /// Id of the replica that issued this timestamp.
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// The next timestamp after `self`, issued by `origin`.
    fn successor(&self, origin: u32) -> Self {
        match self.logical.checked_add(1) {
            Some(logical) => Self::new(self.physical, logical, origin),
            None => Self::new(self.physical + 1, 0, origin),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.physical, self.logical, self.origin)
    }
}

/// Issues per-host timestamps.
///
/// Implementations must be monotonic per host: every call to `timestamp` for
/// a host returns a value greater than any value previously returned or
/// observed for it.
pub trait ClockOracle: Send + Sync {
    /// Issue a fresh timestamp for a mutation of `host_id`.
    fn timestamp(&self, host_id: &HostId) -> Timestamp;

    /// Record a timestamp received from a peer.
    fn observe(&self, _host_id: &HostId, _seen: Timestamp) {}

    /// Forget per-host state. Called when the owning store stops and drops
    /// its hosts.
    fn reset(&self) {}
}

/// Source of wall-clock milliseconds.
pub type WallClock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Hybrid logical clock with per-host state.
pub struct HybridClock {
    origin: u32,
    wall: WallClock,
    last: DashMap<HostId, Timestamp>,
}

impl HybridClock {
    /// Create a clock for the replica identified by `origin`.
    pub fn new(origin: u32) -> Self {
        Self::with_wall_clock(
            origin,
            Arc::new(|| Utc::now().timestamp_millis().max(0) as u64),
        )
    }

    /// Create a clock reading physical time from `wall`.
    pub fn with_wall_clock(origin: u32, wall: WallClock) -> Self {
        Self {
            origin,
            wall,
            last: DashMap::new(),
        }
    }

    /// Origin id stamped into every issued timestamp.
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Number of hosts with clock state.
    ///
    /// Grows by one per host ever stamped or observed and only shrinks on
    /// [`ClockOracle::reset`].
    pub fn tracked_hosts(&self) -> usize {
        self.last.len()
    }
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClock")
            .field("origin", &self.origin)
            .field("tracked_hosts", &self.last.len())
            .finish()
    }
}

impl ClockOracle for HybridClock {
    fn timestamp(&self, host_id: &HostId) -> Timestamp {
        let now = (self.wall)();
        let mut last = self.last.entry(*host_id).or_insert(Timestamp::ZERO);
        let next = if now > last.physical {
            Timestamp::new(now, 0, self.origin)
        } else {
            last.successor(self.origin)
        };
        *last = next;
        next
    }

    fn observe(&self, host_id: &HostId, seen: Timestamp) {
        let mut last = self.last.entry(*host_id).or_insert(Timestamp::ZERO);
        if seen > *last {
            *last = seen;
        }
    }

    fn reset(&self) {
        self.last.clear();
    }
}

/// Deterministic counter clock.
#[derive(Debug, Clone)]
pub struct SequentialClock {
    counter: Arc<AtomicU64>,
    origin: u32,
}

impl SequentialClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            origin: 0,
        }
    }

    /// A clock sharing this clock's counter but stamping a different origin.
    pub fn with_origin(&self, origin: u32) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            origin,
        }
    }

    /// The last issued counter value.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for SequentialClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockOracle for SequentialClock {
    fn timestamp(&self, _host_id: &HostId) -> Timestamp {
        let value = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Timestamp::new(value, 0, self.origin)
    }

    fn observe(&self, _host_id: &HostId, seen: Timestamp) {
        self.counter.fetch_max(seen.physical, Ordering::SeqCst);
    }
}
