//! Host events and the notifier that delivers them.
//!
//! Every committed change to the host inventory produces at most one
//! [`HostEvent`]. Events reach consumers two ways:
//!
//! - **Listeners**: registered callbacks invoked synchronously after the
//!   mutation commits. A listener that returns an error or panics is logged
//!   and skipped; the mutation and the remaining listeners are unaffected.
//!   Listeners must be quick; anything slow belongs on a subscription.
//! - **Subscriptions**: a bounded broadcast channel. Producers never wait on
//!   it; a receiver that falls behind loses the oldest events
//!   (`RecvError::Lagged`).
//!
//! # Example
//!
//! ```ignore
//! let id = store.events().add_listener(|event: &HostEvent| {
//!     println!("{} {}", event.event_type, event.subject());
//!     Ok(())
//! });
//!
//! let mut rx = store.events().subscribe();
//! while let Ok(event) = rx.recv().await {
//!     // ...
//! }
//! ```
use crate::types::{Host, HostId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Default channel capacity for event subscriptions.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Kind of change to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostEventType {
    /// First observation of a host.
    Added,
    /// IPs or annotations changed, location did not.
    Updated,
    /// Attachment point changed.
    Moved,
    /// Host was removed.
    Removed,
}

impl fmt::Display for HostEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added => "HOST_ADDED",
            Self::Updated => "HOST_UPDATED",
            Self::Moved => "HOST_MOVED",
            Self::Removed => "HOST_REMOVED",
        };
        f.write_str(name)
    }
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    /// Type of change.
    pub event_type: HostEventType,
    /// The host after the change (the removed state for removals).
    pub host: Host,
    /// The host before the change, for updates and moves.
    pub previous_host: Option<Host>,
    /// When the event was produced.
    pub time: DateTime<Utc>,
}

impl HostEvent {
    /// Create an event.
    pub fn new(event_type: HostEventType, host: Host, previous_host: Option<Host>) -> Self {
        Self {
            event_type,
            host,
            previous_host,
            time: Utc::now(),
        }
    }

    /// Create an added event.
    pub fn added(host: Host) -> Self {
        Self::new(HostEventType::Added, host, None)
    }

    /// Create a removed event.
    pub fn removed(host: Host) -> Self {
        Self::new(HostEventType::Removed, host, None)
    }

    /// The host this event is about.
    pub fn subject(&self) -> &HostId {
        &self.host.id
    }
}

/// Receives host events synchronously.
pub trait HostEventListener: Send + Sync {
    /// Handle an event. Errors are logged by the notifier and go no further.
    fn event(&self, event: &HostEvent) -> anyhow::Result<()>;
}

impl<F> HostEventListener for F
where
    F: Fn(&HostEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn event(&self, event: &HostEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Information about a registered listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerInfo {
    /// The listener ID.
    pub id: ListenerId,
    /// When the listener was registered.
    pub created_at: DateTime<Utc>,
    /// Events handled successfully.
    pub events_delivered: u64,
    /// Events the listener failed on.
    pub failures: u64,
}

struct ListenerState {
    listener: Arc<dyn HostEventListener>,
    created_at: DateTime<Utc>,
    events_delivered: AtomicU64,
    failures: AtomicU64,
}

/// Fans events out to listeners and subscribers.
pub struct EventNotifier {
    listeners: DashMap<ListenerId, Arc<ListenerState>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<HostEvent>,
}

impl EventNotifier {
    /// Create a notifier with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a notifier with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Register a synchronous listener.
    pub fn add_listener(&self, listener: impl HostEventListener + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.insert(
            id,
            Arc::new(ListenerState {
                listener: Arc::new(listener),
                created_at: Utc::now(),
                events_delivered: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        );
        id
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Information about a listener.
    pub fn listener_info(&self, id: ListenerId) -> Option<ListenerInfo> {
        self.listeners.get(&id).map(|state| ListenerInfo {
            id,
            created_at: state.created_at,
            events_delivered: state.events_delivered.load(Ordering::Relaxed),
            failures: state.failures.load(Ordering::Relaxed),
        })
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Get a receiver for all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every listener and subscriber.
    pub fn notify(&self, event: &HostEvent) {
        // Snapshot first so no map shard lock is held while listener code runs.
        let listeners: Vec<(ListenerId, Arc<ListenerState>)> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (id, state) in listeners {
            match catch_unwind(AssertUnwindSafe(|| state.listener.event(event))) {
                Ok(Ok(())) => {
                    state.events_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    state.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(listener = %id, host = %event.subject(), "Host event listener failed: {:#}", e);
                }
                Err(_) => {
                    state.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(listener = %id, host = %event.subject(), "Host event listener panicked");
                }
            }
        }

        // No receivers is fine.
        let _ = self.sender.send(event.clone());
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("listeners", &self.listeners.len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
