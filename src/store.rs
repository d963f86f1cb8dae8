/// The gossip-replicated host store.
///
/// [`HostStore`] owns one replica's state (live hosts, tombstones and the
/// location index) and runs the background tasks that keep it in sync with
/// peers:
///
/// - a dispatcher that drains the inbox, one handler task per message
/// - a scheduler that runs one anti-entropy round per period and the
///   periodic location index self-check
///
/// # Design
///
/// Every mutation resolves against a snapshot taken under a read lock, does
/// its clock and merge work with no lock held, then commits under the write
/// lock only if the host's entry is unchanged since the snapshot. A lost race
/// simply resolves again against the winner. No lock is ever held across I/O.
///
/// Events are delivered after the commit, then local changes are broadcast.
/// Changes received from peers are applied and notified but never
/// re-broadcast; anti-entropy repairs whatever the broadcast path loses.
use crate::anti_entropy;
use crate::bindings::PortAddresses;
use crate::clock::{ClockOracle, Timestamp};
use crate::config::HostStoreConfig;
use crate::error::{HostError, HostResult};
use crate::events::{EventNotifier, HostEvent, HostEventListener, ListenerId};
use crate::network::{AntiEntropyDigest, Envelope, GossipMessage, NodeId, RemoveMsg, UpdateMsg};
use crate::registry::{Inventory, Resolution, resolve};
use crate::transport::{Inbox, Membership, Transport};
use crate::types::{ConnectPoint, DeviceId, Host, HostDescriptor, HostId, MacAddress, ProviderId, StoredHost, VlanId};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, interval_at};

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Local,
    Remote,
}

/// One replica of the host store.
#[derive(Clone)]
pub struct HostStore {
    /// This replica's identifier.
    node_id: NodeId,
    /// Store configuration.
    config: HostStoreConfig,
    /// Registry, tombstones and location index.
    inventory: Arc<RwLock<Inventory>>,
    /// Timestamp source.
    clock: Arc<dyn ClockOracle>,
    /// Outbound gossip.
    transport: Arc<dyn Transport>,
    /// Peer set.
    membership: Arc<dyn Membership>,
    /// Event fan-out.
    notifier: Arc<EventNotifier>,
    /// Shutdown signal sender.
    shutdown_tx: broadcast::Sender<()>,
    /// Flag indicating if the background tasks are running.
    running: Arc<tokio::sync::RwLock<bool>>,
    /// Background task handles.
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl HostStore {
    /// Create a store with separate transport and membership.
    pub fn new(
        config: HostStoreConfig,
        clock: Arc<dyn ClockOracle>,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
    ) -> HostResult<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            node_id: membership.local_node(),
            notifier: Arc::new(EventNotifier::with_capacity(config.event_channel_capacity)),
            config,
            inventory: Arc::new(RwLock::new(Inventory::new())),
            clock,
            transport,
            membership,
            shutdown_tx,
            running: Arc::new(tokio::sync::RwLock::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Create a store over a transport that also tracks membership.
    pub fn with_transport<T>(
        config: HostStoreConfig,
        clock: Arc<dyn ClockOracle>,
        transport: Arc<T>,
    ) -> HostResult<Self>
    where
        T: Transport + Membership + 'static,
    {
        let membership: Arc<dyn Membership> = transport.clone();
        Self::new(config, clock, transport, membership)
    }

    /// Get this replica's ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Get the configuration.
    pub fn config(&self) -> &HostStoreConfig {
        &self.config
    }

    /// Check if the background tasks are running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the dispatcher and the scheduler.
    ///
    /// `inbox` is the receiving side the transport delivers inbound messages
    /// to.
    pub async fn start(&self, inbox: Inbox) -> HostResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(HostError::Lifecycle("Store already running".to_string()));
            }
            *running = true;
        }

        let dispatcher = tokio::spawn(run_dispatcher(
            self.clone(),
            inbox,
            self.shutdown_tx.subscribe(),
        ));
        let scheduler = tokio::spawn(run_scheduler(self.clone(), self.shutdown_tx.subscribe()));
        self.tasks.lock().extend([dispatcher, scheduler]);

        tracing::info!(
            node = %self.node_id,
            period = ?self.config.anti_entropy_period,
            "Host store started"
        );
        Ok(())
    }

    /// Stop background work, drain in-flight handlers and clear all state.
    pub async fn stop(&self) -> HostResult<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        // The dispatcher bounds its own drain; allow it that long plus slack.
        let grace = self.config.shutdown_timeout + Duration::from_secs(1);
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                tracing::warn!(node = %self.node_id, "Background task did not stop in time, aborting");
                abort.abort();
            }
        }

        self.inventory.write().clear();
        self.clock.reset();
        tracing::info!(node = %self.node_id, "Host store stopped");
        Ok(())
    }

    // =========================================================================
    // Local mutations
    // =========================================================================

    /// Create or update a host as reported by `provider_id`.
    ///
    /// Returns the resulting event, or `None` when the update was suppressed
    /// by a tombstone, was outdated, or changed nothing.
    pub async fn create_or_update_host(
        &self,
        provider_id: &ProviderId,
        host_id: &HostId,
        descriptor: HostDescriptor,
    ) -> HostResult<Option<HostEvent>> {
        descriptor.validate(provider_id, host_id)?;

        let timestamp = self.clock.timestamp(host_id);
        let event = self.apply_update(provider_id, host_id, &descriptor, timestamp, Source::Local);

        if let Some(event) = &event {
            self.notifier.notify(event);
            self.broadcast(GossipMessage::Update(UpdateMsg {
                provider_id: provider_id.clone(),
                host_id: *host_id,
                descriptor,
                timestamp,
            }))
            .await;
        }
        Ok(event)
    }

    /// Remove a host.
    ///
    /// A tombstone is written even if the host is not live here, so a late
    /// copy of an older create cannot bring it back.
    pub async fn remove_host(&self, host_id: &HostId) -> HostResult<Option<HostEvent>> {
        host_id.vlan.validate()?;

        let timestamp = self.clock.timestamp(host_id);
        let event = self.apply_remove(host_id, timestamp);

        if let Some(event) = &event {
            self.notifier.notify(event);
            self.broadcast(GossipMessage::Remove(RemoveMsg {
                host_id: *host_id,
                timestamp,
            }))
            .await;
        }
        Ok(event)
    }

    // =========================================================================
    // Peer messages
    // =========================================================================

    /// Dispatch one inbound message.
    pub async fn handle_message(&self, envelope: Envelope) {
        tracing::trace!(
            node = %self.node_id,
            from = %envelope.sender,
            kind = envelope.message.kind(),
            "Handling gossip message"
        );
        match envelope.message {
            GossipMessage::Update(update) => {
                self.apply_remote_update(update);
            }
            GossipMessage::Remove(removal) => {
                self.apply_remote_remove(removal);
            }
            GossipMessage::Digest(digest) => self.handle_digest(digest).await,
        }
    }

    /// Apply an update received from a peer.
    pub fn apply_remote_update(&self, update: UpdateMsg) -> Option<HostEvent> {
        if let Err(e) = update.descriptor.validate(&update.provider_id, &update.host_id) {
            tracing::debug!(host = %update.host_id, "Dropping malformed peer update: {}", e);
            return None;
        }

        self.clock.observe(&update.host_id, update.timestamp);
        let event = self.apply_update(
            &update.provider_id,
            &update.host_id,
            &update.descriptor,
            update.timestamp,
            Source::Remote,
        );
        if let Some(event) = &event {
            self.notifier.notify(event);
        }
        event
    }

    /// Apply a removal received from a peer.
    pub fn apply_remote_remove(&self, removal: RemoveMsg) -> Option<HostEvent> {
        self.clock.observe(&removal.host_id, removal.timestamp);
        let event = self.apply_remove(&removal.host_id, removal.timestamp);
        if let Some(event) = &event {
            self.notifier.notify(event);
        }
        event
    }

    /// Reconcile with a peer's digest.
    pub async fn handle_digest(&self, digest: AntiEntropyDigest) {
        let peer = digest.sender;
        let plan = {
            let inventory = self.inventory.read();
            anti_entropy::plan(&inventory, &digest)
        };
        if plan.is_empty() {
            tracing::trace!(node = %self.node_id, peer = %peer, "Replicas agree");
            return;
        }

        tracing::debug!(
            node = %self.node_id,
            peer = %peer,
            push_updates = plan.push_updates.len(),
            push_removals = plan.push_removals.len(),
            local_removals = plan.local_removals.len(),
            reciprocate = plan.reciprocate,
            "Reconciling with peer"
        );

        for removal in plan.local_removals {
            self.apply_remote_remove(removal);
        }

        let mut outbound: Vec<GossipMessage> = plan
            .push_updates
            .into_iter()
            .map(GossipMessage::Update)
            .chain(plan.push_removals.into_iter().map(GossipMessage::Remove))
            .collect();
        if plan.reciprocate {
            outbound.push(GossipMessage::Digest(self.digest().into_reply()));
        }

        for message in outbound {
            let kind = message.kind();
            if let Err(e) = self.transport.unicast(&peer, message).await {
                // Peer unreachable; the next round will try again.
                tracing::debug!(node = %self.node_id, peer = %peer, kind, "Anti-entropy send failed: {}", e);
                break;
            }
        }
    }

    /// This replica's current digest.
    pub fn digest(&self) -> AntiEntropyDigest {
        anti_entropy::build_digest(self.node_id, &self.inventory.read())
    }

    /// Send our digest to one random peer. Returns the chosen peer, or `None`
    /// if this replica is alone.
    pub async fn run_anti_entropy_round(&self) -> Option<NodeId> {
        let peer = {
            let peers = self.membership.peers();
            *peers.choose(&mut rand::thread_rng())?
        };

        let digest = self.digest();
        tracing::trace!(
            node = %self.node_id,
            peer = %peer,
            fragments = digest.fragments.len(),
            tombstones = digest.tombstones.len(),
            "Sending anti-entropy digest"
        );
        if let Err(e) = self
            .transport
            .unicast(&peer, GossipMessage::Digest(digest))
            .await
        {
            tracing::debug!(node = %self.node_id, peer = %peer, "Anti-entropy digest not delivered: {}", e);
        }
        Some(peer)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Check the location index against the registry and rebuild it if they
    /// disagree. Returns the number of wrong entries.
    pub fn verify_location_index(&self) -> usize {
        let repaired = self.inventory.write().repair_index();
        if repaired > 0 {
            tracing::warn!(node = %self.node_id, repaired, "Location index was out of sync, rebuilt");
        }
        repaired
    }

    /// Drop tombstones strictly older than `cutoff`. Returns how many were
    /// dropped.
    ///
    /// A replica that still holds a live copy older than a purged tombstone
    /// can resurrect that host; only purge past a point every replica has
    /// certainly seen.
    pub fn purge_tombstones_before(&self, cutoff: Timestamp) -> usize {
        let purged = self.inventory.write().tombstones.purge_before(cutoff);
        tracing::info!(node = %self.node_id, purged, cutoff = %cutoff, "Purged tombstones");
        purged
    }

    // =========================================================================
    // Address bindings
    // =========================================================================

    /// Add an address binding to a port. Bindings are local configuration and
    /// are not gossiped.
    pub fn update_address_bindings(&self, binding: PortAddresses) -> HostResult<()> {
        binding.validate()?;
        let port = binding.connect_point.clone();
        if self.inventory.write().bindings.add(binding) {
            tracing::debug!(node = %self.node_id, port = %port, "Address binding added");
        }
        Ok(())
    }

    /// Remove one address binding. Returns false if it was not bound.
    pub fn remove_address_bindings(&self, binding: &PortAddresses) -> bool {
        self.inventory.write().bindings.remove(binding)
    }

    /// Remove every binding on a port. Returns how many were removed.
    pub fn clear_address_bindings(&self, connect_point: &ConnectPoint) -> usize {
        self.inventory.write().bindings.clear_port(connect_point)
    }

    /// All address bindings.
    pub fn get_address_bindings(&self) -> Vec<PortAddresses> {
        self.inventory.read().bindings.all()
    }

    /// Address bindings on one port.
    pub fn get_address_bindings_for_port(&self, connect_point: &ConnectPoint) -> Vec<PortAddresses> {
        self.inventory.read().bindings.for_port(connect_point)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Look up a host.
    pub fn get_host(&self, host_id: &HostId) -> Option<Host> {
        self.inventory
            .read()
            .registry
            .get(host_id)
            .map(|stored| stored.host().clone())
    }

    /// Timestamp of a live host's current state.
    pub fn host_timestamp(&self, host_id: &HostId) -> Option<Timestamp> {
        self.inventory
            .read()
            .registry
            .get(host_id)
            .map(StoredHost::timestamp)
    }

    /// Removal timestamp of a host, if a tombstone exists.
    pub fn tombstone(&self, host_id: &HostId) -> Option<Timestamp> {
        self.inventory.read().tombstones.get(host_id)
    }

    /// All live hosts.
    pub fn get_hosts(&self) -> Vec<Host> {
        self.collect_hosts(|_| true)
    }

    /// Hosts on a VLAN.
    pub fn get_hosts_by_vlan(&self, vlan: VlanId) -> Vec<Host> {
        self.collect_hosts(|host| host.vlan == vlan)
    }

    /// Hosts with a MAC address (one per VLAN at most).
    pub fn get_hosts_by_mac(&self, mac: MacAddress) -> Vec<Host> {
        self.collect_hosts(|host| host.mac == mac)
    }

    /// Hosts owning an IP address.
    pub fn get_hosts_by_ip(&self, ip: IpAddr) -> Vec<Host> {
        self.collect_hosts(|host| host.ip_addresses.contains(&ip))
    }

    /// Hosts attached at a connect point.
    pub fn get_connected_hosts(&self, location: &ConnectPoint) -> Vec<Host> {
        let inventory = self.inventory.read();
        inventory
            .locations
            .hosts_at(location)
            .iter()
            .filter_map(|id| inventory.registry.get(id))
            .map(|stored| stored.host().clone())
            .collect()
    }

    /// Hosts attached anywhere on a device.
    pub fn get_connected_hosts_by_device(&self, device_id: &DeviceId) -> Vec<Host> {
        let inventory = self.inventory.read();
        inventory
            .locations
            .hosts_on_device(device_id)
            .iter()
            .filter_map(|id| inventory.registry.get(id))
            .map(|stored| stored.host().clone())
            .collect()
    }

    /// Number of live hosts.
    pub fn host_count(&self) -> usize {
        self.inventory.read().registry.len()
    }

    /// Number of tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.inventory.read().tombstones.len()
    }

    /// Store statistics.
    pub async fn stats(&self) -> StoreStats {
        let (host_count, tombstone_count, location_count) = {
            let inventory = self.inventory.read();
            (
                inventory.registry.len(),
                inventory.tombstones.len(),
                inventory.locations.location_count(),
            )
        };
        StoreStats {
            node_id: self.node_id,
            host_count,
            tombstone_count,
            location_count,
            is_running: self.is_running().await,
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// The event notifier.
    pub fn events(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Register a synchronous event listener.
    pub fn add_listener(&self, listener: impl HostEventListener + 'static) -> ListenerId {
        self.notifier.add_listener(listener)
    }

    /// Unregister an event listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.notifier.remove_listener(id)
    }

    /// Receive all future events on a channel.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.notifier.subscribe()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn collect_hosts(&self, filter: impl Fn(&Host) -> bool) -> Vec<Host> {
        self.inventory
            .read()
            .registry
            .iter()
            .map(StoredHost::host)
            .filter(|&host| filter(host))
            .cloned()
            .collect()
    }

    /// Resolve and commit an update, retrying if the entry changed between
    /// snapshot and commit.
    fn apply_update(
        &self,
        provider_id: &ProviderId,
        host_id: &HostId,
        descriptor: &HostDescriptor,
        timestamp: Timestamp,
        source: Source,
    ) -> Option<HostEvent> {
        loop {
            let (live, removed_at) = self.inventory.read().snapshot(host_id);

            let (stored, event) =
                match resolve(live.as_ref(), removed_at, provider_id, host_id, descriptor, timestamp) {
                    Resolution::Suppressed { removed_at } => {
                        tracing::debug!(
                            host = %host_id,
                            timestamp = %timestamp,
                            removed_at = %removed_at,
                            "Update suppressed by tombstone"
                        );
                        return None;
                    }
                    Resolution::Outdated { current } => {
                        tracing::debug!(
                            host = %host_id,
                            timestamp = %timestamp,
                            current = %current,
                            "Dropping outdated update"
                        );
                        return None;
                    }
                    Resolution::Create(host) => (
                        StoredHost::new(host.clone(), timestamp),
                        Some(HostEvent::added(host)),
                    ),
                    Resolution::Update {
                        merged,
                        kind,
                        restamp,
                    } => {
                        // A local no-op leaves the stored version alone. A peer's
                        // newer version is adopted even when nothing observable
                        // changed, so digests agree afterwards.
                        if kind.is_none() && source == Source::Local {
                            tracing::trace!(host = %host_id, "Update changes nothing");
                            return None;
                        }
                        let stamped = if restamp {
                            self.clock.timestamp(host_id)
                        } else {
                            timestamp
                        };
                        let previous = live.as_ref().map(|stored| stored.host().clone());
                        let event = kind.map(|kind| HostEvent::new(kind, merged.clone(), previous));
                        (StoredHost::new(merged, stamped), event)
                    }
                };

            let mut inventory = self.inventory.write();
            if !inventory.unchanged_since(host_id, live.as_ref(), removed_at) {
                tracing::trace!(host = %host_id, "Lost update race, retrying");
                continue;
            }
            inventory.commit(stored);
            return event;
        }
    }

    /// Remove a host stamped `timestamp`, or record an advisory tombstone if
    /// it is not live.
    fn apply_remove(&self, host_id: &HostId, timestamp: Timestamp) -> Option<HostEvent> {
        let mut inventory = self.inventory.write();
        match inventory.registry.get(host_id).map(StoredHost::timestamp) {
            Some(current) if timestamp < current => {
                tracing::debug!(
                    host = %host_id,
                    timestamp = %timestamp,
                    current = %current,
                    "Dropping outdated removal"
                );
                None
            }
            Some(_) => inventory
                .remove(host_id, timestamp)
                .map(|removed| HostEvent::removed(removed.into_host())),
            None => {
                inventory.tombstones.record(*host_id, timestamp);
                None
            }
        }
    }

    async fn broadcast(&self, message: GossipMessage) {
        let kind = message.kind();
        if let Err(e) = self.transport.broadcast(message).await {
            tracing::debug!(node = %self.node_id, kind, "Broadcast failed: {}", e);
        }
    }
}

impl std::fmt::Debug for HostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStore")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .field("notifier", &self.notifier)
            .finish()
    }
}

/// Store statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// This replica's ID.
    pub node_id: NodeId,
    /// Number of live hosts.
    pub host_count: usize,
    /// Number of tombstones.
    pub tombstone_count: usize,
    /// Number of occupied attachment points.
    pub location_count: usize,
    /// Whether background tasks are running.
    pub is_running: bool,
}

/// Drain the inbox, one handler task per message.
async fn run_dispatcher(store: HostStore, mut inbox: Inbox, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            received = inbox.recv() => {
                match received {
                    Some(envelope) => {
                        let store = store.clone();
                        handlers.spawn(async move {
                            store.handle_message(envelope).await;
                        });
                    }
                    None => break,
                }
            }
            Some(result) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = result {
                    tracing::warn!(node = %store.node_id, "Message handler failed: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    let in_flight = handlers.len();
    let drained = tokio::time::timeout(store.config.shutdown_timeout, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(node = %store.node_id, in_flight, "Handlers still running at shutdown, aborting");
        handlers.abort_all();
    }
}

/// Periodic anti-entropy rounds and index self-checks.
async fn run_scheduler(store: HostStore, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut anti_entropy = interval_at(
        Instant::now() + store.config.anti_entropy_initial_delay,
        store.config.anti_entropy_period,
    );
    anti_entropy.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut index_check = store.config.index_check_period.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            _ = anti_entropy.tick() => {
                store.run_anti_entropy_round().await;
            }
            _ = tick_optional(&mut index_check) => {
                store.verify_location_index();
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

async fn tick_optional(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
