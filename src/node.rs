//! The overlay node.
//!
//! [`DhtNode`] owns one instance of every component, wires them together in
//! [`DhtNode::start`] and exposes the client operations. Inbound requests are
//! served by the same node through [`crate::net::RpcHandler`] (see
//! `server.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::core::{short_id, DataEntry, Key, NodeId, PeerDescriptor};
use crate::discovery::{DiscoverySettings, PeerDiscovery, REJOIN_BACKOFF};
use crate::error::{DhtError, DhtResult};
use crate::events::{NodeEvent, PeerManagerEvent, EVENT_CHANNEL_CAPACITY};
use crate::net::{DhtNetwork, RpcHandler, TransportEvent};
use crate::peer_manager::{PeerManager, PeerManagerSettings};
use crate::protocol::RecursiveOperation;
use crate::recursive::{RecursiveOperationManager, RecursiveSettings, RECURSIVE_OPERATION_TIMEOUT};
use crate::router::{DeliveredMessage, Router};
use crate::store::LocalDataStore;
use crate::store_manager::{StoreManager, StoreSettings};

/// How the node got its transport.
///
/// An owned transport is closed when the node stops. A shared one belongs to
/// somebody else, typically because several overlays run over it.
pub enum Transport<N> {
    Owned(Arc<N>),
    Shared(Arc<N>),
}

impl<N> Transport<N> {
    pub fn network(&self) -> &Arc<N> {
        match self {
            Transport::Owned(network) | Transport::Shared(network) => network,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Transport::Owned(_))
    }
}

/// Point-in-time view of a node's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub service_id: String,
    pub joined: bool,
    pub neighbors: usize,
    pub random_contacts: usize,
    pub ring_contacts: usize,
    pub bucket_contacts: usize,
    pub connections: usize,
    pub stored_entries: usize,
    pub messages_routed: u64,
    pub messages_sent: u64,
    pub forwarding_table_size: usize,
}

pub(crate) struct Components<N: DhtNetwork> {
    pub(crate) peer_manager: Arc<PeerManager<N>>,
    pub(crate) discovery: Arc<PeerDiscovery<N>>,
    pub(crate) router: Arc<Router<N>>,
    pub(crate) recursive: Arc<RecursiveOperationManager<N>>,
    pub(crate) store_manager: Arc<StoreManager<N>>,
}

pub(crate) struct NodeInner<N: DhtNetwork> {
    pub(crate) config: DhtConfig,
    pub(crate) local: PeerDescriptor,
    transport: Transport<N>,
    components: OnceLock<Components<N>>,
    start_lock: Mutex<()>,
    cancel: CancellationToken,
    events: broadcast::Sender<NodeEvent>,
    messages: Mutex<Option<mpsc::Receiver<DeliveredMessage>>>,
    stopped: AtomicBool,
}

impl<N: DhtNetwork> NodeInner<N> {
    pub(crate) fn components(&self) -> DhtResult<&Components<N>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DhtError::Stopped(short_id(&self.local.node_id)));
        }
        self.components
            .get()
            .ok_or_else(|| DhtError::NotStarted(short_id(&self.local.node_id)))
    }
}

/// A node of one overlay.
pub struct DhtNode<N: DhtNetwork> {
    inner: Arc<NodeInner<N>>,
}

impl<N: DhtNetwork> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Validate `config` against the transport and build an unstarted node.
    pub fn new(config: DhtConfig, transport: Transport<N>) -> DhtResult<Self> {
        config.validate()?;
        let network = transport.network();
        let local = network.local_peer_descriptor();
        if let Some(configured) = config.parsed_node_id()? {
            if configured != local.node_id {
                return Err(DhtError::Config(format!(
                    "configured node id {} does not match transport id {}",
                    short_id(&configured),
                    short_id(&local.node_id)
                )));
            }
        }
        if network.service_id() != config.service_id {
            return Err(DhtError::Config(format!(
                "transport serves {:?} but the node is configured for {:?}",
                network.service_id(),
                config.service_id
            )));
        }
        if local.region != config.region {
            return Err(DhtError::Config(format!(
                "transport advertises region {} but the node is configured for region {}",
                local.region, config.region
            )));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                local,
                transport,
                components: OnceLock::new(),
                start_lock: Mutex::new(()),
                cancel: CancellationToken::new(),
                events,
                messages: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.local.node_id
    }

    pub fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.inner.local.clone()
    }

    pub fn service_id(&self) -> &str {
        &self.inner.config.service_id
    }

    pub fn is_started(&self) -> bool {
        self.inner.components.get().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Build and wire the components, register with the transport and spawn
    /// the background tasks. Calling it again is a no-op. Must run inside a
    /// tokio runtime.
    pub fn start(&self) -> DhtResult<()> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(DhtError::Stopped(short_id(&inner.local.node_id)));
        }
        let _guard = inner.start_lock.lock();
        if inner.components.get().is_some() {
            return Ok(());
        }
        let config = &inner.config;
        let network = inner.transport.network().clone();
        let local = inner.local.clone();

        let peer_manager = PeerManager::new(
            local.clone(),
            network.clone(),
            PeerManagerSettings {
                service_id: config.service_id.clone(),
                nodes_per_bucket: config.nodes_per_bucket,
                max_neighbor_list_size: config.max_neighbor_list_size,
                max_random_contacts: config.max_neighbor_list_size,
                max_ring_contacts: config.nodes_per_bucket * 2,
                max_connections: config.max_connections,
                rpc_request_timeout: config.rpc_request_timeout,
            },
        );
        let discovery = PeerDiscovery::new(
            local.clone(),
            DiscoverySettings {
                service_id: config.service_id.clone(),
                parallelism: config.join_parallelism,
                no_progress_limit: config.join_no_progress_limit,
                max_neighbor_list_size: config.max_neighbor_list_size,
                batch_size: config.peer_discovery_query_batch_size,
                join_timeout: config.join_timeout,
                neighbor_refresh_interval: config.neighbor_refresh_interval,
                rejoin_backoff: REJOIN_BACKOFF,
                entry_points: config.entry_points.clone(),
            },
            peer_manager.clone(),
            network.clone(),
            inner.cancel.child_token(),
            inner.events.clone(),
        );
        let (router, messages) = Router::new(local.clone(), peer_manager.clone());
        let store = Arc::new(LocalDataStore::new(config.store_max_ttl));
        let recursive = RecursiveOperationManager::new(
            local.clone(),
            RecursiveSettings {
                parallelism: config.join_parallelism,
                no_progress_limit: config.join_no_progress_limit,
                batch_size: config.peer_discovery_query_batch_size,
                max_candidates: config.max_neighbor_list_size,
                timeout: RECURSIVE_OPERATION_TIMEOUT,
                redundancy_factor: config.storage_redundancy_factor,
                entry_points: config.entry_points.clone(),
            },
            peer_manager.clone(),
            store.clone(),
            inner.cancel.child_token(),
        );
        let store_manager = StoreManager::new(
            local.clone(),
            StoreSettings {
                highest_ttl: config.store_highest_ttl,
                redundancy_factor: config.storage_redundancy_factor,
            },
            peer_manager.clone(),
            recursive.clone(),
            store,
        );

        let components = Components {
            peer_manager,
            discovery,
            router,
            recursive,
            store_manager,
        };
        spawn_peer_event_listener(&components, inner.events.clone(), inner.cancel.clone());
        spawn_transport_listener(&components, network.subscribe(), inner.cancel.clone());
        spawn_maintenance(&components, config, inner.cancel.clone());
        if inner.components.set(components).is_err() {
            return Ok(());
        }
        *inner.messages.lock() = Some(messages);

        let handler: Arc<dyn RpcHandler> = inner.clone();
        network.register_handler(Arc::downgrade(&handler));
        info!(
            node = %short_id(&local.node_id),
            service = %config.service_id,
            region = local.region,
            "node started"
        );
        Ok(())
    }

    /// Join through `entry_points`, or through the configured ones when the
    /// slice is empty.
    pub async fn join(&self, entry_points: &[PeerDescriptor]) -> DhtResult<()> {
        self.join_with_cancel(entry_points, &CancellationToken::new())
            .await
    }

    pub async fn join_with_cancel(
        &self,
        entry_points: &[PeerDescriptor],
        cancel: &CancellationToken,
    ) -> DhtResult<()> {
        let components = self.inner.components()?;
        let entry_points = if entry_points.is_empty() {
            self.inner.config.entry_points.as_slice()
        } else {
            entry_points
        };
        tokio::select! {
            result = components.discovery.join_dht(entry_points, cancel) => result,
            _ = self.inner.cancel.cancelled() => Err(DhtError::Stopped(short_id(&self.node_id()))),
        }
    }

    /// Populate the ring contact list.
    pub async fn join_ring(&self) -> DhtResult<()> {
        let components = self.inner.components()?;
        components.discovery.join_ring(&self.inner.cancel).await
    }

    pub fn is_joined(&self) -> bool {
        self.inner
            .components
            .get()
            .map(|c| c.discovery.is_joined())
            .unwrap_or(false)
    }

    /// Store `value` under `key` with this node as creator. Returns the nodes
    /// that accepted the write.
    ///
    /// While the node is still joining, the write is delegated to a
    /// configured entry point instead.
    pub async fn store(&self, key: Key, value: Vec<u8>) -> DhtResult<Vec<PeerDescriptor>> {
        let components = self.inner.components()?;
        if let Some(entry_point) = self.entry_point_while_joining(components) {
            return self.store_via_peer(key, value, &entry_point).await;
        }
        components
            .store_manager
            .store_data_to_dht(key, value, self.node_id())
            .await
    }

    /// Ask `peer` to store `value` on our behalf. The entry is created in the
    /// caller's name.
    pub async fn store_via_peer(
        &self,
        key: Key,
        value: Vec<u8>,
        peer: &PeerDescriptor,
    ) -> DhtResult<Vec<PeerDescriptor>> {
        let components = self.inner.components()?;
        components
            .peer_manager
            .remote(peer.clone())
            .external_store_data(key, value)
            .await
    }

    /// Every entry stored under `key`, newest copy per creator. Deleted
    /// entries come back with `deleted` set.
    pub async fn fetch(&self, key: Key) -> DhtResult<Vec<DataEntry>> {
        let components = self.inner.components()?;
        if let Some(entry_point) = self.entry_point_while_joining(components) {
            return self.fetch_via_peer(key, &entry_point).await;
        }
        components.store_manager.fetch_data_from_dht(key).await
    }

    /// Let `peer` run the fetch walk and return what it found.
    pub async fn fetch_via_peer(&self, key: Key, peer: &PeerDescriptor) -> DhtResult<Vec<DataEntry>> {
        let components = self.inner.components()?;
        components
            .peer_manager
            .remote(peer.clone())
            .external_fetch_data(key)
            .await
    }

    /// A random configured entry point, as long as the join has not finished.
    fn entry_point_while_joining(&self, components: &Components<N>) -> Option<PeerDescriptor> {
        if !components.discovery.is_join_ongoing() {
            return None;
        }
        self.inner
            .config
            .entry_points
            .iter()
            .filter(|ep| ep.node_id != self.inner.local.node_id)
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Tombstone this node's entries under `key`. Returns the nodes that
    /// confirmed.
    pub async fn delete(&self, key: Key, wait_for_completion: bool) -> DhtResult<Vec<PeerDescriptor>> {
        let components = self.inner.components()?;
        components
            .store_manager
            .delete_data_from_dht(key, wait_for_completion)
            .await
    }

    /// The live nodes closest to `key`.
    pub async fn find_closest_nodes(&self, key: Key) -> DhtResult<Vec<PeerDescriptor>> {
        let components = self.inner.components()?;
        let result = components
            .recursive
            .execute(key, RecursiveOperation::FindNode, None, true)
            .await?;
        Ok(result.closest_nodes)
    }

    /// Send `payload` to the node closest to `target`.
    ///
    /// Until the join finishes the configured entry points travel with the
    /// message, both as first hops and as a way back to this node.
    pub async fn send(&self, target: NodeId, payload: Vec<u8>) -> DhtResult<()> {
        let components = self.inner.components()?;
        let reachable_through = if components.discovery.is_join_ongoing() {
            self.inner.config.entry_points.clone()
        } else {
            Vec::new()
        };
        components
            .router
            .send(target, payload, reachable_through)
            .await?;
        Ok(())
    }

    /// Receiver of routed payloads delivered to this node. Handed out once.
    pub fn messages(&self) -> Option<mpsc::Receiver<DeliveredMessage>> {
        self.inner.messages.lock().take()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub fn neighbors(&self) -> Vec<PeerDescriptor> {
        self.inner
            .components
            .get()
            .map(|c| c.peer_manager.neighbors())
            .unwrap_or_default()
    }

    pub fn closest_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        self.inner
            .components
            .get()
            .map(|c| c.peer_manager.closest_contacts(limit))
            .unwrap_or_default()
    }

    pub fn random_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        self.inner
            .components
            .get()
            .map(|c| c.peer_manager.random_contacts(limit))
            .unwrap_or_default()
    }

    pub fn ring_contacts(&self) -> Vec<PeerDescriptor> {
        self.inner
            .components
            .get()
            .map(|c| c.peer_manager.ring_contacts())
            .unwrap_or_default()
    }

    /// Resolve once the node has at least one neighbour or connection.
    pub async fn wait_for_network_connectivity(&self) -> DhtResult<()> {
        let components = self.inner.components()?;
        let limit = self.inner.config.network_connectivity_timeout;
        let connected = || {
            components.peer_manager.neighbor_count() > 0
                || components.peer_manager.connection_count() > 0
        };
        let poll = async {
            let mut ticker = interval(Duration::from_millis(50));
            loop {
                ticker.tick().await;
                if connected() {
                    return;
                }
            }
        };
        tokio::time::timeout(limit, poll)
            .await
            .map_err(|_| DhtError::ConnectivityTimeout(limit))
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot {
            service_id: self.inner.config.service_id.clone(),
            joined: false,
            neighbors: 0,
            random_contacts: 0,
            ring_contacts: 0,
            bucket_contacts: 0,
            connections: 0,
            stored_entries: 0,
            messages_routed: 0,
            messages_sent: 0,
            forwarding_table_size: 0,
        };
        if let Some(c) = self.inner.components.get() {
            snapshot.joined = c.discovery.is_joined();
            snapshot.neighbors = c.peer_manager.neighbor_count();
            snapshot.random_contacts = c.peer_manager.random_contact_count();
            snapshot.ring_contacts = c.peer_manager.ring_contacts().len();
            snapshot.bucket_contacts = c.peer_manager.bucket_size();
            snapshot.connections = c.peer_manager.connection_count();
            snapshot.stored_entries = c.store_manager.local_store().len();
            snapshot.messages_routed = c.router.messages_routed();
            snapshot.messages_sent = c.router.messages_sent();
            snapshot.forwarding_table_size = c.router.forwarding_table_size();
        }
        snapshot
    }

    /// Hand local data to the closest contacts, leave the overlay and release
    /// the transport. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(components) = inner.components.get() {
            components.store_manager.hand_off_all().await;
            components.peer_manager.stop();
            components.discovery.stop();
            components.router.stop();
            components.store_manager.local_store().clear();
        }
        inner.cancel.cancel();
        let network = inner.transport.network();
        network.unregister_handler();
        if inner.transport.is_owned() {
            network.close().await;
        }
        inner.messages.lock().take();
        debug!(node = %short_id(&inner.local.node_id), service = %inner.config.service_id, "node stopped");
    }
}

/// Fan peer manager events out to the router, the store manager, discovery
/// and the node's subscribers.
fn spawn_peer_event_listener<N: DhtNetwork>(
    components: &Components<N>,
    node_events: broadcast::Sender<NodeEvent>,
    cancel: CancellationToken,
) {
    let mut events = components.peer_manager.subscribe();
    let router = components.router.clone();
    let store_manager = components.store_manager.clone();
    let discovery = components.discovery.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "peer event listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match &event {
                PeerManagerEvent::NewContact { contact, .. } => {
                    let store_manager = store_manager.clone();
                    let contact = contact.clone();
                    tokio::spawn(async move { store_manager.on_new_contact(contact).await });
                }
                PeerManagerEvent::ContactRemoved { contact, .. } => {
                    router.on_contact_removed(&contact.node_id);
                    let store_manager = store_manager.clone();
                    let contact = contact.clone();
                    tokio::spawn(async move { store_manager.on_contact_removed(contact).await });
                }
                PeerManagerEvent::BucketEmpty => discovery.on_contacts_lost(),
                _ => {}
            }
            if let Some(node_event) = event.to_node_event() {
                let _ = node_events.send(node_event);
            }
        }
    });
}

fn spawn_transport_listener<N: DhtNetwork>(
    components: &Components<N>,
    mut events: broadcast::Receiver<TransportEvent>,
    cancel: CancellationToken,
) {
    let peer_manager = components.peer_manager.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(TransportEvent::Connected(peer)) => peer_manager.handle_connected(peer),
                Ok(TransportEvent::Disconnected { peer, graceful }) => {
                    peer_manager.handle_disconnected(&peer, graceful)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Periodic liveness pings and the ttl sweep.
fn spawn_maintenance<N: DhtNetwork>(
    components: &Components<N>,
    config: &DhtConfig,
    cancel: CancellationToken,
) {
    if config.periodic_neighbor_ping || config.periodic_ring_ping {
        let peer_manager = components.peer_manager.clone();
        let neighbors = config.periodic_neighbor_ping;
        let ring = config.periodic_ring_ping;
        let period = config.ping_interval;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if neighbors {
                            peer_manager.prune_neighbors().await;
                        }
                        if ring {
                            peer_manager.prune_ring().await;
                        }
                    }
                }
            }
        });
    }

    let store_manager = components.store_manager.clone();
    let period = config.ttl_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    store_manager.sweep_expired();
                }
            }
        }
    });
}
