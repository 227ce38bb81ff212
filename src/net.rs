//! Transport collaborators and the in-process simulated network.
//!
//! The overlay never touches sockets itself. It talks to peers through the
//! [`DhtNetwork`] trait and learns about connectivity changes from
//! [`TransportEvent`]s. [`SimulatedNetwork`] is a complete in-process
//! implementation: every call is JSON encoded through the [`crate::protocol`]
//! types, latency and failures can be injected per peer, and several logical
//! overlays (service ids) can share one simulated physical endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::trace;

use crate::core::{short_id, DataEntry, Key, NodeId, PeerDescriptor, RingPosition};
use crate::error::RouteError;
use crate::protocol::{
    RecursiveOperationRequest, RecursiveOperationResponse, RoutedMessage, Rpc, RpcRequest,
    RpcResponse, StoreDataRequest,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Connectivity changes reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(PeerDescriptor),
    Disconnected {
        peer: PeerDescriptor,
        /// True when the remote side closed the connection on purpose.
        graceful: bool,
    },
}

/// Read-only view of the transport's open connections.
pub trait ConnectionsView: Send + Sync {
    fn connections(&self) -> Vec<PeerDescriptor>;
    fn connection_count(&self) -> usize;
    fn has_connection(&self, node_id: &NodeId) -> bool;
}

/// Reference counts of the locks held on one connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockCounts {
    pub local: usize,
    pub remote: usize,
    pub weak: usize,
}

/// Keeps connections open while some component depends on them.
///
/// Locks are keyed by a lock id so independent users do not release each
/// other's locks. Weak locks keep a connection only as long as nothing else
/// needs the slot.
pub trait ConnectionLocker: Send + Sync {
    fn lock_connection(&self, peer: &PeerDescriptor, lock_id: &str);
    fn unlock_connection(&self, peer: &PeerDescriptor, lock_id: &str);
    fn weak_lock_connection(&self, peer: &PeerDescriptor, lock_id: &str);
    fn weak_unlock_connection(&self, peer: &PeerDescriptor, lock_id: &str);
    fn lock_counts(&self, node_id: &NodeId) -> LockCounts;
}

/// The served side of the protocol. A node registers itself with its
/// transport so inbound requests reach it.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_rpc(&self, from: PeerDescriptor, request: RpcRequest) -> RpcResponse;
}

/// Abstract RPC client surface used by the overlay.
///
/// Implementations are responsible for addressing, encoding and delivery.
/// Every method is a single request/response exchange with one peer; timeouts
/// are applied by the caller.
#[async_trait]
pub trait DhtNetwork: ConnectionsView + ConnectionLocker + Send + Sync + 'static {
    /// Descriptor the local node is reachable under.
    fn local_peer_descriptor(&self) -> PeerDescriptor;

    /// Logical overlay this transport view belongs to.
    fn service_id(&self) -> &str;

    async fn closest_peers(
        &self,
        to: &PeerDescriptor,
        target: NodeId,
        limit: usize,
    ) -> Result<Vec<PeerDescriptor>>;

    async fn closest_ring_peers(
        &self,
        to: &PeerDescriptor,
        target: RingPosition,
        limit: usize,
    ) -> Result<Vec<PeerDescriptor>>;

    async fn ping(&self, to: &PeerDescriptor) -> Result<()>;

    /// Fire-and-forget notice that the local node is leaving.
    async fn leave_notice(&self, to: &PeerDescriptor) -> Result<()>;

    async fn store_data(&self, to: &PeerDescriptor, request: StoreDataRequest) -> Result<()>;

    async fn replicate_data(&self, to: &PeerDescriptor, entry: DataEntry) -> Result<()>;

    async fn recursive_operation(
        &self,
        to: &PeerDescriptor,
        request: RecursiveOperationRequest,
    ) -> Result<RecursiveOperationResponse>;

    async fn route_message(
        &self,
        to: &PeerDescriptor,
        message: RoutedMessage,
    ) -> Result<Option<RouteError>>;

    async fn external_fetch_data(&self, to: &PeerDescriptor, key: Key) -> Result<Vec<DataEntry>>;

    async fn external_store_data(
        &self,
        to: &PeerDescriptor,
        key: Key,
        value: Vec<u8>,
    ) -> Result<Vec<PeerDescriptor>>;

    /// Route inbound requests for this service to `handler`.
    fn register_handler(&self, handler: Weak<dyn RpcHandler>);

    /// Stop routing inbound requests to the registered handler.
    fn unregister_handler(&self);

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Close the transport. Only the owner of a transport calls this.
    async fn close(&self);
}

// ============================================================================
// Simulated network
// ============================================================================

/// One recorded call, for assertions in tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRecord {
    pub service_id: String,
    pub from: NodeId,
    pub to: NodeId,
    pub operation: &'static str,
}

#[derive(Default)]
struct LockState {
    local: HashSet<String>,
    remote: usize,
    weak: HashSet<String>,
}

/// Per (service, node) connection bookkeeping.
struct ConnectionState {
    connections: Mutex<HashMap<NodeId, PeerDescriptor>>,
    locks: Mutex<HashMap<NodeId, LockState>>,
    events: broadcast::Sender<TransportEvent>,
}

impl ConnectionState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn mark_connected(&self, peer: &PeerDescriptor) {
        let inserted = self
            .connections
            .lock()
            .insert(peer.node_id, peer.clone())
            .is_none();
        if inserted {
            let _ = self.events.send(TransportEvent::Connected(peer.clone()));
        }
    }

    fn mark_disconnected(&self, peer: &PeerDescriptor, graceful: bool) {
        let removed = self.connections.lock().remove(&peer.node_id).is_some();
        self.locks.lock().remove(&peer.node_id);
        if removed {
            let _ = self.events.send(TransportEvent::Disconnected {
                peer: peer.clone(),
                graceful,
            });
        }
    }
}

struct Endpoint {
    handler: Option<Weak<dyn RpcHandler>>,
    state: Arc<ConnectionState>,
}

/// The shared medium all simulated endpoints are attached to.
#[derive(Default)]
pub struct Simulator {
    endpoints: RwLock<HashMap<(String, NodeId), Endpoint>>,
    latencies: Mutex<HashMap<NodeId, Duration>>,
    failures: Mutex<HashSet<NodeId>>,
    calls: Mutex<Vec<CallRecord>>,
}

impl Simulator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delay every call addressed to `node`.
    pub fn set_latency(&self, node: NodeId, latency: Duration) {
        self.latencies.lock().insert(node, latency);
    }

    /// Make `node` unreachable (or reachable again). Calls from a failed node
    /// fail as well.
    pub fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock();
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of endpoints that currently accept requests for `service_id`.
    pub fn live_endpoints(&self, service_id: &str) -> usize {
        self.endpoints
            .read()
            .iter()
            .filter(|((service, _), endpoint)| {
                service == service_id
                    && endpoint
                        .handler
                        .as_ref()
                        .map(|h| h.strong_count() > 0)
                        .unwrap_or(false)
            })
            .count()
    }

    fn attach(&self, service_id: &str, node_id: NodeId, state: Arc<ConnectionState>) {
        self.endpoints.write().insert(
            (service_id.to_string(), node_id),
            Endpoint {
                handler: None,
                state,
            },
        );
    }

    fn detach(&self, service_id: &str, node_id: &NodeId) {
        self.endpoints
            .write()
            .remove(&(service_id.to_string(), *node_id));
    }

    fn set_handler(&self, service_id: &str, node_id: &NodeId, handler: Option<Weak<dyn RpcHandler>>) {
        if let Some(endpoint) = self
            .endpoints
            .write()
            .get_mut(&(service_id.to_string(), *node_id))
        {
            endpoint.handler = handler;
        }
    }

    fn resolve(
        &self,
        service_id: &str,
        node_id: &NodeId,
    ) -> Option<(Arc<dyn RpcHandler>, Arc<ConnectionState>)> {
        let endpoints = self.endpoints.read();
        let endpoint = endpoints.get(&(service_id.to_string(), *node_id))?;
        let handler = endpoint.handler.as_ref()?.upgrade()?;
        Some((handler, endpoint.state.clone()))
    }

    fn state_of(&self, service_id: &str, node_id: &NodeId) -> Option<Arc<ConnectionState>> {
        self.endpoints
            .read()
            .get(&(service_id.to_string(), *node_id))
            .map(|endpoint| endpoint.state.clone())
    }

    fn is_failed(&self, node: &NodeId) -> bool {
        self.failures.lock().contains(node)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let latency = self.latencies.lock().get(node).copied();
        if let Some(delay) = latency {
            sleep(delay).await;
        }
    }

    fn record(&self, record: CallRecord) {
        self.calls.lock().push(record);
    }
}

/// A node's view of the simulated network for one service id.
#[derive(Clone)]
pub struct SimulatedNetwork {
    simulator: Arc<Simulator>,
    local: PeerDescriptor,
    service_id: String,
    state: Arc<ConnectionState>,
    closed: Arc<AtomicBool>,
}

impl SimulatedNetwork {
    pub fn new(simulator: &Arc<Simulator>, local: PeerDescriptor, service_id: &str) -> Self {
        let state = Arc::new(ConnectionState::new());
        simulator.attach(service_id, local.node_id, state.clone());
        Self {
            simulator: simulator.clone(),
            local,
            service_id: service_id.to_string(),
            state,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A second logical overlay over the same physical endpoint. Closing
    /// either view closes the shared endpoint.
    pub fn for_service(&self, service_id: &str) -> Self {
        let state = Arc::new(ConnectionState::new());
        self.simulator
            .attach(service_id, self.local.node_id, state.clone());
        Self {
            simulator: self.simulator.clone(),
            local: self.local.clone(),
            service_id: service_id.to_string(),
            state,
            closed: self.closed.clone(),
        }
    }

    pub fn simulator(&self) -> &Arc<Simulator> {
        &self.simulator
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call(&self, to: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse> {
        if self.is_closed() {
            bail!("transport closed");
        }
        let operation = request.name();
        self.simulator.record(CallRecord {
            service_id: self.service_id.clone(),
            from: self.local.node_id,
            to: to.node_id,
            operation,
        });
        if self.simulator.is_failed(&to.node_id) || self.simulator.is_failed(&self.local.node_id) {
            bail!("injected network failure");
        }
        self.simulator.maybe_sleep(&to.node_id).await;

        let (handler, remote_state) = self
            .simulator
            .resolve(&self.service_id, &to.node_id)
            .ok_or_else(|| anyhow!("peer {} not reachable", short_id(&to.node_id)))?;

        let envelope = Rpc {
            service_id: self.service_id.clone(),
            from: self.local.clone(),
            request,
        };
        let wire = serde_json::to_vec(&envelope)?;
        let Rpc { from, request, .. } = serde_json::from_slice(&wire)?;
        trace!(
            from = %short_id(&self.local.node_id),
            to = %short_id(&to.node_id),
            operation,
            bytes = wire.len(),
            "simulated rpc"
        );

        let response = handler.handle_rpc(from, request).await;
        let wire = serde_json::to_vec(&response)?;
        let response: RpcResponse = serde_json::from_slice(&wire)?;

        self.state.mark_connected(to);
        remote_state.mark_connected(&self.local);
        match response {
            RpcResponse::Error(reason) => Err(anyhow!("remote {operation} failed: {reason}")),
            other => Ok(other),
        }
    }
}

fn unexpected(operation: &str, response: RpcResponse) -> anyhow::Error {
    anyhow!("unexpected response to {operation}: {response:?}")
}

impl ConnectionsView for SimulatedNetwork {
    fn connections(&self) -> Vec<PeerDescriptor> {
        self.state.connections.lock().values().cloned().collect()
    }

    fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    fn has_connection(&self, node_id: &NodeId) -> bool {
        self.state.connections.lock().contains_key(node_id)
    }
}

impl ConnectionLocker for SimulatedNetwork {
    fn lock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        let fresh = self
            .state
            .locks
            .lock()
            .entry(peer.node_id)
            .or_default()
            .local
            .insert(lock_id.to_string());
        if fresh {
            if let Some(remote) = self.simulator.state_of(&self.service_id, &peer.node_id) {
                remote
                    .locks
                    .lock()
                    .entry(self.local.node_id)
                    .or_default()
                    .remote += 1;
            }
        }
    }

    fn unlock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        let released = self
            .state
            .locks
            .lock()
            .get_mut(&peer.node_id)
            .map(|locks| locks.local.remove(lock_id))
            .unwrap_or(false);
        if released {
            if let Some(remote) = self.simulator.state_of(&self.service_id, &peer.node_id) {
                if let Some(locks) = remote.locks.lock().get_mut(&self.local.node_id) {
                    locks.remote = locks.remote.saturating_sub(1);
                }
            }
        }
    }

    fn weak_lock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        self.state
            .locks
            .lock()
            .entry(peer.node_id)
            .or_default()
            .weak
            .insert(lock_id.to_string());
    }

    fn weak_unlock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        if let Some(locks) = self.state.locks.lock().get_mut(&peer.node_id) {
            locks.weak.remove(lock_id);
        }
    }

    fn lock_counts(&self, node_id: &NodeId) -> LockCounts {
        self.state
            .locks
            .lock()
            .get(node_id)
            .map(|locks| LockCounts {
                local: locks.local.len(),
                remote: locks.remote,
                weak: locks.weak.len(),
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DhtNetwork for SimulatedNetwork {
    fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.local.clone()
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn closest_peers(
        &self,
        to: &PeerDescriptor,
        target: NodeId,
        limit: usize,
    ) -> Result<Vec<PeerDescriptor>> {
        match self.call(to, RpcRequest::ClosestPeers { target, limit }).await? {
            RpcResponse::Peers(peers) => Ok(peers),
            other => Err(unexpected("closest_peers", other)),
        }
    }

    async fn closest_ring_peers(
        &self,
        to: &PeerDescriptor,
        target: RingPosition,
        limit: usize,
    ) -> Result<Vec<PeerDescriptor>> {
        match self
            .call(to, RpcRequest::ClosestRingPeers { target, limit })
            .await?
        {
            RpcResponse::Peers(peers) => Ok(peers),
            other => Err(unexpected("closest_ring_peers", other)),
        }
    }

    async fn ping(&self, to: &PeerDescriptor) -> Result<()> {
        match self.call(to, RpcRequest::Ping).await? {
            RpcResponse::Pong => Ok(()),
            other => Err(unexpected("ping", other)),
        }
    }

    async fn leave_notice(&self, to: &PeerDescriptor) -> Result<()> {
        self.call(to, RpcRequest::LeaveNotice).await.map(|_| ())
    }

    async fn store_data(&self, to: &PeerDescriptor, request: StoreDataRequest) -> Result<()> {
        match self.call(to, RpcRequest::StoreData(request)).await? {
            RpcResponse::Ack => Ok(()),
            other => Err(unexpected("store_data", other)),
        }
    }

    async fn replicate_data(&self, to: &PeerDescriptor, entry: DataEntry) -> Result<()> {
        self.call(to, RpcRequest::ReplicateData { entry })
            .await
            .map(|_| ())
    }

    async fn recursive_operation(
        &self,
        to: &PeerDescriptor,
        request: RecursiveOperationRequest,
    ) -> Result<RecursiveOperationResponse> {
        match self.call(to, RpcRequest::RecursiveOperation(request)).await? {
            RpcResponse::Recursive(response) => Ok(response),
            other => Err(unexpected("recursive_operation", other)),
        }
    }

    async fn route_message(
        &self,
        to: &PeerDescriptor,
        message: RoutedMessage,
    ) -> Result<Option<RouteError>> {
        match self.call(to, RpcRequest::RouteMessage(message)).await? {
            RpcResponse::Routed(outcome) => Ok(outcome),
            other => Err(unexpected("route_message", other)),
        }
    }

    async fn external_fetch_data(&self, to: &PeerDescriptor, key: Key) -> Result<Vec<DataEntry>> {
        match self.call(to, RpcRequest::ExternalFetchData { key }).await? {
            RpcResponse::Entries(entries) => Ok(entries),
            other => Err(unexpected("external_fetch_data", other)),
        }
    }

    async fn external_store_data(
        &self,
        to: &PeerDescriptor,
        key: Key,
        value: Vec<u8>,
    ) -> Result<Vec<PeerDescriptor>> {
        match self
            .call(to, RpcRequest::ExternalStoreData { key, value })
            .await?
        {
            RpcResponse::StoredAt(peers) => Ok(peers),
            other => Err(unexpected("external_store_data", other)),
        }
    }

    fn register_handler(&self, handler: Weak<dyn RpcHandler>) {
        self.simulator
            .set_handler(&self.service_id, &self.local.node_id, Some(handler));
    }

    fn unregister_handler(&self) {
        self.simulator
            .set_handler(&self.service_id, &self.local.node_id, None);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.state.events.subscribe()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers: Vec<PeerDescriptor> = self.state.connections.lock().values().cloned().collect();
        for peer in peers {
            if let Some(remote) = self.simulator.state_of(&self.service_id, &peer.node_id) {
                remote.mark_disconnected(&self.local, true);
            }
            self.state.mark_disconnected(&peer, true);
        }
        self.simulator.detach(&self.service_id, &self.local.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle_rpc(&self, _from: PeerDescriptor, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::Ping => RpcResponse::Pong,
                RpcRequest::ClosestPeers { target, .. } => {
                    RpcResponse::Peers(vec![PeerDescriptor::new(target, 0)])
                }
                _ => RpcResponse::Error("unsupported".into()),
            }
        }
    }

    fn descriptor(byte: u8) -> PeerDescriptor {
        PeerDescriptor::new([byte; 32], 0)
    }

    #[tokio::test]
    async fn calls_reach_registered_handler_and_connect_both_sides() {
        let sim = Simulator::new();
        let a = SimulatedNetwork::new(&sim, descriptor(1), "layer0");
        let b = SimulatedNetwork::new(&sim, descriptor(2), "layer0");
        let handler: Arc<dyn RpcHandler> = Arc::new(Echo);
        b.register_handler(Arc::downgrade(&handler));

        let mut events = b.subscribe();
        a.ping(&descriptor(2)).await.expect("ping should succeed");
        assert!(a.has_connection(&[2; 32]));
        assert!(b.has_connection(&[1; 32]));
        assert_eq!(
            events.recv().await.expect("connected event"),
            TransportEvent::Connected(descriptor(1))
        );

        let peers = a
            .closest_peers(&descriptor(2), [9; 32], 4)
            .await
            .expect("closest peers");
        assert_eq!(peers[0].node_id, [9; 32]);
    }

    #[tokio::test]
    async fn services_are_isolated() {
        let sim = Simulator::new();
        let a = SimulatedNetwork::new(&sim, descriptor(1), "layer0");
        let b0 = SimulatedNetwork::new(&sim, descriptor(2), "layer0");
        let b1 = b0.for_service("layer1");
        let handler: Arc<dyn RpcHandler> = Arc::new(Echo);
        b1.register_handler(Arc::downgrade(&handler));

        assert!(a.ping(&descriptor(2)).await.is_err());
        let a1 = a.for_service("layer1");
        assert!(a1.ping(&descriptor(2)).await.is_ok());
        assert_eq!(sim.live_endpoints("layer1"), 1);
        assert_eq!(sim.live_endpoints("layer0"), 0);
    }

    #[tokio::test]
    async fn injected_failure_and_remote_errors_surface() {
        let sim = Simulator::new();
        let a = SimulatedNetwork::new(&sim, descriptor(1), "layer0");
        let b = SimulatedNetwork::new(&sim, descriptor(2), "layer0");
        let handler: Arc<dyn RpcHandler> = Arc::new(Echo);
        b.register_handler(Arc::downgrade(&handler));

        assert!(a.leave_notice(&descriptor(2)).await.is_err());

        sim.set_failure([2; 32], true);
        assert!(a.ping(&descriptor(2)).await.is_err());
        sim.set_failure([2; 32], false);
        assert!(a.ping(&descriptor(2)).await.is_ok());
        assert_eq!(
            sim.calls().iter().filter(|c| c.operation == "ping").count(),
            2
        );
    }

    #[tokio::test]
    async fn close_disconnects_peers_gracefully() {
        let sim = Simulator::new();
        let a = SimulatedNetwork::new(&sim, descriptor(1), "layer0");
        let b = SimulatedNetwork::new(&sim, descriptor(2), "layer0");
        let handler: Arc<dyn RpcHandler> = Arc::new(Echo);
        a.register_handler(Arc::downgrade(&handler));
        b.register_handler(Arc::downgrade(&handler));
        a.ping(&descriptor(2)).await.expect("ping");

        let mut events = b.subscribe();
        a.close().await;
        assert!(a.is_closed());
        assert!(!b.has_connection(&[1; 32]));
        assert_eq!(
            events.recv().await.expect("disconnect event"),
            TransportEvent::Disconnected {
                peer: descriptor(1),
                graceful: true
            }
        );
        assert!(b.ping(&descriptor(1)).await.is_err());
    }

    #[test]
    fn lock_counts_track_both_ends() {
        let sim = Simulator::new();
        let a = SimulatedNetwork::new(&sim, descriptor(1), "layer0");
        let b = SimulatedNetwork::new(&sim, descriptor(2), "layer0");

        a.lock_connection(&descriptor(2), "join");
        a.lock_connection(&descriptor(2), "join");
        a.weak_lock_connection(&descriptor(2), "layer0");
        assert_eq!(
            a.lock_counts(&[2; 32]),
            LockCounts {
                local: 1,
                remote: 0,
                weak: 1
            }
        );
        assert_eq!(b.lock_counts(&[1; 32]).remote, 1);

        a.unlock_connection(&descriptor(2), "join");
        assert_eq!(b.lock_counts(&[1; 32]).remote, 0);
        assert_eq!(a.lock_counts(&[2; 32]).local, 0);
    }
}
