//! Multi-hop forwarding of messages toward the peer closest to a target id.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::core::{is_closer, short_id, NodeId, PeerDescriptor};
use crate::error::RouteError;
use crate::net::DhtNetwork;
use crate::peer_manager::PeerManager;
use crate::protocol::RoutedMessage;

/// Forward attempts that may fail before a message is dropped.
pub const MAX_FAILED_HOPS: usize = 2;

/// Request ids remembered for duplicate detection.
pub const DUPLICATE_DETECTOR_CAPACITY: usize = 10_000;

/// How long a delivered message's `reachable_through` peers are remembered
/// as the way back to its source.
pub const FORWARDING_ENTRY_TTL: Duration = Duration::from_secs(10);

const ROUTING_CANDIDATES: usize = 8;
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// A routed payload that ended at this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub source: PeerDescriptor,
    pub target: NodeId,
    pub payload: Vec<u8>,
    /// Number of nodes that forwarded the message.
    pub hops: usize,
}

pub struct Router<N: DhtNetwork> {
    local: PeerDescriptor,
    peer_manager: Arc<PeerManager<N>>,
    seen: Mutex<LruCache<u64, ()>>,
    /// Peers through which a recent message source can be reached, with the
    /// time the entry stops being used.
    forwarding: Mutex<HashMap<NodeId, (Vec<PeerDescriptor>, Instant)>>,
    inbound: mpsc::Sender<DeliveredMessage>,
    messages_routed: AtomicU64,
    messages_sent: AtomicU64,
    stopped: AtomicBool,
}

impl<N: DhtNetwork> Router<N> {
    pub fn new(
        local: PeerDescriptor,
        peer_manager: Arc<PeerManager<N>>,
    ) -> (Arc<Self>, mpsc::Receiver<DeliveredMessage>) {
        let (inbound, messages) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let capacity = NonZeroUsize::new(DUPLICATE_DETECTOR_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        let router = Arc::new(Self {
            local,
            peer_manager,
            seen: Mutex::new(LruCache::new(capacity)),
            forwarding: Mutex::new(HashMap::new()),
            inbound,
            messages_routed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });
        (router, messages)
    }

    pub fn messages_routed(&self) -> u64 {
        self.messages_routed.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn forwarding_table_size(&self) -> usize {
        let mut forwarding = self.forwarding.lock();
        let now = Instant::now();
        forwarding.retain(|_, (_, expires)| *expires > now);
        forwarding.len()
    }

    /// Unexpired forwarding peers recorded for `target`.
    fn forwarding_peers(&self, target: &NodeId) -> Vec<PeerDescriptor> {
        let mut forwarding = self.forwarding.lock();
        match forwarding.get(target) {
            Some((via, expires)) if *expires > Instant::now() => via.clone(),
            Some(_) => {
                forwarding.remove(target);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Send a new message toward `target`.
    ///
    /// `fallback` peers are tried when the routing table has no contact
    /// closer to the target than this node, which is typical while joining.
    pub async fn send(
        &self,
        target: NodeId,
        payload: Vec<u8>,
        fallback: Vec<PeerDescriptor>,
    ) -> Result<(), RouteError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RouteError::Stopped);
        }
        let message = RoutedMessage {
            request_id: rand::random(),
            source: self.local.clone(),
            target,
            payload,
            routing_path: Vec::new(),
            reachable_through: fallback,
        };
        self.seen.lock().put(message.request_id, ());
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if target == self.local.node_id {
            self.deliver(message);
            return Ok(());
        }
        self.forward(message, true).await
    }

    /// Handle a message received from another node.
    pub async fn route_message(&self, message: RoutedMessage) -> Result<(), RouteError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RouteError::Stopped);
        }
        let duplicate = self.seen.lock().put(message.request_id, ()).is_some();
        if duplicate || message.routing_path.contains(&self.local.node_id) {
            trace!(
                node = %short_id(&self.local.node_id),
                request = message.request_id,
                "dropping duplicate routed message"
            );
            return Err(RouteError::Duplicate);
        }
        if message.target == self.local.node_id {
            self.deliver(message);
            return Ok(());
        }
        self.forward(message, false).await
    }

    /// Peers strictly closer to the target than this node, closest first,
    /// skipping the source and everything on the routing path.
    fn next_hops(&self, message: &RoutedMessage) -> Vec<PeerDescriptor> {
        let mut excluded: HashSet<NodeId> = message.routing_path.iter().copied().collect();
        excluded.insert(self.local.node_id);
        excluded.insert(message.source.node_id);
        self.peer_manager
            .closest_neighbors_to(&message.target, ROUTING_CANDIDATES, &excluded)
            .into_iter()
            .filter(|peer| is_closer(&peer.node_id, &self.local.node_id, &message.target))
            .collect()
    }

    async fn forward(&self, message: RoutedMessage, originated_here: bool) -> Result<(), RouteError> {
        let mut candidates = self.next_hops(&message);
        if originated_here {
            // A target that only recently reached us through other peers is
            // reached back through them first.
            let via = self.forwarding_peers(&message.target);
            if !via.is_empty() {
                candidates.retain(|peer| !via.iter().any(|v| v.node_id == peer.node_id));
                let mut ordered = via;
                ordered.append(&mut candidates);
                candidates = ordered;
            }
        }
        if candidates.is_empty() {
            if !originated_here {
                self.deliver(message);
                return Ok(());
            }
            candidates = message
                .reachable_through
                .iter()
                .filter(|peer| {
                    peer.node_id != self.local.node_id
                        && !message.routing_path.contains(&peer.node_id)
                })
                .cloned()
                .collect();
            if candidates.is_empty() {
                debug!(
                    node = %short_id(&self.local.node_id),
                    target = %short_id(&message.target),
                    "no route and no fallback peers"
                );
                return Err(RouteError::NoTargets);
            }
        }

        let mut forwarded = message;
        forwarded.routing_path.push(self.local.node_id);
        let mut failures = 0usize;
        for peer in candidates {
            if failures >= MAX_FAILED_HOPS {
                break;
            }
            let remote = self.peer_manager.remote(peer.clone());
            match remote.route_message(forwarded.clone()).await {
                Ok(None) => {
                    self.messages_routed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Ok(Some(err)) => {
                    trace!(peer = %peer.short_id(), error = %err, "next hop rejected message");
                    failures += 1;
                }
                Err(err) => {
                    debug!(peer = %peer.short_id(), error = %err, "forwarding failed");
                    failures += 1;
                }
            }
        }
        Err(RouteError::NoTargets)
    }

    fn deliver(&self, message: RoutedMessage) {
        let via: Vec<PeerDescriptor> = message
            .reachable_through
            .iter()
            .filter(|peer| peer.node_id != self.local.node_id)
            .cloned()
            .collect();
        if !via.is_empty() {
            let now = Instant::now();
            let mut forwarding = self.forwarding.lock();
            forwarding.retain(|_, (_, expires)| *expires > now);
            forwarding.insert(message.source.node_id, (via, now + FORWARDING_ENTRY_TTL));
        }
        let delivered = DeliveredMessage {
            source: message.source,
            target: message.target,
            payload: message.payload,
            hops: message.routing_path.len(),
        };
        if self.inbound.try_send(delivered).is_err() {
            warn!(
                node = %short_id(&self.local.node_id),
                "inbound message channel full or closed; dropping message"
            );
        }
    }

    /// Forget forwarding entries that involve a removed contact.
    pub fn on_contact_removed(&self, id: &NodeId) {
        let mut forwarding = self.forwarding.lock();
        forwarding.remove(id);
        forwarding.retain(|_, (via, _)| !via.iter().any(|peer| &peer.node_id == id));
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.seen.lock().clear();
        self.forwarding.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::net::{SimulatedNetwork, Simulator};
    use crate::peer_manager::PeerManagerSettings;

    fn router(local: PeerDescriptor) -> (Arc<Router<SimulatedNetwork>>, mpsc::Receiver<DeliveredMessage>) {
        let sim = Simulator::new();
        let network = Arc::new(SimulatedNetwork::new(&sim, local.clone(), "layer0"));
        let pm = PeerManager::new(
            local.clone(),
            network,
            PeerManagerSettings {
                service_id: "layer0".into(),
                nodes_per_bucket: 8,
                max_neighbor_list_size: 16,
                max_random_contacts: 8,
                max_ring_contacts: 8,
                max_connections: 16,
                rpc_request_timeout: Duration::from_millis(100),
            },
        );
        Router::new(local, pm)
    }

    fn message(target: NodeId, path: Vec<NodeId>) -> RoutedMessage {
        RoutedMessage {
            request_id: 42,
            source: PeerDescriptor::new([0xee; 32], 0),
            target,
            payload: b"hi".to_vec(),
            routing_path: path,
            reachable_through: Vec::new(),
        }
    }

    #[tokio::test]
    async fn delivers_messages_addressed_to_self() {
        let local = PeerDescriptor::new([1; 32], 0);
        let (router, mut inbox) = router(local.clone());
        router
            .route_message(message(local.node_id, vec![[0xee; 32]]))
            .await
            .expect("delivered");
        let delivered = inbox.recv().await.expect("message");
        assert_eq!(delivered.payload, b"hi".to_vec());
        assert_eq!(delivered.hops, 1);
    }

    #[tokio::test]
    async fn duplicates_are_rejected() {
        let local = PeerDescriptor::new([1; 32], 0);
        let (router, _inbox) = router(local.clone());
        router
            .route_message(message(local.node_id, Vec::new()))
            .await
            .expect("first copy");
        assert_eq!(
            router.route_message(message(local.node_id, Vec::new())).await,
            Err(RouteError::Duplicate)
        );
    }

    #[tokio::test]
    async fn message_whose_path_contains_self_is_a_loop() {
        let local = PeerDescriptor::new([1; 32], 0);
        let (router, _inbox) = router(local.clone());
        assert_eq!(
            router.route_message(message([9; 32], vec![local.node_id])).await,
            Err(RouteError::Duplicate)
        );
    }

    #[tokio::test]
    async fn closest_known_node_delivers_locally() {
        let local = PeerDescriptor::new([1; 32], 0);
        let (router, mut inbox) = router(local);
        router
            .route_message(message([3; 32], Vec::new()))
            .await
            .expect("delivered locally");
        assert_eq!(inbox.recv().await.expect("message").target, [3; 32]);
    }

    #[tokio::test]
    async fn send_without_route_or_fallback_fails() {
        let local = PeerDescriptor::new([1; 32], 0);
        let (router, _inbox) = router(local);
        assert_eq!(
            router.send([0x80; 32], b"x".to_vec(), Vec::new()).await,
            Err(RouteError::NoTargets)
        );
        assert_eq!(router.messages_sent(), 1);
        router.stop();
        assert_eq!(
            router.send([0x80; 32], b"x".to_vec(), Vec::new()).await,
            Err(RouteError::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn forwarding_entries_expire() {
        let local = PeerDescriptor::new([1; 32], 0);
        let (router, mut inbox) = router(local.clone());
        let mut incoming = message(local.node_id, Vec::new());
        incoming.reachable_through = vec![PeerDescriptor::new([7; 32], 0), local.clone()];
        router.route_message(incoming).await.expect("delivered");
        inbox.recv().await.expect("message");
        assert_eq!(router.forwarding_table_size(), 1);
        assert_eq!(router.forwarding_peers(&[0xee; 32]).len(), 1);

        tokio::time::advance(FORWARDING_ENTRY_TTL + Duration::from_millis(1)).await;
        assert!(router.forwarding_peers(&[0xee; 32]).is_empty());
        assert_eq!(router.forwarding_table_size(), 0);
    }

    #[tokio::test]
    async fn removed_contact_drops_forwarding_entries_through_it() {
        let local = PeerDescriptor::new([1; 32], 0);
        let (router, _inbox) = router(local.clone());
        let mut incoming = message(local.node_id, Vec::new());
        incoming.reachable_through = vec![PeerDescriptor::new([7; 32], 0)];
        router.route_message(incoming).await.expect("delivered");
        router.on_contact_removed(&[7; 32]);
        assert_eq!(router.forwarding_table_size(), 0);
    }
}
