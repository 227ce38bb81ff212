//! Routing-table ownership.
//!
//! The peer manager owns every contact container of a node (the k-bucket
//! table, the nearby list, the random list and the ring list) and the map of
//! open connections. All mutations go through its methods, each applied
//! atomically under one lock, and every membership change is published as a
//! [`PeerManagerEvent`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::contact::{ContactLike, ContactListChange, RandomContactList, SortedContactList};
use crate::core::{short_id, Metric, NodeId, PeerDescriptor, RingPosition};
use crate::events::{PeerManagerEvent, EVENT_CHANNEL_CAPACITY};
use crate::net::DhtNetwork;
use crate::remote::DhtNodeRemote;
use crate::routing::{BucketTouchOutcome, KBucketTable, PendingBucketUpdate};

#[derive(Clone, Debug)]
pub struct PeerManagerSettings {
    pub service_id: String,
    pub nodes_per_bucket: usize,
    pub max_neighbor_list_size: usize,
    pub max_random_contacts: usize,
    pub max_ring_contacts: usize,
    pub max_connections: usize,
    pub rpc_request_timeout: Duration,
}

struct PeerState<N: DhtNetwork> {
    buckets: KBucketTable<DhtNodeRemote<N>>,
    neighbors: SortedContactList<DhtNodeRemote<N>>,
    random: RandomContactList<DhtNodeRemote<N>>,
    ring: SortedContactList<DhtNodeRemote<N>>,
    connections: HashMap<NodeId, PeerDescriptor>,
}

pub struct PeerManager<N: DhtNetwork> {
    local: PeerDescriptor,
    network: Arc<N>,
    settings: PeerManagerSettings,
    state: Mutex<PeerState<N>>,
    events: broadcast::Sender<PeerManagerEvent>,
    stopped: AtomicBool,
}

fn descriptors<C: ContactLike>(contacts: Vec<C>) -> Vec<PeerDescriptor> {
    contacts
        .into_iter()
        .map(|c| c.descriptor().clone())
        .collect()
}

impl<N: DhtNetwork> PeerManager<N> {
    pub fn new(local: PeerDescriptor, network: Arc<N>, settings: PeerManagerSettings) -> Arc<Self> {
        let self_id = local.node_id;
        let state = PeerState {
            buckets: KBucketTable::new(self_id, settings.nodes_per_bucket),
            neighbors: SortedContactList::new(Metric::Xor(self_id), settings.max_neighbor_list_size)
                .with_owner(self_id),
            random: RandomContactList::new(self_id, settings.max_random_contacts),
            ring: SortedContactList::new(
                Metric::Ring(local.ring_position()),
                settings.max_ring_contacts,
            )
            .with_owner(self_id),
            connections: HashMap::new(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            local,
            network,
            settings,
            state: Mutex::new(state),
            events,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerManagerEvent> {
        self.events.subscribe()
    }

    pub fn local_id(&self) -> NodeId {
        self.local.node_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Remote-call handle for `peer` using this node's transport.
    pub fn remote(&self, peer: PeerDescriptor) -> DhtNodeRemote<N> {
        DhtNodeRemote::new(peer, self.network.clone(), self.settings.rpc_request_timeout)
    }

    fn emit_all(&self, events: Vec<PeerManagerEvent>) {
        if self.is_stopped() {
            return;
        }
        for event in events {
            let _ = self.events.send(event);
        }
    }

    /// Translate nearby-list changes into events and offer evicted contacts to
    /// the random list.
    fn neighbor_changes(
        state: &mut PeerState<N>,
        changes: Vec<ContactListChange<DhtNodeRemote<N>>>,
        events: &mut Vec<PeerManagerEvent>,
    ) {
        let mut evicted = Vec::new();
        for change in changes {
            let closest = descriptors(state.neighbors.all());
            match change {
                ContactListChange::Added(contact) => events.push(PeerManagerEvent::NewContact {
                    contact: contact.descriptor().clone(),
                    closest,
                }),
                ContactListChange::Removed(contact) => {
                    events.push(PeerManagerEvent::ContactRemoved {
                        contact: contact.descriptor().clone(),
                        closest,
                    });
                    evicted.push(contact);
                }
            }
        }
        for contact in evicted {
            let changes = state.random.add_contact(contact);
            Self::random_changes(changes, events);
        }
    }

    fn random_changes(
        changes: Vec<ContactListChange<DhtNodeRemote<N>>>,
        events: &mut Vec<PeerManagerEvent>,
    ) {
        for change in changes {
            events.push(match change {
                ContactListChange::Added(c) => {
                    PeerManagerEvent::NewRandomContact(c.descriptor().clone())
                }
                ContactListChange::Removed(c) => {
                    PeerManagerEvent::RandomContactRemoved(c.descriptor().clone())
                }
            });
        }
    }

    /// Offer a peer to the routing table.
    ///
    /// Unknown peers go into the k-bucket table and the nearby list; peers that
    /// are already known are offered to the random list instead. Self and
    /// duplicate adds are silent.
    pub fn add_contact(self: &Arc<Self>, peer: PeerDescriptor) {
        if self.is_stopped() || peer.node_id == self.local.node_id {
            return;
        }
        let id = peer.node_id;
        let remote = self.remote(peer.clone());
        let mut events = Vec::new();
        let (inserted, pending) = {
            let mut state = self.state.lock();
            let known = state.buckets.contains(&id) || state.neighbors.contains(&id);
            let outcome = state.buckets.touch(remote.clone());
            if known {
                let changes = state.random.add_contact(remote);
                Self::random_changes(changes, &mut events);
            } else {
                let changes = state.neighbors.add_contact(remote);
                Self::neighbor_changes(&mut state, changes, &mut events);
            }
            match outcome {
                BucketTouchOutcome::Inserted => (true, None),
                BucketTouchOutcome::Full(pending) => (false, Some(pending)),
                BucketTouchOutcome::Refreshed | BucketTouchOutcome::Ignored => (false, None),
            }
        };
        if inserted {
            trace!(node = %short_id(&self.local.node_id), peer = %short_id(&id), "bucket insert");
            self.network
                .weak_lock_connection(&peer, &self.settings.service_id);
        }
        self.emit_all(events);
        if let Some(pending) = pending {
            self.spawn_bucket_refresh(pending);
        }
    }

    pub fn add_contacts(self: &Arc<Self>, peers: impl IntoIterator<Item = PeerDescriptor>) {
        for peer in peers {
            self.add_contact(peer);
        }
    }

    /// Ping the oldest member of a full bucket and keep or replace it.
    fn spawn_bucket_refresh(self: &Arc<Self>, pending: PendingBucketUpdate<DhtNodeRemote<N>>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let alive = match pending.oldest.ping().await {
                Ok(()) => true,
                Err(err) => {
                    debug!(
                        peer = %short_id(&pending.oldest.node_id()),
                        error = %err,
                        "bucket oldest contact failed ping"
                    );
                    false
                }
            };
            if manager.is_stopped() {
                return;
            }
            let changes = manager.state.lock().buckets.apply_ping_result(pending, alive);
            for change in changes {
                match change {
                    ContactListChange::Added(c) => manager
                        .network
                        .weak_lock_connection(c.descriptor(), &manager.settings.service_id),
                    ContactListChange::Removed(c) => manager
                        .network
                        .weak_unlock_connection(c.descriptor(), &manager.settings.service_id),
                }
            }
        });
    }

    /// Offer a peer to the ring list.
    pub fn add_ring_contact(&self, peer: PeerDescriptor) {
        if self.is_stopped() || peer.node_id == self.local.node_id {
            return;
        }
        let remote = self.remote(peer);
        let changes = self.state.lock().ring.add_contact(remote);
        let events = changes
            .into_iter()
            .map(|change| match change {
                ContactListChange::Added(c) => {
                    PeerManagerEvent::NewRingContact(c.descriptor().clone())
                }
                ContactListChange::Removed(c) => {
                    PeerManagerEvent::RingContactRemoved(c.descriptor().clone())
                }
            })
            .collect();
        self.emit_all(events);
    }

    /// Remove a peer from every list. Returns true when it was known.
    pub fn remove_contact(&self, id: &NodeId) -> bool {
        let mut events = Vec::new();
        let (from_bucket, known) = {
            let mut state = self.state.lock();
            let from_bucket = state.buckets.remove(id);
            if let Some(contact) = state.neighbors.remove_contact(id) {
                events.push(PeerManagerEvent::ContactRemoved {
                    contact: contact.descriptor().clone(),
                    closest: descriptors(state.neighbors.all()),
                });
            }
            let from_random = state.random.remove_contact(id);
            if let Some(contact) = &from_random {
                events.push(PeerManagerEvent::RandomContactRemoved(
                    contact.descriptor().clone(),
                ));
            }
            let from_ring = state.ring.remove_contact(id);
            if let Some(contact) = &from_ring {
                events.push(PeerManagerEvent::RingContactRemoved(
                    contact.descriptor().clone(),
                ));
            }
            if from_bucket.is_some() && state.buckets.is_empty() {
                events.push(PeerManagerEvent::BucketEmpty);
            }
            let known = from_bucket.is_some()
                || !events.is_empty()
                || from_random.is_some()
                || from_ring.is_some();
            (from_bucket, known)
        };
        if let Some(contact) = from_bucket {
            self.network
                .weak_unlock_connection(contact.descriptor(), &self.settings.service_id);
        }
        if known {
            debug!(node = %short_id(&self.local.node_id), peer = %short_id(id), "contact removed");
        }
        self.emit_all(events);
        known
    }

    pub fn handle_connected(self: &Arc<Self>, peer: PeerDescriptor) {
        if peer.node_id == self.local.node_id {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.connections.len() >= self.settings.max_connections
                && !state.connections.contains_key(&peer.node_id)
            {
                debug!(
                    node = %short_id(&self.local.node_id),
                    peer = %short_id(&peer.node_id),
                    "connection limit reached; not tracking connection"
                );
            } else {
                state.connections.insert(peer.node_id, peer.clone());
            }
        }
        self.add_contact(peer);
    }

    /// A connection closed. A graceful close means the peer left on purpose,
    /// so it is dropped from every list.
    pub fn handle_disconnected(&self, peer: &PeerDescriptor, graceful: bool) {
        self.state.lock().connections.remove(&peer.node_id);
        if graceful {
            self.remove_contact(&peer.node_id);
        }
    }

    pub fn handle_peer_leaving(&self, id: &NodeId) {
        self.state.lock().connections.remove(id);
        self.remove_contact(id);
    }

    /// A peer answered a request.
    pub fn handle_peer_active(self: &Arc<Self>, peer: PeerDescriptor) {
        let id = peer.node_id;
        self.add_contact(peer);
        self.state.lock().neighbors.set_active(&id);
    }

    /// A peer failed to answer a request.
    pub fn handle_peer_unresponsive(&self, id: &NodeId) {
        self.remove_contact(id);
    }

    /// Up to `limit` known peers closest to `target`, drawn from the nearby
    /// list and the bucket table, skipping `excluded`.
    pub fn closest_neighbors_to(
        &self,
        target: &NodeId,
        limit: usize,
        excluded: &HashSet<NodeId>,
    ) -> Vec<PeerDescriptor> {
        let mut list = SortedContactList::new(Metric::Xor(*target), limit)
            .with_excluded(excluded.clone());
        let state = self.state.lock();
        for contact in state
            .neighbors
            .all()
            .into_iter()
            .chain(state.buckets.all())
        {
            list.add_contact(contact.descriptor().clone());
        }
        list.all()
    }

    /// Up to `limit` ring contacts closest to `target`, skipping `excluded`.
    pub fn closest_ring_contacts_to(
        &self,
        target: RingPosition,
        limit: usize,
        excluded: &HashSet<NodeId>,
    ) -> Vec<PeerDescriptor> {
        let mut list =
            SortedContactList::new(Metric::Ring(target), limit).with_excluded(excluded.clone());
        let state = self.state.lock();
        for contact in state.ring.all().into_iter().chain(state.neighbors.all()) {
            list.add_contact(contact.descriptor().clone());
        }
        list.all()
    }

    /// Up to `limit` members of the nearby list, closest first.
    pub fn closest_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        descriptors(self.state.lock().neighbors.closest(limit))
    }

    pub fn neighbors(&self) -> Vec<PeerDescriptor> {
        descriptors(self.state.lock().neighbors.all())
    }

    pub fn neighbor_count(&self) -> usize {
        self.state.lock().neighbors.len()
    }

    pub fn random_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        descriptors(self.state.lock().random.random(limit))
    }

    pub fn random_contact_count(&self) -> usize {
        self.state.lock().random.len()
    }

    pub fn ring_contacts(&self) -> Vec<PeerDescriptor> {
        descriptors(self.state.lock().ring.all())
    }

    pub fn bucket_contacts(&self) -> Vec<PeerDescriptor> {
        descriptors(self.state.lock().buckets.all())
    }

    pub fn bucket_size(&self) -> usize {
        self.state.lock().buckets.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn has_connection(&self, id: &NodeId) -> bool {
        self.state.lock().connections.contains_key(id)
    }

    pub fn is_known(&self, id: &NodeId) -> bool {
        let state = self.state.lock();
        state.buckets.contains(id) || state.neighbors.contains(id)
    }

    /// True when neither the nearby list nor the bucket table has a member.
    pub fn has_no_contacts(&self) -> bool {
        let state = self.state.lock();
        state.buckets.is_empty() && state.neighbors.is_empty()
    }

    /// Ping every candidate concurrently and remove the ones that fail.
    /// Returns the removed ids.
    pub async fn prune(&self, candidates: Vec<PeerDescriptor>) -> Vec<NodeId> {
        let probes = candidates.into_iter().map(|peer| {
            let remote = self.remote(peer);
            async move {
                let alive = remote.ping().await.is_ok();
                (remote.node_id(), alive)
            }
        });
        let mut removed = Vec::new();
        for (id, alive) in join_all(probes).await {
            if !alive && self.remove_contact(&id) {
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            debug!(
                node = %short_id(&self.local.node_id),
                removed = removed.len(),
                "pruned unresponsive contacts"
            );
        }
        removed
    }

    pub async fn prune_neighbors(&self) -> Vec<NodeId> {
        let candidates = self.neighbors();
        self.prune(candidates).await
    }

    pub async fn prune_ring(&self) -> Vec<NodeId> {
        let candidates = self.ring_contacts();
        self.prune(candidates).await
    }

    /// Stop emitting events, clear all state and send a leave notice to every
    /// bucket contact without waiting for the answers.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let contacts = {
            let mut state = self.state.lock();
            let contacts = state.buckets.clear();
            state.neighbors.clear();
            state.random.clear();
            state.ring.clear();
            state.connections.clear();
            contacts
        };
        for contact in contacts {
            self.network
                .weak_unlock_connection(contact.descriptor(), &self.settings.service_id);
            tokio::spawn(async move {
                if let Err(err) = contact.leave_notice().await {
                    trace!(peer = %short_id(&contact.node_id()), error = %err, "leave notice failed");
                }
            });
        }
    }
}
