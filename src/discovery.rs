//! Bootstrapping and keeping the routing table populated.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join, join_all};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{complement_id, short_id, Metric, NodeId, PeerDescriptor};
use crate::error::{DhtError, DhtResult};
use crate::events::NodeEvent;
use crate::lookup::{expand, HopReply, LookupOutcome, LookupSettings};
use crate::net::DhtNetwork;
use crate::peer_manager::PeerManager;

/// Delay between automatic rejoin attempts.
pub const REJOIN_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct DiscoverySettings {
    pub service_id: String,
    pub parallelism: usize,
    pub no_progress_limit: usize,
    pub max_neighbor_list_size: usize,
    pub batch_size: usize,
    pub join_timeout: Duration,
    pub neighbor_refresh_interval: Duration,
    pub rejoin_backoff: Duration,
    /// Entry points used for automatic rejoin. Empty means the application
    /// has to rejoin by hand.
    pub entry_points: Vec<PeerDescriptor>,
}

impl DiscoverySettings {
    fn lookup(&self) -> LookupSettings {
        LookupSettings {
            parallelism: self.parallelism,
            no_progress_limit: self.no_progress_limit,
            max_candidates: self.max_neighbor_list_size,
            timeout: self.join_timeout,
        }
    }
}

pub struct PeerDiscovery<N: DhtNetwork> {
    local: PeerDescriptor,
    settings: DiscoverySettings,
    peer_manager: Arc<PeerManager<N>>,
    network: Arc<N>,
    join_lock: Mutex<()>,
    join_called: AtomicBool,
    joining: AtomicBool,
    /// Entry points of the last join that reached at least one of them.
    joined_through: parking_lot::Mutex<Vec<PeerDescriptor>>,
    joined: AtomicBool,
    rejoining: AtomicBool,
    recovery_started: AtomicBool,
    cancel: CancellationToken,
    node_events: broadcast::Sender<NodeEvent>,
}

impl<N: DhtNetwork> PeerDiscovery<N> {
    pub fn new(
        local: PeerDescriptor,
        settings: DiscoverySettings,
        peer_manager: Arc<PeerManager<N>>,
        network: Arc<N>,
        cancel: CancellationToken,
        node_events: broadcast::Sender<NodeEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            settings,
            peer_manager,
            network,
            join_lock: Mutex::new(()),
            join_called: AtomicBool::new(false),
            joining: AtomicBool::new(false),
            joined_through: parking_lot::Mutex::new(Vec::new()),
            joined: AtomicBool::new(false),
            rejoining: AtomicBool::new(false),
            recovery_started: AtomicBool::new(false),
            cancel,
            node_events,
        })
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// True until the first join is attempted, and while a join runs.
    pub fn is_join_ongoing(&self) -> bool {
        !self.join_called.load(Ordering::SeqCst) || self.joining.load(Ordering::SeqCst)
    }

    pub fn is_rejoin_ongoing(&self) -> bool {
        self.rejoining.load(Ordering::SeqCst)
    }

    /// Join the overlay through `entry_points`.
    ///
    /// Idempotent: a node that already joined returns immediately, and a
    /// join running concurrently is waited for instead of repeated. Fails
    /// with [`DhtError::JoinFailed`] when no entry point answered.
    pub async fn join_dht(
        self: &Arc<Self>,
        entry_points: &[PeerDescriptor],
        cancel: &CancellationToken,
    ) -> DhtResult<()> {
        if self.is_joined() {
            return Ok(());
        }
        self.join_called.store(true, Ordering::SeqCst);
        let _guard = tokio::select! {
            guard = self.join_lock.lock() => guard,
            _ = cancel.cancelled() => return Err(DhtError::Cancelled),
        };
        if self.is_joined() {
            return Ok(());
        }
        self.joining.store(true, Ordering::SeqCst);
        let result = self.join_locked(entry_points, cancel).await;
        self.joining.store(false, Ordering::SeqCst);
        result
    }

    async fn join_locked(
        self: &Arc<Self>,
        entry_points: &[PeerDescriptor],
        cancel: &CancellationToken,
    ) -> DhtResult<()> {
        let others: Vec<PeerDescriptor> = entry_points
            .iter()
            .filter(|ep| ep.node_id != self.local.node_id)
            .cloned()
            .collect();
        if others.is_empty() {
            debug!(
                node = %short_id(&self.local.node_id),
                service = %self.settings.service_id,
                "no foreign entry points; acting as first node"
            );
            self.mark_joined();
            return Ok(());
        }

        debug!(
            node = %short_id(&self.local.node_id),
            service = %self.settings.service_id,
            entry_points = others.len(),
            "joining"
        );
        let attempts = join_all(
            others
                .iter()
                .map(|ep| self.join_through_entry_point(ep.clone(), cancel)),
        )
        .await;

        let mut reachable = false;
        for attempt in attempts {
            match attempt {
                Ok(answered) => reachable |= answered,
                Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                Err(err) => debug!(error = %err, "join through entry point failed"),
            }
        }
        if !reachable {
            return Err(DhtError::JoinFailed {
                service_id: self.settings.service_id.clone(),
                entry_points: others.len(),
            });
        }

        info!(
            node = %short_id(&self.local.node_id),
            service = %self.settings.service_id,
            neighbors = self.peer_manager.neighbor_count(),
            "joined"
        );
        *self.joined_through.lock() = others;
        self.mark_joined();
        Ok(())
    }

    fn mark_joined(self: &Arc<Self>) {
        self.joined.store(true, Ordering::SeqCst);
        let _ = self.node_events.send(NodeEvent::JoinCompleted);
        self.start_recovery();
    }

    /// Walk toward the local id and toward its complement, both seeded with
    /// `entry_point`. Returns whether the entry point answered.
    async fn join_through_entry_point(
        self: &Arc<Self>,
        entry_point: PeerDescriptor,
        cancel: &CancellationToken,
    ) -> DhtResult<bool> {
        let lock_id = format!("{}::join", self.settings.service_id);
        self.network.lock_connection(&entry_point, &lock_id);
        self.peer_manager.add_contact(entry_point.clone());

        let (nearby, distant) = join(
            self.discovery_session(self.local.node_id, vec![entry_point.clone()], cancel),
            self.discovery_session(
                complement_id(&self.local.node_id),
                vec![entry_point.clone()],
                cancel,
            ),
        )
        .await;
        self.network.unlock_connection(&entry_point, &lock_id);

        let answered = |outcome: &LookupOutcome<()>| {
            outcome
                .responded
                .iter()
                .any(|peer| peer.node_id == entry_point.node_id)
        };
        Ok(answered(&nearby?) || answered(&distant?))
    }

    /// One iterative walk toward `target` that feeds every answer into the
    /// peer manager.
    async fn discovery_session(
        &self,
        target: NodeId,
        seeds: Vec<PeerDescriptor>,
        cancel: &CancellationToken,
    ) -> DhtResult<LookupOutcome<()>> {
        let excluded: HashSet<NodeId> = [self.local.node_id].into_iter().collect();
        let batch_size = self.settings.batch_size;
        let peer_manager = self.peer_manager.clone();
        expand(
            Metric::Xor(target),
            seeds,
            excluded,
            &self.settings.lookup(),
            cancel,
            move |peer: PeerDescriptor| {
                let peer_manager = peer_manager.clone();
                let remote = peer_manager.remote(peer.clone());
                async move {
                    match remote.closest_peers(target, batch_size).await {
                        Ok(peers) => {
                            peer_manager.handle_peer_active(peer);
                            peer_manager.add_contacts(peers.clone());
                            Ok(HopReply {
                                contacts: peers,
                                payload: (),
                            })
                        }
                        Err(err) => {
                            if err.is_transient() {
                                peer_manager.handle_peer_unresponsive(&peer.node_id);
                            }
                            Err(err)
                        }
                    }
                }
            },
        )
        .await
    }

    /// Populate the ring list with a walk on the ring metric.
    pub async fn join_ring(self: &Arc<Self>, cancel: &CancellationToken) -> DhtResult<()> {
        let position = self.local.ring_position();
        let excluded: HashSet<NodeId> = [self.local.node_id].into_iter().collect();
        let mut seeds = self.peer_manager.closest_ring_contacts_to(
            position,
            self.settings.parallelism.max(self.settings.batch_size),
            &excluded,
        );
        if seeds.is_empty() {
            seeds = self.ring_seeds();
        }
        let batch_size = self.settings.batch_size;
        let peer_manager = self.peer_manager.clone();
        let outcome = expand(
            Metric::Ring(position),
            seeds,
            excluded,
            &self.settings.lookup(),
            cancel,
            move |peer: PeerDescriptor| {
                let peer_manager = peer_manager.clone();
                let remote = peer_manager.remote(peer.clone());
                async move {
                    match remote.closest_ring_peers(position, batch_size).await {
                        Ok(peers) => {
                            peer_manager.add_ring_contact(peer.clone());
                            peer_manager.add_contact(peer);
                            for ring_peer in &peers {
                                peer_manager.add_ring_contact(ring_peer.clone());
                            }
                            Ok(HopReply {
                                contacts: peers,
                                payload: (),
                            })
                        }
                        Err(err) => {
                            if err.is_transient() {
                                peer_manager.handle_peer_unresponsive(&peer.node_id);
                            }
                            Err(err)
                        }
                    }
                }
            },
        )
        .await?;
        debug!(
            node = %short_id(&self.local.node_id),
            ring_contacts = self.peer_manager.ring_contacts().len(),
            answered = outcome.responded.len(),
            "ring join finished"
        );
        Ok(())
    }

    /// Entry points the node joined through, or the configured ones before
    /// any join succeeded.
    fn ring_seeds(&self) -> Vec<PeerDescriptor> {
        let joined_through = self.joined_through.lock().clone();
        let source = if joined_through.is_empty() {
            self.settings.entry_points.clone()
        } else {
            joined_through
        };
        source
            .into_iter()
            .filter(|ep| ep.node_id != self.local.node_id)
            .collect()
    }

    /// Ask the closest neighbours for their closest peers.
    pub async fn refresh_neighbors(&self) {
        let closest = self.peer_manager.closest_contacts(self.settings.parallelism);
        let target = self.local.node_id;
        let batch_size = self.settings.batch_size;
        let queries = closest.into_iter().map(|peer| {
            let remote = self.peer_manager.remote(peer.clone());
            async move { (peer, remote.closest_peers(target, batch_size).await) }
        });
        for (peer, result) in join_all(queries).await {
            match result {
                Ok(peers) => {
                    self.peer_manager.add_contacts(peers);
                }
                Err(err) => {
                    debug!(peer = %peer.short_id(), error = %err, "neighbor refresh failed");
                    self.peer_manager.handle_peer_unresponsive(&peer.node_id);
                }
            }
        }
    }

    fn start_recovery(self: &Arc<Self>) {
        if self.recovery_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(discovery.settings.neighbor_refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = discovery.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if discovery.is_joined() && !discovery.is_rejoin_ongoing() {
                            discovery.refresh_neighbors().await;
                        }
                    }
                }
            }
        });
    }

    /// React to the loss of every contact after a successful join.
    pub fn on_contacts_lost(self: &Arc<Self>) {
        if !self.is_joined() || self.cancel.is_cancelled() || !self.peer_manager.has_no_contacts()
        {
            return;
        }
        if self.settings.entry_points.is_empty() {
            warn!(
                node = %short_id(&self.local.node_id),
                service = %self.settings.service_id,
                "all contacts lost; manual rejoin required"
            );
            self.joined.store(false, Ordering::SeqCst);
            let _ = self.node_events.send(NodeEvent::ManualRejoinRequired);
            return;
        }
        if self.rejoining.swap(true, Ordering::SeqCst) {
            return;
        }
        self.joined.store(false, Ordering::SeqCst);
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            discovery.rejoin().await;
            discovery.rejoining.store(false, Ordering::SeqCst);
        });
    }

    async fn rejoin(self: &Arc<Self>) {
        let entry_points = self.settings.entry_points.clone();
        let cancel = self.cancel.clone();
        loop {
            match self.join_dht(&entry_points, &cancel).await {
                Ok(()) => {
                    info!(node = %short_id(&self.local.node_id), "rejoined");
                    return;
                }
                Err(DhtError::Cancelled) => return,
                Err(err) => {
                    warn!(node = %short_id(&self.local.node_id), error = %err, "rejoin failed; retrying");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.settings.rejoin_backoff) => {}
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
