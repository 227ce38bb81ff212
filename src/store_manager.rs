//! Replicated storage on top of the recursive walks.
//!
//! Each key lives on the `redundancy_factor` nodes closest to it. The node
//! closest to a key is responsible for pushing copies to newcomers that fall
//! inside that set; copies it is no longer responsible for are marked stale.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, trace};

use crate::contact::SortedContactList;
use crate::core::{now_ms, short_id, DataEntry, Key, Metric, NodeId, PeerDescriptor};
use crate::error::DhtResult;
use crate::net::DhtNetwork;
use crate::peer_manager::PeerManager;
use crate::protocol::{RecursiveOperation, StoreDataRequest};
use crate::recursive::RecursiveOperationManager;
use crate::store::LocalDataStore;

/// Contacts consulted when deciding who is responsible for a key.
const RESPONSIBILITY_SAMPLE: usize = 10;

#[derive(Clone, Debug)]
pub struct StoreSettings {
    /// Ttl attached to entries this node writes.
    pub highest_ttl: Duration,
    pub redundancy_factor: usize,
}

pub struct StoreManager<N: DhtNetwork> {
    local: PeerDescriptor,
    settings: StoreSettings,
    peer_manager: Arc<PeerManager<N>>,
    recursive: Arc<RecursiveOperationManager<N>>,
    store: Arc<LocalDataStore>,
}

impl<N: DhtNetwork> StoreManager<N> {
    pub fn new(
        local: PeerDescriptor,
        settings: StoreSettings,
        peer_manager: Arc<PeerManager<N>>,
        recursive: Arc<RecursiveOperationManager<N>>,
        store: Arc<LocalDataStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            settings,
            peer_manager,
            recursive,
            store,
        })
    }

    pub fn local_store(&self) -> &Arc<LocalDataStore> {
        &self.store
    }

    /// Write `value` under `key` on the closest nodes until
    /// `redundancy_factor` of them accepted it. Returns the nodes that did.
    pub async fn store_data_to_dht(
        self: &Arc<Self>,
        key: Key,
        value: Vec<u8>,
        creator: NodeId,
    ) -> DhtResult<Vec<PeerDescriptor>> {
        let found = self
            .recursive
            .execute(key, RecursiveOperation::FindNode, None, true)
            .await?;
        let mut closest = found.closest_nodes;
        if closest.is_empty() {
            closest.push(self.local.clone());
        }

        let request = StoreDataRequest {
            key,
            value,
            creator,
            created_at_ms: now_ms(),
            ttl_ms: self.settings.highest_ttl.as_millis() as u64,
        };
        let mut stored_on = Vec::new();
        for peer in closest {
            if stored_on.len() >= self.settings.redundancy_factor {
                break;
            }
            if peer.node_id == self.local.node_id {
                self.store.store_entry(request.clone().into_entry());
                stored_on.push(peer);
                continue;
            }
            match self.peer_manager.remote(peer.clone()).store_data(request.clone()).await {
                Ok(()) => stored_on.push(peer),
                Err(err) => trace!(peer = %peer.short_id(), error = %err, "store_data failed"),
            }
        }
        debug!(
            node = %short_id(&self.local.node_id),
            key = %hex::encode(&key[..8]),
            replicas = stored_on.len(),
            "stored data"
        );
        Ok(stored_on)
    }

    /// Distinct entries for `key` across the overlay, newest copy per creator.
    pub async fn fetch_data_from_dht(self: &Arc<Self>, key: Key) -> DhtResult<Vec<DataEntry>> {
        let result = self
            .recursive
            .execute(key, RecursiveOperation::FetchData, None, true)
            .await?;
        Ok(result.data_entries)
    }

    /// Tombstone this node's entries under `key`. Returns the nodes that
    /// confirmed; without `wait_for_completion` only the local confirmation is
    /// known when this returns.
    pub async fn delete_data_from_dht(
        self: &Arc<Self>,
        key: Key,
        wait_for_completion: bool,
    ) -> DhtResult<Vec<PeerDescriptor>> {
        let result = self
            .recursive
            .execute(key, RecursiveOperation::DeleteData, None, wait_for_completion)
            .await?;
        Ok(result.deleted_on)
    }

    /// Self plus up to `sample` known contacts, sorted by distance to `key`.
    fn ranked_for_key(
        &self,
        key: &Key,
        sample: usize,
        capacity: usize,
        excluded: &HashSet<NodeId>,
    ) -> SortedContactList<PeerDescriptor> {
        let mut ranked = SortedContactList::new(Metric::Xor(*key), capacity);
        ranked.add_contact(self.local.clone());
        for peer in self.peer_manager.closest_neighbors_to(key, sample, excluded) {
            ranked.add_contact(peer);
        }
        ranked
    }

    fn is_closest_known_holder(ranked: &SortedContactList<PeerDescriptor>, local: &NodeId) -> bool {
        ranked.ids().first() == Some(local)
    }

    /// Whether this node is among the `redundancy_factor` closest it knows of.
    pub fn self_is_one_of_closest_peers(&self, key: &Key) -> bool {
        let excluded = HashSet::from([self.local.node_id]);
        self.ranked_for_key(
            key,
            self.settings.redundancy_factor,
            self.settings.redundancy_factor,
            &excluded,
        )
        .contains(&self.local.node_id)
    }

    /// Decide whether `entry` should be pushed to `newcomer`, and mark the
    /// local copy stale when it should not.
    pub fn should_replicate_to_new_node(&self, entry: &DataEntry, newcomer: &PeerDescriptor) -> bool {
        let excluded = HashSet::from([self.local.node_id, newcomer.node_id]);
        let mut ranked = self.ranked_for_key(
            &entry.key,
            RESPONSIBILITY_SAMPLE,
            RESPONSIBILITY_SAMPLE * 2,
            &excluded,
        );
        if !Self::is_closest_known_holder(&ranked, &self.local.node_id) {
            return false;
        }
        ranked.add_contact(newcomer.clone());
        let within = ranked
            .ids()
            .iter()
            .position(|id| *id == newcomer.node_id)
            .is_some_and(|idx| idx < self.settings.redundancy_factor);
        self.store.set_stale(&entry.key, &entry.creator, !within);
        within
    }

    /// Push the entries `newcomer` is now responsible for. Failures are only
    /// logged; the next churn event retries.
    pub async fn on_new_contact(&self, newcomer: PeerDescriptor) {
        let entries: Vec<DataEntry> = self
            .store
            .all_entries()
            .into_iter()
            .filter(|entry| self.should_replicate_to_new_node(entry, &newcomer))
            .collect();
        if entries.is_empty() {
            return;
        }
        trace!(
            node = %short_id(&self.local.node_id),
            peer = %newcomer.short_id(),
            entries = entries.len(),
            "replicating to new contact"
        );
        let remote = self.peer_manager.remote(newcomer);
        let pushes = entries.into_iter().map(|entry| {
            let remote = remote.clone();
            async move {
                if let Err(err) = remote.replicate_data(entry).await {
                    trace!(peer = %short_id(&remote.node_id()), error = %err, "replicate_data failed");
                }
            }
        });
        join_all(pushes).await;
    }

    /// Restore the redundancy of keys a removed contact was holding.
    ///
    /// For every local entry whose redundancy set contained `removed`, the
    /// closest known holder pushes a copy to the members of the set that
    /// remain. Failures are only logged.
    pub async fn on_contact_removed(&self, removed: PeerDescriptor) {
        let excluded = HashSet::from([self.local.node_id, removed.node_id]);
        let mut pushes = Vec::new();
        for entry in self.store.all_entries() {
            let mut ranked = self.ranked_for_key(
                &entry.key,
                RESPONSIBILITY_SAMPLE,
                RESPONSIBILITY_SAMPLE * 2,
                &excluded,
            );
            if !Self::is_closest_known_holder(&ranked, &self.local.node_id) {
                continue;
            }
            let survivors = ranked.closest(self.settings.redundancy_factor);
            ranked.add_contact(removed.clone());
            let was_holder = ranked
                .ids()
                .iter()
                .position(|id| *id == removed.node_id)
                .is_some_and(|idx| idx < self.settings.redundancy_factor);
            if !was_holder {
                continue;
            }
            for peer in survivors {
                if peer.node_id == self.local.node_id {
                    continue;
                }
                let remote = self.peer_manager.remote(peer);
                let entry = entry.clone();
                pushes.push(async move {
                    if let Err(err) = remote.replicate_data(entry).await {
                        trace!(peer = %short_id(&remote.node_id()), error = %err, "re-replication failed");
                    }
                });
            }
        }
        if pushes.is_empty() {
            return;
        }
        debug!(
            node = %short_id(&self.local.node_id),
            removed = %removed.short_id(),
            pushes = pushes.len(),
            "restoring replicas after contact loss"
        );
        join_all(pushes).await;
    }

    /// Serve a `store_data` call.
    pub fn handle_store_data(&self, from: &PeerDescriptor, request: StoreDataRequest) {
        let key = request.key;
        let mut entry = request.into_entry();
        entry.stale = !self.self_is_one_of_closest_peers(&key);
        trace!(
            node = %short_id(&self.local.node_id),
            from = %from.short_id(),
            key = %hex::encode(&key[..8]),
            "store_data"
        );
        self.store.store_entry(entry);
        if !self.self_is_one_of_closest_peers(&key) {
            self.store.set_all_entries_stale(&key);
        }
    }

    /// Serve a `replicate_data` notification.
    pub fn handle_replicate_data(self: &Arc<Self>, from: &PeerDescriptor, entry: DataEntry) {
        let key = entry.key;
        if self.store.store_entry(entry.clone()) {
            self.replicate_to_neighbors(from, entry);
        }
        if !self.self_is_one_of_closest_peers(&key) {
            self.store.set_all_entries_stale(&key);
        }
    }

    /// Forward a freshly received copy: to every other member of the
    /// redundancy set when this node is the closest known holder, otherwise
    /// only to the closest one.
    fn replicate_to_neighbors(self: &Arc<Self>, incoming: &PeerDescriptor, entry: DataEntry) {
        let excluded = HashSet::from([self.local.node_id]);
        let ranked = self.ranked_for_key(
            &entry.key,
            RESPONSIBILITY_SAMPLE,
            self.settings.redundancy_factor,
            &excluded,
        );
        let targets: Vec<PeerDescriptor> =
            if Self::is_closest_known_holder(&ranked, &self.local.node_id) {
                ranked.all()
            } else {
                ranked.closest(1)
            };
        for peer in targets {
            if peer.node_id == incoming.node_id || peer.node_id == self.local.node_id {
                continue;
            }
            let remote = self.peer_manager.remote(peer);
            let entry = entry.clone();
            tokio::spawn(async move {
                if let Err(err) = remote.replicate_data(entry).await {
                    debug!(peer = %short_id(&remote.node_id()), error = %err, "forwarding replica failed");
                }
            });
        }
    }

    /// Hand every local entry to the current closest contacts of its key.
    /// Used on graceful stop.
    pub async fn hand_off_all(&self) {
        let entries = self.store.all_entries();
        if entries.is_empty() {
            return;
        }
        let excluded = HashSet::from([self.local.node_id]);
        let mut pushes = Vec::new();
        for entry in entries {
            for peer in self.peer_manager.closest_neighbors_to(
                &entry.key,
                self.settings.redundancy_factor,
                &excluded,
            ) {
                let remote = self.peer_manager.remote(peer);
                let entry = entry.clone();
                pushes.push(async move {
                    if let Err(err) = remote.replicate_data(entry).await {
                        trace!(peer = %short_id(&remote.node_id()), error = %err, "hand-off failed");
                    }
                });
            }
        }
        debug!(
            node = %short_id(&self.local.node_id),
            pushes = pushes.len(),
            "handing off local data"
        );
        join_all(pushes).await;
    }

    /// Drop expired entries. Returns how many went away.
    pub fn sweep_expired(&self) -> usize {
        let removed = self.store.remove_expired();
        if removed > 0 {
            trace!(node = %short_id(&self.local.node_id), removed, "expired entries removed");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::net::{SimulatedNetwork, Simulator};
    use crate::peer_manager::PeerManagerSettings;
    use crate::recursive::{RecursiveSettings, RECURSIVE_OPERATION_TIMEOUT};

    fn manager(local: PeerDescriptor, redundancy_factor: usize) -> Arc<StoreManager<SimulatedNetwork>> {
        manager_on(&Simulator::new(), local, redundancy_factor)
    }

    fn manager_on(
        sim: &Arc<Simulator>,
        local: PeerDescriptor,
        redundancy_factor: usize,
    ) -> Arc<StoreManager<SimulatedNetwork>> {
        let network = Arc::new(SimulatedNetwork::new(sim, local.clone(), "layer0"));
        let pm = PeerManager::new(
            local.clone(),
            network,
            PeerManagerSettings {
                service_id: "layer0".into(),
                nodes_per_bucket: 8,
                max_neighbor_list_size: 32,
                max_random_contacts: 8,
                max_ring_contacts: 8,
                max_connections: 32,
                rpc_request_timeout: Duration::from_millis(50),
            },
        );
        let store = Arc::new(LocalDataStore::new(Duration::from_secs(60)));
        let recursive = RecursiveOperationManager::new(
            local.clone(),
            RecursiveSettings {
                parallelism: 3,
                no_progress_limit: 2,
                batch_size: 5,
                max_candidates: 20,
                timeout: RECURSIVE_OPERATION_TIMEOUT,
                redundancy_factor,
                entry_points: Vec::new(),
            },
            pm.clone(),
            store.clone(),
            CancellationToken::new(),
        );
        StoreManager::new(
            local,
            StoreSettings {
                highest_ttl: Duration::from_secs(30),
                redundancy_factor,
            },
            pm,
            recursive,
            store,
        )
    }

    #[tokio::test]
    async fn lone_node_stores_locally() {
        let local = PeerDescriptor::new([1; 32], 0);
        let manager = manager(local.clone(), 3);
        let stored = manager
            .store_data_to_dht([7; 32], b"v".to_vec(), local.node_id)
            .await
            .expect("store");
        assert_eq!(stored, vec![local.clone()]);
        let fetched = manager.fetch_data_from_dht([7; 32]).await.expect("fetch");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].value, b"v".to_vec());
        assert!(manager.self_is_one_of_closest_peers(&[7; 32]));
    }

    #[tokio::test]
    async fn newcomer_inside_redundancy_set_gets_a_copy() {
        let local = PeerDescriptor::new([0x10; 32], 0);
        let manager = manager(local.clone(), 2);
        let entry = DataEntry::new([0x11; 32], b"v".to_vec(), local.node_id, 1_000);
        manager.local_store().store_entry(entry.clone());
        let newcomer = PeerDescriptor::new([0x12; 32], 0);
        assert!(manager.should_replicate_to_new_node(&entry, &newcomer));
        assert!(!manager.local_store().get_entries(&entry.key)[0].stale);
    }

    #[tokio::test]
    async fn node_that_is_not_closest_does_not_push() {
        let local = PeerDescriptor::new([0x80; 32], 0);
        let manager = manager(local.clone(), 2);
        let closer = PeerDescriptor::new([0x01; 32], 0);
        manager.peer_manager.add_contact(closer);
        let entry = DataEntry::new([0x00; 32], b"v".to_vec(), local.node_id, 1_000);
        manager.local_store().store_entry(entry.clone());
        let newcomer = PeerDescriptor::new([0x02; 32], 0);
        assert!(!manager.should_replicate_to_new_node(&entry, &newcomer));
    }

    #[tokio::test]
    async fn store_call_from_far_node_marks_entries_stale() {
        let local = PeerDescriptor::new([0xf0; 32], 0);
        let manager = manager(local.clone(), 1);
        manager.peer_manager.add_contact(PeerDescriptor::new([0x01; 32], 0));
        let from = PeerDescriptor::new([0x02; 32], 0);
        manager.handle_store_data(
            &from,
            StoreDataRequest {
                key: [0x00; 32],
                value: b"v".to_vec(),
                creator: from.node_id,
                created_at_ms: 1,
                ttl_ms: 1_000,
            },
        );
        let held = manager.local_store().get_entries(&[0x00; 32]);
        assert_eq!(held.len(), 1);
        assert!(held[0].stale);
    }

    #[tokio::test]
    async fn closest_holder_restores_copies_when_a_holder_leaves() {
        let sim = Simulator::new();
        let local = PeerDescriptor::new([0x10; 32], 0);
        let manager = manager_on(&sim, local.clone(), 2);
        let gone = PeerDescriptor::new([0x11; 32], 0);
        let next = PeerDescriptor::new([0x13; 32], 0);
        manager.peer_manager.add_contact(next.clone());
        let entry = DataEntry::new([0x10; 32], b"v".to_vec(), local.node_id, 1_000);
        manager.local_store().store_entry(entry);

        sim.clear_calls();
        manager.on_contact_removed(gone).await;
        let pushes: Vec<NodeId> = sim
            .calls()
            .iter()
            .filter(|call| call.operation == "replicate_data")
            .map(|call| call.to)
            .collect();
        assert_eq!(pushes, vec![next.node_id]);
    }

    #[tokio::test]
    async fn losing_a_peer_outside_the_redundancy_set_pushes_nothing() {
        let sim = Simulator::new();
        let local = PeerDescriptor::new([0x10; 32], 0);
        let manager = manager_on(&sim, local.clone(), 2);
        manager.peer_manager.add_contact(PeerDescriptor::new([0x11; 32], 0));
        let entry = DataEntry::new([0x10; 32], b"v".to_vec(), local.node_id, 1_000);
        manager.local_store().store_entry(entry);

        sim.clear_calls();
        manager
            .on_contact_removed(PeerDescriptor::new([0xf0; 32], 0))
            .await;
        assert!(sim
            .calls()
            .iter()
            .all(|call| call.operation != "replicate_data"));
    }
}
