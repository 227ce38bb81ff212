//! Recursive walks over an arbitrary key: find-node, fetch and delete.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::{short_id, xor_distance, DataEntry, Key, Metric, NodeId, PeerDescriptor};
use crate::error::{DhtError, DhtResult};
use crate::lookup::{expand, HopReply, LookupSettings};
use crate::net::DhtNetwork;
use crate::peer_manager::PeerManager;
use crate::protocol::{RecursiveOperation, RecursiveOperationRequest, RecursiveOperationResponse};
use crate::store::LocalDataStore;

/// Wall clock budget of one recursive walk.
pub const RECURSIVE_OPERATION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct RecursiveSettings {
    pub parallelism: usize,
    pub no_progress_limit: usize,
    pub batch_size: usize,
    pub max_candidates: usize,
    pub timeout: Duration,
    pub redundancy_factor: usize,
    /// Queried when the routing table is empty.
    pub entry_points: Vec<PeerDescriptor>,
}

/// What a walk collected.
#[derive(Clone, Debug, Default)]
pub struct RecursiveOperationResult {
    /// Live nodes closest to the key, closest first. Includes the local node
    /// when it ranks among them.
    pub closest_nodes: Vec<PeerDescriptor>,
    /// Distinct entries by creator, newest copy wins (fetch only).
    pub data_entries: Vec<DataEntry>,
    /// Nodes that confirmed a tombstone (delete only).
    pub deleted_on: Vec<PeerDescriptor>,
}

pub struct RecursiveOperationManager<N: DhtNetwork> {
    local: PeerDescriptor,
    settings: RecursiveSettings,
    peer_manager: Arc<PeerManager<N>>,
    store: Arc<LocalDataStore>,
    cancel: CancellationToken,
}

impl<N: DhtNetwork> RecursiveOperationManager<N> {
    pub fn new(
        local: PeerDescriptor,
        settings: RecursiveSettings,
        peer_manager: Arc<PeerManager<N>>,
        store: Arc<LocalDataStore>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            settings,
            peer_manager,
            store,
            cancel,
        })
    }

    /// Run `operation` for `key`.
    ///
    /// `excluded_peer` is never queried. With `wait_for_completion = false`
    /// the walk continues in the background and only the local part of the
    /// result is returned.
    pub async fn execute(
        self: &Arc<Self>,
        key: Key,
        operation: RecursiveOperation,
        excluded_peer: Option<NodeId>,
        wait_for_completion: bool,
    ) -> DhtResult<RecursiveOperationResult> {
        if self.cancel.is_cancelled() {
            return Err(DhtError::Stopped(short_id(&self.local.node_id)));
        }
        let token = self.cancel.child_token();
        if wait_for_completion {
            return self.walk(key, operation, excluded_peer, &token).await;
        }

        let mut local_only = RecursiveOperationResult::default();
        self.apply_locally(key, operation, &mut local_only);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = manager.walk(key, operation, excluded_peer, &token).await {
                debug!(key = %hex::encode(&key[..8]), error = %err, "background walk ended early");
            }
        });
        Ok(local_only)
    }

    async fn walk(
        &self,
        key: Key,
        operation: RecursiveOperation,
        excluded_peer: Option<NodeId>,
        cancel: &CancellationToken,
    ) -> DhtResult<RecursiveOperationResult> {
        let mut excluded: HashSet<NodeId> = [self.local.node_id].into_iter().collect();
        excluded.extend(excluded_peer);

        let seed_count = self.settings.parallelism.max(self.settings.batch_size);
        let mut seeds = self
            .peer_manager
            .closest_neighbors_to(&key, seed_count, &excluded);
        if seeds.is_empty() {
            seeds = self
                .settings
                .entry_points
                .iter()
                .filter(|ep| !excluded.contains(&ep.node_id))
                .cloned()
                .collect();
        }
        trace!(
            node = %short_id(&self.local.node_id),
            key = %hex::encode(&key[..8]),
            operation = operation.as_str(),
            seeds = seeds.len(),
            "starting recursive walk"
        );

        let lookup = LookupSettings {
            parallelism: self.settings.parallelism,
            no_progress_limit: self.settings.no_progress_limit,
            max_candidates: self.settings.max_candidates,
            timeout: self.settings.timeout,
        };
        let limit = self.settings.batch_size;
        let peer_manager = self.peer_manager.clone();
        let outcome = expand(
            Metric::Xor(key),
            seeds,
            excluded,
            &lookup,
            cancel,
            move |peer: PeerDescriptor| {
                let peer_manager = peer_manager.clone();
                let remote = peer_manager.remote(peer.clone());
                let request = RecursiveOperationRequest {
                    key,
                    operation,
                    limit,
                };
                async move {
                    match remote.recursive_operation(request).await {
                        Ok(response) => {
                            peer_manager.handle_peer_active(peer);
                            Ok(HopReply {
                                contacts: response.closest,
                                payload: (response.entries, response.deleted),
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

        let mut result = RecursiveOperationResult::default();
        self.apply_locally(key, operation, &mut result);

        // Nobody answered: the result stays empty instead of naming only us.
        let mut closest = outcome.responded;
        if !closest.is_empty() {
            closest.push(self.local.clone());
        }
        closest.sort_by_key(|peer| xor_distance(&peer.node_id, &key));
        result.closest_nodes = closest;

        let mut merged = EntryMerger::new(self.settings.redundancy_factor);
        for entry in result.data_entries.drain(..) {
            merged.add(entry, &self.local);
        }
        for (peer, (entries, deleted)) in outcome.replies {
            for entry in entries {
                merged.add(entry, &peer);
            }
            if deleted {
                result.deleted_on.push(peer);
            }
        }
        result.data_entries = merged.finish();
        debug!(
            node = %short_id(&self.local.node_id),
            key = %hex::encode(&key[..8]),
            operation = operation.as_str(),
            closest = result.closest_nodes.len(),
            entries = result.data_entries.len(),
            unreachable = outcome.unreachable.len(),
            "recursive walk finished"
        );
        Ok(result)
    }

    /// The local node's own contribution to a walk.
    fn apply_locally(
        &self,
        key: Key,
        operation: RecursiveOperation,
        result: &mut RecursiveOperationResult,
    ) {
        match operation {
            RecursiveOperation::FindNode => {}
            RecursiveOperation::FetchData => {
                result.data_entries = self.store.get_entries(&key);
            }
            RecursiveOperation::DeleteData => {
                if self.store.mark_as_deleted(&key, &self.local.node_id) {
                    result.deleted_on.push(self.local.clone());
                }
            }
        }
    }

    /// Serve one hop of somebody else's walk.
    pub fn handle_request(
        &self,
        from: &PeerDescriptor,
        request: RecursiveOperationRequest,
    ) -> RecursiveOperationResponse {
        let excluded: HashSet<NodeId> = [from.node_id, self.local.node_id].into_iter().collect();
        let closest = self
            .peer_manager
            .closest_neighbors_to(&request.key, request.limit, &excluded);
        let mut response = RecursiveOperationResponse {
            closest,
            ..RecursiveOperationResponse::default()
        };
        match request.operation {
            RecursiveOperation::FindNode => {}
            RecursiveOperation::FetchData => {
                response.entries = self.store.get_entries(&request.key);
            }
            RecursiveOperation::DeleteData => {
                response.deleted = self.store.mark_as_deleted(&request.key, &from.node_id);
            }
        }
        response
    }
}

/// Deduplicates fetched entries by creator, keeping the newest copy and
/// recording which peers hold it.
struct EntryMerger {
    max_storers: usize,
    by_creator: HashMap<NodeId, DataEntry>,
}

impl EntryMerger {
    fn new(max_storers: usize) -> Self {
        Self {
            max_storers,
            by_creator: HashMap::new(),
        }
    }

    fn add(&mut self, mut entry: DataEntry, holder: &PeerDescriptor) {
        entry.storers.clear();
        match self.by_creator.get_mut(&entry.creator) {
            Some(existing) if existing.created_at_ms > entry.created_at_ms => {}
            Some(existing) if existing.created_at_ms == entry.created_at_ms => {
                existing.deleted |= entry.deleted;
                Self::record_storer(existing, holder, self.max_storers);
            }
            _ => {
                Self::record_storer(&mut entry, holder, self.max_storers);
                self.by_creator.insert(entry.creator, entry);
            }
        }
    }

    fn record_storer(entry: &mut DataEntry, holder: &PeerDescriptor, max_storers: usize) {
        if entry.storers.len() < max_storers
            && !entry.storers.iter().any(|p| p.node_id == holder.node_id)
        {
            entry.storers.push(holder.clone());
        }
    }

    fn finish(self) -> Vec<DataEntry> {
        let mut entries: Vec<DataEntry> = self.by_creator.into_values().collect();
        entries.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(byte: u8) -> PeerDescriptor {
        PeerDescriptor::new([byte; 32], 0)
    }

    fn entry(creator: u8, created_at_ms: u64) -> DataEntry {
        DataEntry {
            created_at_ms,
            ..DataEntry::new([1; 32], vec![creator], [creator; 32], 1_000)
        }
    }

    #[test]
    fn merger_keeps_newest_copy_per_creator() {
        let mut merger = EntryMerger::new(5);
        merger.add(entry(1, 10), &holder(1));
        merger.add(entry(1, 12), &holder(2));
        merger.add(entry(1, 11), &holder(3));
        merger.add(entry(2, 5), &holder(1));
        let entries = merger.finish();
        assert_eq!(entries.len(), 2);
        let newest = entries
            .iter()
            .find(|e| e.creator == [1; 32])
            .expect("creator 1");
        assert_eq!(newest.created_at_ms, 12);
        assert_eq!(newest.storers, vec![holder(2)], "holders of older copies are not storers");
    }

    #[test]
    fn merger_caps_storers() {
        let mut merger = EntryMerger::new(2);
        for byte in 1..=5 {
            merger.add(entry(1, 10), &holder(byte));
        }
        assert_eq!(merger.finish()[0].storers.len(), 2);
    }
}
