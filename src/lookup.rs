//! The iterative "expand outward from the best candidates" routine.
//!
//! Every walk in the overlay has the same shape: keep a bounded candidate set
//! sorted by distance to a target, query up to `parallelism` of the closest
//! unqueried candidates concurrently, merge the peers they return, and stop
//! once several rounds in a row brought nothing closer, once nothing is left
//! to query, or once the deadline passes. Join, ring join, find, fetch and
//! delete only differ in the per-hop call and in what they do with its
//! payload.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::contact::SortedContactList;
use crate::core::{Metric, NodeId, PeerDescriptor};
use crate::error::{DhtError, DhtResult};

#[derive(Clone, Debug)]
pub struct LookupSettings {
    /// Concurrent queries per round.
    pub parallelism: usize,
    /// Consecutive rounds without a closer candidate before giving up.
    pub no_progress_limit: usize,
    /// Size of the candidate set.
    pub max_candidates: usize,
    /// Wall clock budget for the whole walk.
    pub timeout: Duration,
}

/// What one hop produced.
pub struct HopReply<T> {
    /// Peers the queried node suggested.
    pub contacts: Vec<PeerDescriptor>,
    pub payload: T,
}

pub struct LookupOutcome<T> {
    /// Peers that answered, closest first.
    pub responded: Vec<PeerDescriptor>,
    /// Payloads in the order the hops completed.
    pub replies: Vec<(PeerDescriptor, T)>,
    /// Peers whose hop failed. They were never retried.
    pub unreachable: Vec<PeerDescriptor>,
    /// True when the walk ended because the deadline passed.
    pub timed_out: bool,
}

/// Run a walk toward `metric`'s reference point starting at `seeds`.
///
/// Transient hop failures drop the peer from the candidate set for the rest of
/// the walk. The walk fails when `cancel` fires or a hop reports anything
/// else, such as the local node stopping.
pub async fn expand<T, F, Fut>(
    metric: Metric,
    seeds: Vec<PeerDescriptor>,
    excluded: HashSet<NodeId>,
    settings: &LookupSettings,
    cancel: &CancellationToken,
    mut hop: F,
) -> DhtResult<LookupOutcome<T>>
where
    F: FnMut(PeerDescriptor) -> Fut,
    Fut: Future<Output = DhtResult<HopReply<T>>>,
{
    let parallelism = settings.parallelism.max(1);
    let mut candidates =
        SortedContactList::new(metric, settings.max_candidates.max(1)).with_excluded(excluded);
    for seed in seeds {
        candidates.add_contact(seed);
    }

    // Every peer handed to `hop`, answered or not. Stays out of the candidate
    // set for the rest of the walk.
    let mut queried: HashSet<NodeId> = HashSet::new();
    let mut responded = SortedContactList::new(metric, usize::MAX);
    let mut replies = Vec::new();
    let mut unreachable = Vec::new();
    let mut best = candidates.closest_distance();
    let mut rounds_without_progress = 0usize;
    let mut timed_out = false;
    let deadline = Instant::now() + settings.timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(DhtError::Cancelled);
        }
        let batch = candidates.uncontacted(parallelism);
        if batch.is_empty() {
            break;
        }
        for peer in &batch {
            candidates.set_contacted(&peer.node_id);
            queried.insert(peer.node_id);
        }

        let round = join_all(batch.into_iter().map(|peer| {
            let call = hop(peer.clone());
            async move { (peer, call.await) }
        }));
        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(DhtError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                break;
            }
            results = round => results,
        };

        for (peer, result) in results {
            match result {
                Ok(reply) => {
                    candidates.set_active(&peer.node_id);
                    for contact in reply.contacts {
                        if !queried.contains(&contact.node_id) {
                            candidates.add_contact(contact);
                        }
                    }
                    responded.add_contact(peer.clone());
                    replies.push((peer, reply.payload));
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    trace!(peer = %peer.short_id(), error = %err, "lookup hop failed");
                    candidates.remove_contact(&peer.node_id);
                    unreachable.push(peer);
                }
            }
        }

        let current = candidates.closest_distance();
        let improved = match (current, best) {
            (Some(current), Some(previous)) => current < previous,
            (Some(_), None) => true,
            _ => false,
        };
        if improved {
            best = current;
            rounds_without_progress = 0;
        } else {
            rounds_without_progress += 1;
            if rounds_without_progress >= settings.no_progress_limit.max(1) {
                break;
            }
        }
        if Instant::now() >= deadline {
            timed_out = true;
            break;
        }
    }

    Ok(LookupOutcome {
        responded: responded.all(),
        replies,
        unreachable,
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::core::xor_distance;

    fn settings() -> LookupSettings {
        LookupSettings {
            parallelism: 3,
            no_progress_limit: 3,
            max_candidates: 20,
            timeout: Duration::from_secs(5),
        }
    }

    /// A static overlay where every node knows a few random others plus its
    /// true nearest neighbours.
    fn overlay(size: usize, seed: u64) -> HashMap<NodeId, Vec<PeerDescriptor>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let ids: Vec<NodeId> = (0..size).map(|_| rng.gen()).collect();
        let mut table = HashMap::new();
        for id in &ids {
            let mut sorted = ids.clone();
            sorted.sort_by_key(|other| xor_distance(id, other));
            let mut known: Vec<PeerDescriptor> = sorted
                .iter()
                .skip(1)
                .take(8)
                .map(|other| PeerDescriptor::new(*other, 0))
                .collect();
            for _ in 0..12 {
                known.push(PeerDescriptor::new(ids[rng.gen_range(0..size)], 0));
            }
            table.insert(*id, known);
        }
        table
    }

    #[tokio::test]
    async fn converges_on_the_closest_node() {
        let table = Arc::new(overlay(200, 11));
        let target: NodeId = StdRng::seed_from_u64(99).gen();
        let truly_closest = *table
            .keys()
            .min_by_key(|id| xor_distance(id, &target))
            .expect("overlay is not empty");
        let seed = PeerDescriptor::new(*table.keys().next().expect("seed"), 0);

        let hop_table = table.clone();
        let outcome = expand(
            Metric::Xor(target),
            vec![seed],
            HashSet::new(),
            &settings(),
            &CancellationToken::new(),
            move |peer: PeerDescriptor| {
                let contacts = hop_table.get(&peer.node_id).cloned().unwrap_or_default();
                async move { Ok(HopReply { contacts, payload: () }) }
            },
        )
        .await
        .expect("lookup should not fail");

        assert_eq!(outcome.responded[0].node_id, truly_closest);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn never_queries_a_peer_twice_and_drops_failures() {
        let table = Arc::new(overlay(60, 3));
        let target: NodeId = [0x55; 32];
        let seeds: Vec<PeerDescriptor> = table
            .keys()
            .take(3)
            .map(|id| PeerDescriptor::new(*id, 0))
            .collect();
        let failing = seeds[0].node_id;
        let queried = Arc::new(Mutex::new(Vec::new()));

        let hop_table = table.clone();
        let hop_queried = queried.clone();
        let outcome = expand(
            Metric::Xor(target),
            seeds,
            HashSet::new(),
            &settings(),
            &CancellationToken::new(),
            move |peer: PeerDescriptor| {
                hop_queried.lock().push(peer.node_id);
                let contacts = hop_table.get(&peer.node_id).cloned().unwrap_or_default();
                async move {
                    if peer.node_id == failing {
                        Err(DhtError::Unreachable(peer.short_id()))
                    } else {
                        Ok(HopReply { contacts, payload: () })
                    }
                }
            },
        )
        .await
        .expect("lookup should not fail");

        let queried = queried.lock().clone();
        let unique: HashSet<NodeId> = queried.iter().copied().collect();
        assert_eq!(unique.len(), queried.len(), "a peer was queried twice");
        assert_eq!(outcome.unreachable.len(), 1);
        assert!(outcome.responded.iter().all(|p| p.node_id != failing));
    }

    #[tokio::test]
    async fn failed_peer_is_not_retried_when_another_peer_suggests_it() {
        let dead = PeerDescriptor::new([0x01; 32], 0);
        let alive = PeerDescriptor::new([0x02; 32], 0);
        let queried = Arc::new(Mutex::new(Vec::new()));
        let hop_queried = queried.clone();
        let suggestion = dead.clone();
        let outcome = expand(
            Metric::Xor([0; 32]),
            vec![dead.clone(), alive.clone()],
            HashSet::new(),
            &settings(),
            &CancellationToken::new(),
            move |peer: PeerDescriptor| {
                hop_queried.lock().push(peer.node_id);
                let contacts = vec![suggestion.clone()];
                async move {
                    if peer.node_id == [0x01; 32] {
                        Err(DhtError::Unreachable(peer.short_id()))
                    } else {
                        Ok(HopReply { contacts, payload: () })
                    }
                }
            },
        )
        .await
        .expect("lookup");

        let queried = queried.lock().clone();
        assert_eq!(queried.iter().filter(|id| **id == dead.node_id).count(), 1);
        assert_eq!(queried.len(), 2);
        assert_eq!(outcome.unreachable.len(), 1);
        assert_eq!(outcome.responded.len(), 1);
        assert_eq!(outcome.responded[0].node_id, alive.node_id);
    }

    #[tokio::test]
    async fn non_transient_hop_error_ends_the_walk() {
        let result = expand(
            Metric::Xor([0; 32]),
            vec![PeerDescriptor::new([1; 32], 0), PeerDescriptor::new([2; 32], 0)],
            HashSet::new(),
            &settings(),
            &CancellationToken::new(),
            |peer: PeerDescriptor| async move {
                Err::<HopReply<()>, _>(DhtError::Stopped(peer.short_id()))
            },
        )
        .await;
        assert!(matches!(result, Err(DhtError::Stopped(_))));
    }

    #[tokio::test]
    async fn excluded_peers_are_never_queried() {
        let table = Arc::new(overlay(40, 5));
        let ids: Vec<NodeId> = table.keys().copied().collect();
        let excluded: HashSet<NodeId> = ids.iter().skip(1).step_by(2).copied().collect();
        let hop_table = table.clone();
        let outcome = expand(
            Metric::Xor([0; 32]),
            vec![PeerDescriptor::new(ids[0], 0)],
            excluded.clone(),
            &settings(),
            &CancellationToken::new(),
            move |peer: PeerDescriptor| {
                let contacts = hop_table.get(&peer.node_id).cloned().unwrap_or_default();
                async move { Ok(HopReply { contacts, payload: () }) }
            },
        )
        .await
        .expect("lookup");
        assert!(outcome
            .responded
            .iter()
            .all(|peer| !excluded.contains(&peer.node_id)));
    }

    #[tokio::test]
    async fn no_reachable_peers_yields_empty_result() {
        let seeds = vec![PeerDescriptor::new([1; 32], 0), PeerDescriptor::new([2; 32], 0)];
        let started = Instant::now();
        let outcome = expand(
            Metric::Xor([0; 32]),
            seeds,
            HashSet::new(),
            &settings(),
            &CancellationToken::new(),
            |peer: PeerDescriptor| async move {
                Err::<HopReply<()>, _>(DhtError::Unreachable(peer.short_id()))
            },
        )
        .await
        .expect("lookup");
        assert!(outcome.responded.is_empty());
        assert_eq!(outcome.unreachable.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn deadline_ends_a_slow_walk() {
        let settings = LookupSettings {
            timeout: Duration::from_millis(50),
            ..settings()
        };
        let outcome = expand(
            Metric::Xor([0; 32]),
            vec![PeerDescriptor::new([1; 32], 0)],
            HashSet::new(),
            &settings,
            &CancellationToken::new(),
            |_peer: PeerDescriptor| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(HopReply {
                    contacts: Vec::new(),
                    payload: (),
                })
            },
        )
        .await
        .expect("lookup");
        assert!(outcome.timed_out);
        assert!(outcome.responded.is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_the_walk() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = expand(
            Metric::Xor([0; 32]),
            vec![PeerDescriptor::new([1; 32], 0)],
            HashSet::new(),
            &settings(),
            &cancel,
            |_peer: PeerDescriptor| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(HopReply {
                    contacts: Vec::new(),
                    payload: (),
                })
            },
        )
        .await;
        assert!(matches!(result, Err(DhtError::Cancelled)));
    }
}
