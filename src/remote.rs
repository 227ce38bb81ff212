//! Remote-call handles for individual peers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::contact::ContactLike;
use crate::core::{short_id, DataEntry, Key, NodeId, PeerDescriptor, RingPosition};
use crate::error::{DhtError, DhtResult, RouteError};
use crate::net::DhtNetwork;
use crate::protocol::{
    RecursiveOperationRequest, RecursiveOperationResponse, RoutedMessage, StoreDataRequest,
};

/// A peer descriptor paired with the transport used to reach it.
///
/// Every call is bounded by the handle's timeout and converts transport
/// failures into [`DhtError`] with the peer and operation attached.
pub struct DhtNodeRemote<N: DhtNetwork> {
    peer: PeerDescriptor,
    network: Arc<N>,
    timeout: Duration,
}

impl<N: DhtNetwork> Clone for DhtNodeRemote<N> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            network: self.network.clone(),
            timeout: self.timeout,
        }
    }
}

impl<N: DhtNetwork> fmt::Debug for DhtNodeRemote<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtNodeRemote")
            .field("peer", &short_id(&self.peer.node_id))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<N: DhtNetwork> ContactLike for DhtNodeRemote<N> {
    fn descriptor(&self) -> &PeerDescriptor {
        &self.peer
    }
}

impl<N: DhtNetwork> DhtNodeRemote<N> {
    pub fn new(peer: PeerDescriptor, network: Arc<N>, timeout: Duration) -> Self {
        Self {
            peer,
            network,
            timeout,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.peer.node_id
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> DhtResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DhtError::Rpc {
                peer: short_id(&self.peer.node_id),
                operation,
                reason: err.to_string(),
            }),
            Err(_) => Err(DhtError::Timeout {
                peer: short_id(&self.peer.node_id),
                operation,
                timeout: self.timeout,
            }),
        }
    }

    pub async fn closest_peers(&self, target: NodeId, limit: usize) -> DhtResult<Vec<PeerDescriptor>> {
        self.bounded(
            "closest_peers",
            self.network.closest_peers(&self.peer, target, limit),
        )
        .await
    }

    pub async fn closest_ring_peers(
        &self,
        target: RingPosition,
        limit: usize,
    ) -> DhtResult<Vec<PeerDescriptor>> {
        self.bounded(
            "closest_ring_peers",
            self.network.closest_ring_peers(&self.peer, target, limit),
        )
        .await
    }

    pub async fn ping(&self) -> DhtResult<()> {
        self.bounded("ping", self.network.ping(&self.peer)).await
    }

    pub async fn leave_notice(&self) -> DhtResult<()> {
        self.bounded("leave_notice", self.network.leave_notice(&self.peer))
            .await
    }

    pub async fn store_data(&self, request: StoreDataRequest) -> DhtResult<()> {
        self.bounded("store_data", self.network.store_data(&self.peer, request))
            .await
    }

    pub async fn replicate_data(&self, entry: DataEntry) -> DhtResult<()> {
        self.bounded(
            "replicate_data",
            self.network.replicate_data(&self.peer, entry),
        )
        .await
    }

    pub async fn recursive_operation(
        &self,
        request: RecursiveOperationRequest,
    ) -> DhtResult<RecursiveOperationResponse> {
        self.bounded(
            "recursive_operation",
            self.network.recursive_operation(&self.peer, request),
        )
        .await
    }

    pub async fn route_message(&self, message: RoutedMessage) -> DhtResult<Option<RouteError>> {
        self.bounded(
            "route_message",
            self.network.route_message(&self.peer, message),
        )
        .await
    }

    pub async fn external_fetch_data(&self, key: Key) -> DhtResult<Vec<DataEntry>> {
        self.bounded(
            "external_fetch_data",
            self.network.external_fetch_data(&self.peer, key),
        )
        .await
    }

    pub async fn external_store_data(
        &self,
        key: Key,
        value: Vec<u8>,
    ) -> DhtResult<Vec<PeerDescriptor>> {
        self.bounded(
            "external_store_data",
            self.network.external_store_data(&self.peer, key, value),
        )
        .await
    }
}
