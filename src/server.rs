//! The served side of the protocol.
//!
//! Every inbound request of a started node lands in
//! [`NodeInner::serve`]. The caller is recorded as a contact (except when it
//! announces that it is leaving) and the request is dispatched to the
//! component that owns the answer. Handler failures travel back as
//! [`RpcResponse::Error`].

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use crate::core::{short_id, PeerDescriptor};
use crate::error::{DhtError, DhtResult};
use crate::net::{DhtNetwork, RpcHandler};
use crate::node::NodeInner;
use crate::protocol::{RpcRequest, RpcResponse};

impl<N: DhtNetwork> NodeInner<N> {
    async fn serve(&self, from: PeerDescriptor, request: RpcRequest) -> DhtResult<RpcResponse> {
        let c = self.components()?;
        trace!(
            node = %short_id(&self.local.node_id),
            from = %from.short_id(),
            operation = request.name(),
            "serving rpc"
        );
        if from.node_id != self.local.node_id && !matches!(request, RpcRequest::LeaveNotice) {
            c.peer_manager.add_contact(from.clone());
        }

        let response = match request {
            RpcRequest::ClosestPeers { target, limit } => {
                let excluded = HashSet::from([self.local.node_id]);
                RpcResponse::Peers(c.peer_manager.closest_neighbors_to(&target, limit, &excluded))
            }
            RpcRequest::ClosestRingPeers { target, limit } => {
                let excluded = HashSet::from([self.local.node_id, from.node_id]);
                let mut peers = c.peer_manager.closest_ring_contacts_to(target, limit, &excluded);
                c.peer_manager.add_ring_contact(from);
                peers.truncate(limit);
                RpcResponse::Peers(peers)
            }
            RpcRequest::Ping => RpcResponse::Pong,
            RpcRequest::LeaveNotice => {
                c.peer_manager.handle_peer_leaving(&from.node_id);
                RpcResponse::Ack
            }
            RpcRequest::StoreData(request) => {
                c.store_manager.handle_store_data(&from, request);
                RpcResponse::Ack
            }
            RpcRequest::ReplicateData { entry } => {
                c.store_manager.handle_replicate_data(&from, entry);
                RpcResponse::Ack
            }
            RpcRequest::RecursiveOperation(request) => {
                RpcResponse::Recursive(c.recursive.handle_request(&from, request))
            }
            RpcRequest::RouteMessage(message) => {
                RpcResponse::Routed(c.router.route_message(message).await.err())
            }
            RpcRequest::ExternalFetchData { key } => {
                RpcResponse::Entries(c.store_manager.fetch_data_from_dht(key).await?)
            }
            RpcRequest::ExternalStoreData { key, value } => RpcResponse::StoredAt(
                c.store_manager
                    .store_data_to_dht(key, value, from.node_id)
                    .await?,
            ),
        };
        Ok(response)
    }
}

#[async_trait]
impl<N: DhtNetwork> RpcHandler for NodeInner<N> {
    async fn handle_rpc(&self, from: PeerDescriptor, request: RpcRequest) -> RpcResponse {
        let operation = request.name();
        match self.serve(from, request).await {
            Ok(response) => response,
            Err(err) => {
                let err = DhtError::Handler(format!("{operation}: {err}"));
                trace!(node = %short_id(&self.local.node_id), error = %err, "rpc failed");
                RpcResponse::Error(err.to_string())
            }
        }
    }
}
