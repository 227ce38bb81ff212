//! DHT protocol message definitions.
//!
//! Requests and responses exchanged between peers of one overlay. All types
//! are serde serializable; the physical encoding is up to the transport (the
//! bundled simulator uses JSON).

use serde::{Deserialize, Serialize};

use crate::core::{DataEntry, Key, NodeId, PeerDescriptor, RingPosition};
use crate::error::RouteError;

/// Kind of a recursive walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecursiveOperation {
    /// Locate the closest live nodes to a key.
    FindNode,
    /// Collect stored entries for a key.
    FetchData,
    /// Tombstone entries created by the requester.
    DeleteData,
}

impl RecursiveOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecursiveOperation::FindNode => "find_node",
            RecursiveOperation::FetchData => "fetch_data",
            RecursiveOperation::DeleteData => "delete_data",
        }
    }
}

/// One hop of a recursive walk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecursiveOperationRequest {
    pub key: Key,
    pub operation: RecursiveOperation,
    /// Maximum number of closer peers the receiver should return.
    pub limit: usize,
}

/// Answer to one hop of a recursive walk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecursiveOperationResponse {
    /// The receiver's closest known peers to the key.
    pub closest: Vec<PeerDescriptor>,
    /// Entries held by the receiver (fetch only).
    pub entries: Vec<DataEntry>,
    /// True when the receiver tombstoned at least one entry (delete only).
    pub deleted: bool,
}

/// Store one entry on a peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreDataRequest {
    pub key: Key,
    pub value: Vec<u8>,
    pub creator: NodeId,
    pub created_at_ms: u64,
    pub ttl_ms: u64,
}

impl StoreDataRequest {
    pub fn into_entry(self) -> DataEntry {
        DataEntry {
            key: self.key,
            value: self.value,
            creator: self.creator,
            created_at_ms: self.created_at_ms,
            stored_at_ms: self.created_at_ms,
            ttl_ms: self.ttl_ms,
            stale: false,
            deleted: false,
            storers: Vec::new(),
        }
    }
}

/// A payload travelling hop by hop toward the peer closest to `target`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutedMessage {
    /// Random id used to drop duplicates.
    pub request_id: u64,
    pub source: PeerDescriptor,
    pub target: NodeId,
    pub payload: Vec<u8>,
    /// Ids of every node that already forwarded this message.
    pub routing_path: Vec<NodeId>,
    /// Fallback peers the source can be reached through.
    pub reachable_through: Vec<PeerDescriptor>,
}

/// Every request a peer can serve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    ClosestPeers { target: NodeId, limit: usize },
    ClosestRingPeers { target: RingPosition, limit: usize },
    Ping,
    LeaveNotice,
    StoreData(StoreDataRequest),
    ReplicateData { entry: DataEntry },
    RecursiveOperation(RecursiveOperationRequest),
    RouteMessage(RoutedMessage),
    ExternalFetchData { key: Key },
    ExternalStoreData { key: Key, value: Vec<u8> },
}

impl RpcRequest {
    /// Operation name used in logs and error context.
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::ClosestPeers { .. } => "closest_peers",
            RpcRequest::ClosestRingPeers { .. } => "closest_ring_peers",
            RpcRequest::Ping => "ping",
            RpcRequest::LeaveNotice => "leave_notice",
            RpcRequest::StoreData(_) => "store_data",
            RpcRequest::ReplicateData { .. } => "replicate_data",
            RpcRequest::RecursiveOperation(_) => "recursive_operation",
            RpcRequest::RouteMessage(_) => "route_message",
            RpcRequest::ExternalFetchData { .. } => "external_fetch_data",
            RpcRequest::ExternalStoreData { .. } => "external_store_data",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Peers(Vec<PeerDescriptor>),
    Pong,
    Ack,
    Recursive(RecursiveOperationResponse),
    Routed(Option<RouteError>),
    Entries(Vec<DataEntry>),
    StoredAt(Vec<PeerDescriptor>),
    /// The handler failed; carries a human readable reason.
    Error(String),
}

/// Request envelope as it travels between peers of one service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rpc {
    pub service_id: String,
    pub from: PeerDescriptor,
    pub request: RpcRequest,
}
