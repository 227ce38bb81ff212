//! # layered-dht
//!
//! A Kademlia-style overlay node: peer discovery, a structured routing table,
//! multi-hop message forwarding between peers without a direct connection and
//! a replicated, ttl-bounded key/value store on top of that routing
//! structure. Next to the XOR metric the node keeps a second ring topology
//! ordered by region for region-aware contact selection.
//!
//! The crate is split into modules that mirror the node's components:
//!
//! - [`core`]: identifiers, distance metrics, peer descriptors and data entries.
//! - [`contact`] and [`routing`]: the distance-sorted and random contact lists
//!   and the k-bucket table.
//! - [`peer_manager`]: owns all contact lists and publishes membership events.
//! - [`lookup`]: the iterative walk every other algorithm is built on.
//! - [`discovery`]: joining the overlay and keeping neighbours fresh.
//! - [`router`]: forwarding messages toward the peer closest to a target.
//! - [`recursive`]: find-node, fetch and delete walks over arbitrary keys.
//! - [`store`] and [`store_manager`]: local storage and replication.
//! - [`hash_ring`]: consistent hashing of resource keys onto node ids.
//! - [`net`]: the transport traits and an in-process simulated network.
//! - [`protocol`]: the serde messages exchanged between peers.
//! - [`node`]: [`DhtNode`], which wires everything together.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use layered_dht::{
//!     derive_node_id, hash_key, DhtConfig, DhtNode, PeerDescriptor, SimulatedNetwork, Simulator,
//!     Transport,
//! };
//!
//! # async fn launch() -> layered_dht::DhtResult<()> {
//! let simulator = Simulator::new();
//! let local = PeerDescriptor::new(derive_node_id(b"node-0"), 0);
//! let network = Arc::new(SimulatedNetwork::new(&simulator, local.clone(), "layer0"));
//! let node = DhtNode::new(DhtConfig::default(), Transport::Owned(network))?;
//! node.start()?;
//! node.join(&[local]).await?;
//! node.store(hash_key(b"greeting"), b"hello".to_vec()).await?;
//! let entries = node.fetch(hash_key(b"greeting")).await?;
//! # let _ = entries;
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod contact;
pub mod core;
pub mod discovery;
pub mod error;
pub mod events;
pub mod hash_ring;
pub mod lookup;
pub mod net;
pub mod node;
pub mod peer_manager;
pub mod protocol;
pub mod recursive;
pub mod remote;
pub mod router;
pub mod routing;
mod server;
pub mod store;
pub mod store_manager;

pub use crate::config::{DhtConfig, DEFAULT_SERVICE_ID};
pub use crate::core::{
    derive_node_id, hash_key, random_node_id, ring_distance, ring_position, xor_distance,
    DataEntry, Key, NodeId, NodeType, PeerDescriptor,
};
pub use crate::error::{DhtError, DhtResult, RouteError};
pub use crate::events::NodeEvent;
pub use crate::hash_ring::{format_partition_key, ConsistentHashRing};
pub use crate::net::{DhtNetwork, RpcHandler, SimulatedNetwork, Simulator, TransportEvent};
pub use crate::node::{DhtNode, TelemetrySnapshot, Transport};
pub use crate::router::DeliveredMessage;
