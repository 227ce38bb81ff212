//! Node configuration.
//!
//! Every option has a default, so a `DhtConfig` can be deserialized from a
//! partial document. Durations are expressed in milliseconds on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{node_id_from_hex, NodeId, PeerDescriptor};
use crate::error::{DhtError, DhtResult};

pub const DEFAULT_SERVICE_ID: &str = "layer0";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Logical overlay this node participates in. Several overlays can share
    /// one physical transport as long as their service ids differ.
    pub service_id: String,
    /// Optional hex encoded node id. Must agree with the transport's local
    /// descriptor when both are given.
    pub node_id: Option<String>,
    pub region: u16,
    pub join_parallelism: usize,
    pub max_neighbor_list_size: usize,
    pub nodes_per_bucket: usize,
    pub join_no_progress_limit: usize,
    #[serde(with = "duration_ms")]
    pub join_timeout: Duration,
    pub peer_discovery_query_batch_size: usize,
    #[serde(with = "duration_ms")]
    pub store_highest_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub store_max_ttl: Duration,
    pub storage_redundancy_factor: usize,
    #[serde(with = "duration_ms")]
    pub rpc_request_timeout: Duration,
    pub max_connections: usize,
    pub periodic_neighbor_ping: bool,
    pub periodic_ring_ping: bool,
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    #[serde(with = "duration_ms")]
    pub ttl_sweep_interval: Duration,
    #[serde(with = "duration_ms")]
    pub neighbor_refresh_interval: Duration,
    #[serde(with = "duration_ms")]
    pub network_connectivity_timeout: Duration,
    pub entry_points: Vec<PeerDescriptor>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            service_id: DEFAULT_SERVICE_ID.to_string(),
            node_id: None,
            region: 0,
            join_parallelism: 3,
            max_neighbor_list_size: 200,
            nodes_per_bucket: 8,
            join_no_progress_limit: 4,
            join_timeout: Duration::from_secs(60),
            peer_discovery_query_batch_size: 5,
            store_highest_ttl: Duration::from_secs(60),
            store_max_ttl: Duration::from_secs(60),
            storage_redundancy_factor: 5,
            rpc_request_timeout: Duration::from_secs(5),
            max_connections: 80,
            periodic_neighbor_ping: true,
            periodic_ring_ping: false,
            ping_interval: Duration::from_secs(60),
            ttl_sweep_interval: Duration::from_secs(1),
            neighbor_refresh_interval: Duration::from_secs(60),
            network_connectivity_timeout: Duration::from_secs(10),
            entry_points: Vec::new(),
        }
    }
}

impl DhtConfig {
    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    pub fn with_entry_points(mut self, entry_points: Vec<PeerDescriptor>) -> Self {
        self.entry_points = entry_points;
        self
    }

    pub fn with_region(mut self, region: u16) -> Self {
        self.region = region;
        self
    }

    pub fn with_redundancy(mut self, factor: usize) -> Self {
        self.storage_redundancy_factor = factor;
        self
    }

    pub fn with_store_ttl(mut self, ttl: Duration) -> Self {
        self.store_highest_ttl = ttl;
        if self.store_max_ttl < ttl {
            self.store_max_ttl = ttl;
        }
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_request_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_nodes_per_bucket(mut self, k: usize) -> Self {
        self.nodes_per_bucket = k;
        self
    }

    pub fn with_periodic_ping(mut self, neighbors: bool, ring: bool) -> Self {
        self.periodic_neighbor_ping = neighbors;
        self.periodic_ring_ping = ring;
        self
    }

    /// Parsed form of [`DhtConfig::node_id`].
    pub fn parsed_node_id(&self) -> DhtResult<Option<NodeId>> {
        self.node_id.as_deref().map(node_id_from_hex).transpose()
    }

    /// Reject configurations that cannot produce a working node.
    pub fn validate(&self) -> DhtResult<()> {
        if self.service_id.is_empty() {
            return Err(DhtError::Config("service_id must not be empty".into()));
        }
        let positive = [
            ("join_parallelism", self.join_parallelism),
            ("max_neighbor_list_size", self.max_neighbor_list_size),
            ("nodes_per_bucket", self.nodes_per_bucket),
            ("join_no_progress_limit", self.join_no_progress_limit),
            (
                "peer_discovery_query_batch_size",
                self.peer_discovery_query_batch_size,
            ),
            ("storage_redundancy_factor", self.storage_redundancy_factor),
            ("max_connections", self.max_connections),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(DhtError::Config(format!("{name} must be greater than zero")));
        }
        let intervals = [
            ("rpc_request_timeout", self.rpc_request_timeout),
            ("join_timeout", self.join_timeout),
            ("ping_interval", self.ping_interval),
            ("ttl_sweep_interval", self.ttl_sweep_interval),
            ("neighbor_refresh_interval", self.neighbor_refresh_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(DhtError::Config(format!("{name} must be non-zero")));
        }
        if self.store_highest_ttl > self.store_max_ttl {
            return Err(DhtError::Config(format!(
                "store_highest_ttl ({:?}) exceeds store_max_ttl ({:?})",
                self.store_highest_ttl, self.store_max_ttl
            )));
        }
        self.parsed_node_id()?;
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
