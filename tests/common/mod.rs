#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use layered_dht::{
    DhtConfig, DhtNode, NodeEvent, NodeId, PeerDescriptor, SimulatedNetwork, Simulator, Transport,
};
use tokio::sync::broadcast;

pub const SERVICE: &str = "layer0";

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_descriptor(index: u32) -> PeerDescriptor {
    PeerDescriptor::new(make_node_id(index), 0).with_endpoint(format!("sim://{index}"))
}

/// Short timeouts and no periodic pings, so tests stay fast and quiet.
pub fn test_config() -> DhtConfig {
    DhtConfig {
        rpc_request_timeout: Duration::from_millis(500),
        join_timeout: Duration::from_secs(5),
        ttl_sweep_interval: Duration::from_millis(50),
        network_connectivity_timeout: Duration::from_secs(2),
        periodic_neighbor_ping: false,
        periodic_ring_ping: false,
        ..DhtConfig::default()
    }
}

pub struct TestNode {
    pub node: DhtNode<SimulatedNetwork>,
    pub network: Arc<SimulatedNetwork>,
}

impl TestNode {
    pub fn new(simulator: &Arc<Simulator>, descriptor: PeerDescriptor, config: DhtConfig) -> Self {
        let network = Arc::new(SimulatedNetwork::new(simulator, descriptor, &config.service_id));
        Self::with_transport(network.clone(), Transport::Owned(network), config)
    }

    pub fn with_transport(
        network: Arc<SimulatedNetwork>,
        transport: Transport<SimulatedNetwork>,
        config: DhtConfig,
    ) -> Self {
        let node = DhtNode::new(config, transport).expect("valid test config");
        node.start().expect("node starts");
        Self { node, network }
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        self.node.local_peer_descriptor()
    }

    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }
}

/// Start `count` nodes and join them one after another through the first.
pub async fn bootstrap(simulator: &Arc<Simulator>, count: u32, config: DhtConfig) -> Vec<TestNode> {
    let nodes: Vec<TestNode> = (1..=count)
        .map(|index| TestNode::new(simulator, make_descriptor(index), config.clone()))
        .collect();
    let entry = nodes[0].descriptor();
    for node in &nodes {
        node.node
            .join(&[entry.clone()])
            .await
            .expect("join through the first node");
    }
    nodes
}

pub async fn stop_all(nodes: &[TestNode]) {
    for node in nodes {
        node.node.stop().await;
    }
}

/// Wait for the first event matching `wanted`, up to `limit`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    limit: Duration,
    wanted: impl Fn(&NodeEvent) -> bool,
) -> bool {
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}
