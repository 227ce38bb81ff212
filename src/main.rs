//! Demo binary for layered-dht.
//!
//! Spins up an in-process simulated network of `--nodes` nodes, joins them
//! through the first one, stores a value, fetches it back from another node
//! and then logs telemetry until interrupted.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=layered_dht=debug cargo run -- --nodes 16
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time;
use tracing::info;
use tracing_subscriber::EnvFilter;

use layered_dht::{
    derive_node_id, hash_key, DhtConfig, DhtNode, PeerDescriptor, SimulatedNetwork, Simulator,
    Transport,
};

#[derive(Debug, Parser)]
#[command(name = "layered-dht", about = "Run a simulated layered DHT overlay")]
struct Args {
    /// Number of nodes in the simulated network.
    #[arg(long, default_value_t = 12)]
    nodes: usize,
    /// Logical overlay to join.
    #[arg(long, default_value = layered_dht::DEFAULT_SERVICE_ID)]
    service_id: String,
    /// Region of every node.
    #[arg(long, default_value_t = 0)]
    region: u16,
    /// Replicas kept per key.
    #[arg(long, default_value_t = 5)]
    redundancy: usize,
    /// Ttl of stored values, in seconds.
    #[arg(long, default_value_t = 60)]
    ttl_secs: u64,
    /// Seconds between telemetry lines.
    #[arg(long, default_value_t = 10)]
    telemetry_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let nodes = args.nodes.max(1);
    let simulator = Simulator::new();
    let descriptors: Vec<PeerDescriptor> = (0..nodes)
        .map(|i| {
            PeerDescriptor::new(derive_node_id(format!("demo-node-{i}").as_bytes()), args.region)
                .with_endpoint(format!("sim://{i}"))
        })
        .collect();
    let entry_point = descriptors[0].clone();

    let mut dht_nodes = Vec::with_capacity(nodes);
    for descriptor in &descriptors {
        let network = Arc::new(SimulatedNetwork::new(&simulator, descriptor.clone(), &args.service_id));
        let config = DhtConfig::default()
            .with_service_id(args.service_id.clone())
            .with_region(args.region)
            .with_redundancy(args.redundancy)
            .with_store_ttl(Duration::from_secs(args.ttl_secs))
            .with_entry_points(vec![entry_point.clone()]);
        let node = DhtNode::new(config, Transport::Owned(network))?;
        node.start()?;
        dht_nodes.push(node);
    }
    for node in &dht_nodes {
        node.join(&[entry_point.clone()])
            .await
            .with_context(|| format!("node {} failed to join", hex::encode(&node.node_id()[..8])))?;
    }
    info!(nodes, service = %args.service_id, "overlay joined");

    let key = hash_key(b"demo-key");
    let stored_on = dht_nodes[0].store(key, b"hello overlay".to_vec()).await?;
    info!(replicas = stored_on.len(), "value stored");
    let reader = &dht_nodes[nodes - 1];
    let entries = reader.fetch(key).await?;
    for entry in &entries {
        info!(
            creator = %hex::encode(&entry.creator[..8]),
            value = %String::from_utf8_lossy(&entry.value),
            storers = entry.storers.len(),
            "fetched entry"
        );
    }

    let mut ticker = time::interval(Duration::from_secs(args.telemetry_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                for node in &dht_nodes {
                    let snapshot = node.telemetry_snapshot();
                    info!(
                        node = %hex::encode(&node.node_id()[..8]),
                        neighbors = snapshot.neighbors,
                        buckets = snapshot.bucket_contacts,
                        connections = snapshot.connections,
                        stored = snapshot.stored_entries,
                        routed = snapshot.messages_routed,
                        "telemetry"
                    );
                }
            }
        }
    }

    info!("shutting down");
    for node in &dht_nodes {
        node.stop().await;
    }
    Ok(())
}
