#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{bootstrap, make_descriptor, stop_all, test_config, TestNode};
use layered_dht::{hash_key, Simulator};

#[tokio::test]
async fn stored_value_survives_a_stopped_storer() {
    let simulator = Simulator::new();
    let nodes = bootstrap(&simulator, 10, test_config().with_redundancy(3)).await;
    let key = hash_key(b"survivor");

    let stored_on = nodes[0]
        .node
        .store(key, b"still here".to_vec())
        .await
        .expect("store");
    assert_eq!(stored_on.len(), 3);

    let storers: Vec<&TestNode> = stored_on
        .iter()
        .filter_map(|peer| nodes.iter().find(|n| n.id() == peer.node_id))
        .collect();
    let (victim, reader) = (storers[0], storers[1]);
    victim.node.stop().await;

    let entries = reader.node.fetch(key).await.expect("fetch");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, b"still here".to_vec());
    assert_eq!(entries[0].creator, nodes[0].id());
    assert!(!entries[0].deleted);

    let outsider = nodes
        .iter()
        .find(|n| !stored_on.iter().any(|p| p.node_id == n.id()))
        .expect("a node that does not hold the key");
    let remote_entries = outsider.node.fetch(key).await.expect("remote fetch");
    assert_eq!(remote_entries.len(), 1);
    assert!(!remote_entries[0].storers.is_empty());
    assert!(remote_entries[0].storers.len() <= 3);

    stop_all(&nodes).await;
}

#[tokio::test]
async fn entries_from_different_creators_coexist() {
    let simulator = Simulator::new();
    let nodes = bootstrap(&simulator, 6, test_config().with_redundancy(3)).await;
    let key = hash_key(b"shared");
    nodes[1].node.store(key, b"one".to_vec()).await.expect("store one");
    nodes[2].node.store(key, b"two".to_vec()).await.expect("store two");
    // Copies are versioned by their creation time in milliseconds.
    tokio::time::sleep(Duration::from_millis(5)).await;
    nodes[1].node.store(key, b"one again".to_vec()).await.expect("overwrite");

    let entries = nodes[4].node.fetch(key).await.expect("fetch");
    assert_eq!(entries.len(), 2);
    let from_one = entries
        .iter()
        .find(|e| e.creator == nodes[1].id())
        .expect("entry of node 1");
    assert_eq!(from_one.value, b"one again".to_vec());
    stop_all(&nodes).await;
}

#[tokio::test]
async fn expired_entries_are_not_fetched() {
    let simulator = Simulator::new();
    let config = test_config().with_store_ttl(Duration::from_millis(300));
    let nodes = bootstrap(&simulator, 5, config).await;
    let key = hash_key(b"short lived");

    nodes[0].node.store(key, b"gone soon".to_vec()).await.expect("store");
    assert_eq!(nodes[3].node.fetch(key).await.expect("fetch").len(), 1);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(nodes[3].node.fetch(key).await.expect("fetch").is_empty());
    for node in &nodes {
        assert_eq!(node.node.telemetry_snapshot().stored_entries, 0);
    }
    stop_all(&nodes).await;
}

#[tokio::test]
async fn delete_tombstones_the_creators_entries() {
    let simulator = Simulator::new();
    let nodes = bootstrap(&simulator, 6, test_config().with_redundancy(3)).await;
    let key = hash_key(b"to delete");
    nodes[0].node.store(key, b"temporary".to_vec()).await.expect("store");

    let not_creator = nodes[3].node.delete(key, true).await.expect("delete by stranger");
    assert!(not_creator.is_empty(), "only the creator may delete");
    let entries = nodes[5].node.fetch(key).await.expect("fetch");
    assert!(entries.iter().all(|e| !e.deleted));

    let deleted_on = nodes[0].node.delete(key, true).await.expect("delete");
    assert!(!deleted_on.is_empty());
    let entries = nodes[5].node.fetch(key).await.expect("fetch");
    assert_eq!(entries.len(), 1);
    assert!(entries[0].deleted);
    stop_all(&nodes).await;
}

#[tokio::test]
async fn walks_without_reachable_nodes_end_empty() {
    let simulator = Simulator::new();
    let config = test_config().with_entry_points(vec![make_descriptor(90), make_descriptor(91)]);
    let node = TestNode::new(&simulator, make_descriptor(1), config);
    // Until a join was attempted, data calls would go to an entry point.
    assert!(node.node.join(&[]).await.is_err());

    let started = tokio::time::Instant::now();
    let closest = node
        .node
        .find_closest_nodes(hash_key(b"anything"))
        .await
        .expect("find");
    assert!(closest.is_empty());
    assert!(node.node.fetch(hash_key(b"anything")).await.expect("fetch").is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));

    let stored_on = node
        .node
        .store(hash_key(b"local"), b"v".to_vec())
        .await
        .expect("store");
    assert_eq!(stored_on, vec![node.descriptor()]);
    node.node.stop().await;
}

#[tokio::test]
async fn find_closest_nodes_orders_by_distance() {
    let simulator = Simulator::new();
    let nodes = bootstrap(&simulator, 8, test_config()).await;
    let target = common::make_node_id(6);
    let closest = nodes[0].node.find_closest_nodes(target).await.expect("find");
    assert_eq!(closest.first().map(|p| p.node_id), Some(target));
    let distances: Vec<_> = closest
        .iter()
        .map(|p| layered_dht::xor_distance(&p.node_id, &target))
        .collect();
    assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
    stop_all(&nodes).await;
}

#[tokio::test]
async fn new_nearby_node_receives_replicas() {
    let simulator = Simulator::new();
    let nodes = bootstrap(&simulator, 4, test_config().with_redundancy(3)).await;
    let key = common::make_node_id(7);
    nodes[0].node.store(key, b"replicated".to_vec()).await.expect("store");

    // Id 7 itself is the closest possible node to the key.
    let newcomer = TestNode::new(&simulator, make_descriptor(7), test_config());
    newcomer
        .node
        .join(&[nodes[0].descriptor()])
        .await
        .expect("join");

    let received = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if newcomer.node.telemetry_snapshot().stored_entries > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(received.is_ok(), "newcomer never received a replica");
    newcomer.node.stop().await;
    stop_all(&nodes).await;
}

#[tokio::test]
async fn crashed_holder_is_replaced_by_the_next_closest_node() {
    let simulator = Simulator::new();
    let nodes = bootstrap(&simulator, 6, test_config().with_redundancy(2)).await;
    // Node 3 is the closest to the key and node 2 the second closest.
    let key = common::make_node_id(3);
    let stored_on = nodes[0]
        .node
        .store(key, b"keep two copies".to_vec())
        .await
        .expect("store");
    let mut holders: Vec<_> = stored_on.iter().map(|p| p.node_id).collect();
    holders.sort();
    assert_eq!(holders, vec![nodes[1].id(), nodes[2].id()]);
    assert_eq!(nodes[0].node.telemetry_snapshot().stored_entries, 0);

    simulator.set_failure(nodes[1].id(), true);
    // The walk runs into the crashed node, which drops it from node 3's table.
    nodes[2].node.find_closest_nodes(key).await.expect("find");

    let restored = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if nodes[0].node.telemetry_snapshot().stored_entries > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(restored.is_ok(), "no replacement copy was made");

    simulator.set_failure(nodes[1].id(), false);
    stop_all(&nodes).await;
}

#[tokio::test]
async fn node_that_has_not_joined_uses_its_entry_point_for_data() {
    let simulator = Simulator::new();
    let nodes = bootstrap(&simulator, 5, test_config().with_redundancy(2)).await;
    let config = test_config()
        .with_redundancy(2)
        .with_entry_points(vec![nodes[2].descriptor()]);
    let newcomer = TestNode::new(&simulator, make_descriptor(40), config);
    let key = hash_key(b"written before joining");

    let stored_on = newcomer
        .node
        .store(key, b"early".to_vec())
        .await
        .expect("store via entry point");
    assert_eq!(stored_on.len(), 2);
    let entries = newcomer.node.fetch(key).await.expect("fetch via entry point");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].creator, newcomer.id());
    let delegated: Vec<&str> = simulator
        .calls()
        .iter()
        .filter(|call| call.from == newcomer.id())
        .map(|call| call.operation)
        .collect();
    assert!(delegated.contains(&"external_store_data"));
    assert!(delegated.contains(&"external_fetch_data"));

    newcomer
        .node
        .join(&[])
        .await
        .expect("join through the configured entry point");
    simulator.clear_calls();
    let entries = newcomer.node.fetch(key).await.expect("fetch after join");
    assert_eq!(entries.len(), 1);
    assert!(simulator
        .calls()
        .iter()
        .all(|call| call.operation != "external_fetch_data"));

    newcomer.node.stop().await;
    stop_all(&nodes).await;
}
