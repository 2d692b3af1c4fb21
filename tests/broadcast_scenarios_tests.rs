//! End-to-end broadcast behavior on a simulated network
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use floodcast::node::{BroadcastNode, BroadcastValue, Message, NodeId, Payload};
use floodcast::settings::Settings;
use floodcast::transport::{MemoryClient, MemoryNetwork, MemoryTransport};

fn settings() -> Settings {
    Settings {
        retry_interval: Duration::from_secs(1),
        ..Settings::default()
    }
}

fn spawn_cluster(network: &MemoryNetwork, ids: &[&str]) -> HashMap<NodeId, Arc<BroadcastNode>> {
    ids.iter()
        .map(|id| {
            let node = network.add_node(*id, |transport| {
                Arc::new(BroadcastNode::new(transport, &settings()))
            });
            (NodeId::from(*id), node)
        })
        .collect()
}

/// Spawn one node and keep its transport for inspecting outstanding requests
fn spawn_tracked(network: &MemoryNetwork, id: &str) -> (Arc<BroadcastNode>, Arc<MemoryTransport>) {
    let mut endpoint = None;
    let node = network.add_node(id, |transport| {
        endpoint = Some(Arc::clone(&transport));
        Arc::new(BroadcastNode::new(transport, &settings()))
    });
    (node, endpoint.expect("transport handed to builder"))
}

fn topology(entries: &[(&str, Vec<&str>)]) -> HashMap<NodeId, Vec<NodeId>> {
    entries
        .iter()
        .map(|(node, neighbors)| {
            (
                NodeId::from(*node),
                neighbors.iter().map(|n| NodeId::from(*n)).collect(),
            )
        })
        .collect()
}

async fn install_topology(
    client: &MemoryClient,
    nodes: &[&str],
    topology: &HashMap<NodeId, Vec<NodeId>>,
) {
    for node in nodes {
        let reply = client
            .request(
                &NodeId::from(*node),
                Payload::Topology {
                    topology: topology.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.kind(), Some("topology_ok"));
    }
}

async fn broadcast(client: &MemoryClient, node: &str, value: BroadcastValue) {
    let reply = client
        .request(&NodeId::from(node), Payload::Broadcast { message: value })
        .await
        .unwrap();
    assert_eq!(reply.payload().unwrap(), Payload::BroadcastOk);
}

async fn read(client: &MemoryClient, node: &str) -> Vec<BroadcastValue> {
    let reply = client
        .request(&NodeId::from(node), Payload::Read)
        .await
        .unwrap();
    match reply.payload().unwrap() {
        Payload::ReadOk { messages } => messages,
        other => panic!("Expected read_ok, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_value_reaches_both_neighbors_then_task_ends() {
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, &["n1", "n2", "n3"]);
    let client = network.add_client("c1");
    install_topology(
        &client,
        &["n1", "n2", "n3"],
        &topology(&[("n1", vec!["n2", "n3"])]),
    )
    .await;

    broadcast(&client, "n1", 5).await;
    assert_eq!(read(&client, "n1").await, vec![5]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(read(&client, "n2").await, vec![5]);
    assert_eq!(read(&client, "n3").await, vec![5]);

    // The next round finds nothing pending and the task exits
    tokio::time::sleep(Duration::from_secs(1)).await;
    let n1 = &nodes[&NodeId::from("n1")];
    assert!(n1.disseminator().active().is_empty());
    let stats = n1.disseminator().stats();
    assert_eq!(stats.tasks_completed, 1);
    assert_eq!(stats.acks, 2);
    assert_eq!(stats.rounds, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_neighbor_gets_value_once_it_returns() {
    let network = MemoryNetwork::new();
    let (n1, n1_transport) = spawn_tracked(&network, "n1");
    let _peers = spawn_cluster(&network, &["n2", "n3"]);
    let client = network.add_client("c1");
    install_topology(
        &client,
        &["n1", "n2", "n3"],
        &topology(&[("n1", vec!["n2", "n3"])]),
    )
    .await;
    let n2 = NodeId::from("n2");

    network.isolate(&n2).unwrap();
    broadcast(&client, "n1", 7).await;

    // Rounds at 0s, 1s and 2s are all lost
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(n1.disseminator().is_active(7));
    assert_eq!(n1.disseminator().stats().rounds, 3);

    network.heal(&n2).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(read(&client, "n2").await, vec![7]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!n1.disseminator().is_active(7));
    let stats = n1.disseminator().stats();
    assert_eq!(stats.rounds, 4);
    assert_eq!(stats.acks, 2);
    assert_eq!(stats.tasks_completed, 1);
    // Requests lost during the outage leave nothing registered behind
    assert_eq!(n1_transport.correlator().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_same_value_from_client_and_peer_is_stored_once() {
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, &["n1", "n2"]);
    let client = network.add_client("c1");
    install_topology(
        &client,
        &["n1", "n2"],
        &topology(&[("n1", vec!["n2"]), ("n2", vec!["n1"])]),
    )
    .await;

    // n2 forwards to n1 while the client hands n1 the same value directly
    tokio::join!(broadcast(&client, "n1", 11), broadcast(&client, "n2", 11));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(read(&client, "n1").await, vec![11]);
    assert_eq!(read(&client, "n2").await, vec![11]);
    for node in nodes.values() {
        assert_eq!(node.disseminator().stats().tasks_started, 1);
        assert!(node.disseminator().active().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_arrivals_start_one_task() {
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, &["n1"]);
    let clients: Vec<MemoryClient> = (0..8)
        .map(|i| network.add_client(format!("c{}", i)))
        .collect();

    let requests: Vec<_> = clients
        .iter()
        .cloned()
        .map(|client| tokio::spawn(async move { broadcast(&client, "n1", 42).await }))
        .collect();
    for request in requests {
        request.await.unwrap();
    }

    let n1 = &nodes[&NodeId::from("n1")];
    assert_eq!(n1.store().len().unwrap(), 1);
    assert_eq!(n1.disseminator().stats().tasks_started, 1);
    assert_eq!(read(&clients[0], "n1").await, vec![42]);
}

#[tokio::test(start_paused = true)]
async fn test_running_task_keeps_its_topology_snapshot() {
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, &["n1", "n2", "n3"]);
    let client = network.add_client("c1");
    install_topology(
        &client,
        &["n1", "n2", "n3"],
        &topology(&[("n1", vec!["n2", "n3"])]),
    )
    .await;
    let n3 = NodeId::from("n3");

    network.isolate(&n3).unwrap();
    broadcast(&client, "n1", 1).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Drop n3 from n1's neighbors while the task for 1 still waits on it
    install_topology(&client, &["n1"], &topology(&[("n1", vec!["n2"])])).await;
    broadcast(&client, "n1", 2).await;
    network.heal(&n3).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(read(&client, "n2").await, vec![1, 2]);
    assert_eq!(read(&client, "n3").await, vec![1]);
    assert!(nodes[&NodeId::from("n1")].disseminator().active().is_empty());
}

/// Resend `payload` until a reply makes it back through a lossy network
async fn request_until_answered(client: &MemoryClient, node: &str, payload: Payload) -> Message {
    let dest = NodeId::from(node);
    for _ in 0..50 {
        let attempt = client.request(&dest, payload.clone());
        if let Ok(reply) = tokio::time::timeout(Duration::from_secs(2), attempt).await {
            return reply.unwrap();
        }
    }
    panic!("No reply from {} after 50 attempts", node);
}

#[tokio::test(start_paused = true)]
async fn test_lossy_line_topology_converges() {
    let ids = ["n1", "n2", "n3", "n4", "n5"];
    let network = MemoryNetwork::new();
    let _nodes = spawn_cluster(&network, &ids);
    let client = network.add_client("c1");
    install_topology(
        &client,
        &ids,
        &topology(&[
            ("n1", vec!["n2"]),
            ("n2", vec!["n1", "n3"]),
            ("n3", vec!["n2", "n4"]),
            ("n4", vec!["n3", "n5"]),
            ("n5", vec!["n4"]),
        ]),
    )
    .await;

    // Loss applies to client traffic and to every dissemination round
    network.set_loss_rate(0.3);
    for (i, node) in ids.iter().enumerate() {
        let value = 100 + i as BroadcastValue;
        let reply =
            request_until_answered(&client, node, Payload::Broadcast { message: value }).await;
        assert_eq!(reply.payload().unwrap(), Payload::BroadcastOk);
    }
    tokio::time::sleep(Duration::from_secs(60)).await;

    let expected: Vec<BroadcastValue> = (100..105).collect();
    for node in ids {
        match request_until_answered(&client, node, Payload::Read).await.payload().unwrap() {
            Payload::ReadOk { messages } => {
                assert_eq!(messages, expected, "node {} diverged", node)
            }
            other => panic!("Expected read_ok, got {:?}", other),
        }
    }
    assert!(network.dropped() > 0);
}
