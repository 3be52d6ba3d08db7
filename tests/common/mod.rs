// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared harness for integration tests: a pair of engines wired to
//! each other over loopback TCP, each backed by its own in-memory graph.

use graph_replication::{
    Credentials, GraphHost, InboundConfig, MemoryGraph, PeerConfig, PropertyMap, PropertyValue,
    QueueConfig, ReplicationConfig, ReplicationEngine, StableId, Transaction, TxOrigin,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub struct TestNode {
    pub graph: Arc<MemoryGraph>,
    pub engine: ReplicationEngine<MemoryGraph>,
}

impl TestNode {
    /// Commit a local transaction, as an application writer would.
    pub fn commit(&self, tx: Transaction) {
        self.graph
            .execute(TxOrigin::Local, tx)
            .expect("local commit failed");
    }
}

/// Reserve a loopback port by binding and dropping a listener.
async fn free_port() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn node_config(
    local: &str,
    peer: &str,
    listen: std::net::SocketAddr,
    peer_addr: std::net::SocketAddr,
) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(local, &peer_addr.to_string());
    config.peer = PeerConfig {
        node_id: peer.to_string(),
        address: peer_addr.to_string(),
        credentials: Credentials::for_testing(),
        connect_timeout: "500ms".to_string(),
    };
    config.inbound = InboundConfig {
        listen_addr: listen.to_string(),
        credentials: Credentials::for_testing(),
    };
    config.queue = QueueConfig { capacity: 64 };
    config
}

/// Build and start a bilateral pair. Both engines start concurrently;
/// the startup retry window covers whichever side binds second.
pub async fn start_pair() -> (TestNode, TestNode) {
    let addr_a = free_port().await;
    let addr_b = free_port().await;

    let graph_a = Arc::new(MemoryGraph::new());
    let graph_b = Arc::new(MemoryGraph::new());

    let engine_a = ReplicationEngine::new(
        node_config("node-a", "node-b", addr_a, addr_b),
        graph_a.clone(),
    );
    let engine_b = ReplicationEngine::new(
        node_config("node-b", "node-a", addr_b, addr_a),
        graph_b.clone(),
    );

    let (ra, rb) = tokio::join!(engine_a.start(), engine_b.start());
    ra.expect("engine a failed to start");
    rb.expect("engine b failed to start");

    (
        TestNode {
            graph: graph_a,
            engine: engine_a,
        },
        TestNode {
            graph: graph_b,
            engine: engine_b,
        },
    )
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(description: &str, cond: F) {
    let deadline = Duration::from_secs(5);
    let step = Duration::from_millis(10);
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(step).await;
    }
    panic!("timed out waiting for: {}", description);
}

/// Property map with a stable identifier plus extra string properties.
pub fn props(uuid: &str, extra: &[(&str, &str)]) -> PropertyMap {
    let mut map = PropertyMap::new();
    map.insert("uuid".to_string(), PropertyValue::from(uuid));
    for (k, v) in extra {
        map.insert(k.to_string(), PropertyValue::from(*v));
    }
    map
}

pub fn id(uuid: &str) -> StableId {
    StableId::from(uuid)
}
