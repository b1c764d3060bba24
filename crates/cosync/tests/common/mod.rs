//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use cosync::{AgentSecret, Identity, LocalNode, MemoryTransport, NodeConfig, PeerRole};

pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Send logs to the test output. Later calls in the same binary are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A node acting as a bare agent, without storage.
pub fn agent_node() -> LocalNode {
    init_tracing();
    LocalNode::new(
        Identity::agent(AgentSecret::generate()),
        None,
        NodeConfig::default(),
    )
}

pub fn account_node(name: &str) -> anyhow::Result<LocalNode> {
    init_tracing();
    Ok(LocalNode::create_account(name, None, NodeConfig::default())?)
}

/// Connect `client` to `server` over an in-memory transport.
pub fn connect(client: &LocalNode, server: &LocalNode) {
    let (client_end, server_end) = MemoryTransport::pair();
    client.add_peer(client_end, PeerRole::Server);
    server.add_peer(server_end, PeerRole::Client);
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
