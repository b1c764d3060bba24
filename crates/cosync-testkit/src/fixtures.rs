//! Test fixtures and helpers.
//!
//! Common setup code for unit and integration tests.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use cosync::{Identity, LocalNode, MemoryTransport, NodeConfig, PeerRole};
use cosync_core::{
    ActorId, AgentSecret, CoValueContent, CoValueCore, CoValueHeader, CoValueType,
    Ed25519PublicKey, Ruleset, SessionId, TransactionId, DEFAULT_MAX_RECOMMENDED_TX_SIZE,
};

/// An agent with one session, writing directly into cores.
pub struct TestAuthor {
    pub agent: AgentSecret,
    pub session: SessionId,
}

impl TestAuthor {
    /// Create an author with a random agent.
    pub fn new() -> Self {
        Self::from_agent(AgentSecret::generate())
    }

    /// Create with a deterministic agent from seed.
    pub fn with_seed(seed: u8) -> Self {
        Self::from_agent(AgentSecret::from_seeds(&[seed; 32], [seed ^ 0xff; 32]))
    }

    fn from_agent(agent: AgentSecret) -> Self {
        let session = SessionId::new_random(&ActorId::Agent(agent.id()));
        Self { agent, session }
    }

    pub fn actor(&self) -> ActorId {
        ActorId::Agent(self.agent.id())
    }

    /// Append a trusting transaction to `core` in this author's session.
    pub fn write(
        &self,
        core: &mut CoValueCore,
        changes: &[Value],
        made_at: i64,
    ) -> cosync_core::Result<TransactionId> {
        core.make_transaction(&self.session, self.agent.signer(), changes, made_at, None)
    }

    /// Signer lookup for applying this author's content.
    pub fn signers(&self) -> HashMap<SessionId, Ed25519PublicKey> {
        HashMap::from([(self.session.clone(), self.agent.signer().public_key())])
    }
}

impl Default for TestAuthor {
    fn default() -> Self {
        Self::new()
    }
}

/// Create multiple authors with distinct deterministic agents.
pub fn authors(count: usize) -> Vec<TestAuthor> {
    (0..count).map(|i| TestAuthor::with_seed(i as u8)).collect()
}

/// Signers of every author in `authors`.
pub fn signers_of(authors: &[TestAuthor]) -> HashMap<SessionId, Ed25519PublicKey> {
    authors.iter().flat_map(TestAuthor::signers).collect()
}

/// A fresh core anyone may write to.
pub fn open_core(value_type: CoValueType) -> cosync_core::Result<CoValueCore> {
    let header = CoValueHeader::new(value_type, Ruleset::UnsafeAllowAll, None);
    CoValueCore::new(header, DEFAULT_MAX_RECOMMENDED_TX_SIZE)
}

/// An empty core with the same header as `core`.
pub fn replica_of(core: &CoValueCore) -> cosync_core::Result<CoValueCore> {
    CoValueCore::from_received_header(
        core.id(),
        core.header().clone(),
        DEFAULT_MAX_RECOMMENDED_TX_SIZE,
    )
}

/// Merged view of a core whose transactions are all trusting and valid.
pub fn content_of(core: &CoValueCore) -> CoValueContent {
    let decoded = core.decoded_transactions(&|_| None);
    CoValueContent::build(core.id(), core.header(), &decoded)
}

pub fn content_json(core: &CoValueCore) -> Value {
    content_of(core).to_json()
}

// ─────────────────────────────────────────────────────────────────────────────
// Networks
// ─────────────────────────────────────────────────────────────────────────────

/// Connect `client` to `server` over an in-memory transport.
pub fn connect(client: &LocalNode, server: &LocalNode) {
    let (client_end, server_end) = MemoryTransport::pair();
    client.add_peer(client_end, PeerRole::Server);
    server.add_peer(server_end, PeerRole::Client);
}

/// A server node that every node made by the network syncs through.
///
/// Must be created inside a tokio runtime.
pub struct TestNetwork {
    pub server: LocalNode,
    config: NodeConfig,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::with_config(NodeConfig::default())
    }

    pub fn with_config(config: NodeConfig) -> Self {
        let server = LocalNode::new(
            Identity::agent(AgentSecret::generate()),
            None,
            config.clone(),
        );
        Self { server, config }
    }

    /// A bare agent node attached to the server.
    pub fn agent(&self) -> LocalNode {
        let node = LocalNode::new(
            Identity::agent(AgentSecret::generate()),
            None,
            self.config.clone(),
        );
        connect(&node, &self.server);
        node
    }

    /// A new account attached to the server.
    pub fn account(&self, name: &str) -> cosync::Result<LocalNode> {
        let node = LocalNode::create_account(name, None, self.config.clone())?;
        connect(&node, &self.server);
        Ok(node)
    }

    /// Wait until every node and the server have synced.
    pub async fn settle(&self, nodes: &[&LocalNode], timeout: Duration) -> cosync::Result<()> {
        for node in nodes {
            node.wait_for_sync(timeout).await?;
        }
        self.server.wait_for_sync(timeout).await
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}
