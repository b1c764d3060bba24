//! Nodes backed by SQLite storage across restarts.

mod common;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use common::{agent_node, connect, eventually, SYNC_TIMEOUT};
use cosync::store::{AsyncStorage, SqliteClient, Storage, StorageConfig};
use cosync::{
    ActorId, AgentSecret, CoValueHeader, CoValueType, Identity, LocalNode, NodeConfig, NodeError,
    Privacy, Ruleset, SessionLock,
};

fn sqlite(path: &Path) -> Result<Arc<dyn Storage>> {
    let client = SqliteClient::open(path)?;
    Ok(Arc::new(AsyncStorage::new(client, StorageConfig::default())))
}

#[tokio::test]
async fn test_account_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("alice.db");

    let alice = LocalNode::create_account("Alice", Some(sqlite(&db)?), NodeConfig::default())?;
    let agent = alice.identity().agent.clone();
    let account = alice.account_id().ok_or_else(|| anyhow::anyhow!("no account"))?;
    let group = alice.create_group()?;
    let list = alice.create_list(group)?;
    for word in ["hello", "beautiful", "world"] {
        alice.list_push(list, json!(word), Privacy::Private)?;
    }
    alice.wait_for_sync(SYNC_TIMEOUT).await?;
    let before = alice.content(&list)?.to_json();
    drop(alice);

    let again = LocalNode::login(agent, account, sqlite(&db)?, NodeConfig::default()).await?;
    let after = again.load(list).await?.to_json();
    assert_eq!(before, after);
    assert_eq!(after, json!(["hello", "beautiful", "world"]));

    let profile = again
        .profile_of(&account)?
        .ok_or_else(|| anyhow::anyhow!("no profile"))?;
    let profile = again.load(profile).await?.to_json();
    assert_eq!(profile["name"], json!("Alice"));
    Ok(())
}

#[tokio::test]
async fn test_login_rejects_foreign_agent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("alice.db");

    let alice = LocalNode::create_account("Alice", Some(sqlite(&db)?), NodeConfig::default())?;
    let account = alice.account_id().ok_or_else(|| anyhow::anyhow!("no account"))?;
    alice.wait_for_sync(SYNC_TIMEOUT).await?;
    drop(alice);

    let result = LocalNode::login(
        AgentSecret::generate(),
        account,
        sqlite(&db)?,
        NodeConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(NodeError::InvalidOperation(_))));
    Ok(())
}

/// A server persists what clients push, and serves it after a restart.
#[tokio::test]
async fn test_server_serves_stored_content_after_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("server.db");

    let server = LocalNode::new(
        Identity::agent(AgentSecret::generate()),
        Some(sqlite(&db)?),
        NodeConfig::default(),
    );
    let writer = agent_node();
    connect(&writer, &server);

    let header = CoValueHeader::new(CoValueType::Map, Ruleset::UnsafeAllowAll, None);
    let map = writer.create_co_value(header)?;
    writer.map_set(map, "kept", json!("yes"), Privacy::Trusting)?;
    writer.wait_for_sync(SYNC_TIMEOUT).await?;
    server.wait_for_sync(SYNC_TIMEOUT).await?;
    drop(writer);
    drop(server);

    let server = LocalNode::new(
        Identity::agent(AgentSecret::generate()),
        Some(sqlite(&db)?),
        NodeConfig::default(),
    );
    let reader = agent_node();
    connect(&reader, &server);
    let content = reader.load(map).await?;
    assert_eq!(content.to_json()["kept"], json!("yes"));
    Ok(())
}

#[tokio::test]
async fn test_locked_session_is_reused_after_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("node.db");
    let locks = dir.path().join("sessions");

    let alice = LocalNode::create_account("Alice", Some(sqlite(&db)?), NodeConfig::default())?;
    let agent = alice.identity().agent.clone();
    let account = alice.account_id().ok_or_else(|| anyhow::anyhow!("no account"))?;
    let group = alice.create_group()?;
    let list = alice.create_list(group)?;
    alice.wait_for_sync(SYNC_TIMEOUT).await?;
    drop(alice);

    let lock = SessionLock::acquire(&locks, account, 0)?;
    let first_session = lock.session_id().clone();
    let node = LocalNode::with_session_lock(
        Identity::new(agent.clone(), ActorId::Account(account)),
        lock,
        Some(sqlite(&db)?),
        NodeConfig::default(),
    )?;
    assert_eq!(node.session_id(), &first_session);
    node.load(list).await?;
    node.list_push(list, json!(1), Privacy::Private)?;
    node.wait_for_sync(SYNC_TIMEOUT).await?;

    assert!(matches!(
        SessionLock::acquire(&locks, account, 0),
        Err(NodeError::SessionLocked { slot: 0, .. })
    ));
    drop(node);

    let mut reacquired = None;
    assert!(
        eventually(|| {
            reacquired = SessionLock::acquire(&locks, account, 0).ok();
            reacquired.is_some()
        })
        .await
    );
    let lock = reacquired.ok_or_else(|| anyhow::anyhow!("slot still locked"))?;
    assert_eq!(lock.session_id(), &first_session);

    let node = LocalNode::with_session_lock(
        Identity::new(agent, ActorId::Account(account)),
        lock,
        Some(sqlite(&db)?),
        NodeConfig::default(),
    )?;
    node.load(list).await?;
    node.list_push(list, json!(2), Privacy::Private)?;

    let known = node
        .known_state(&list)
        .ok_or_else(|| anyhow::anyhow!("list not loaded"))?;
    assert_eq!(known.count(&first_session), 2);
    assert_eq!(node.content(&list)?.to_json(), json!([1, 2]));
    Ok(())
}
