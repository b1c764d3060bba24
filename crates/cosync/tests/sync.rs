//! Sync between nodes over in-memory transports.

mod common;

use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use common::{agent_node, connect, eventually, SYNC_TIMEOUT};
use cosync::core::{CoValueCore, MapChange, DEFAULT_MAX_RECOMMENDED_TX_SIZE};
use cosync::sync::{KnownMessage, SyncConfig, SyncMessage};
use cosync::{
    ActorId, AgentSecret, CoId, CoValueHeader, CoValueType, Identity, LocalNode, MemoryTransport,
    NodeConfig, NodeError, PeerRole, Privacy, Ruleset, SessionId, Transport,
};

fn open_header(value_type: CoValueType) -> CoValueHeader {
    CoValueHeader::new(value_type, Ruleset::UnsafeAllowAll, None)
}

fn json_of(node: &LocalNode, id: &CoId) -> serde_json::Value {
    node.content(id).map(|c| c.to_json()).unwrap_or_default()
}

#[tokio::test]
async fn test_concurrent_map_edits_converge() -> Result<()> {
    let a = agent_node();
    let b = agent_node();
    connect(&a, &b);

    let map = a.create_co_value(open_header(CoValueType::Map))?;
    a.map_set(map, "color", json!("red"), Privacy::Trusting)?;
    a.wait_for_sync(SYNC_TIMEOUT).await?;
    assert!(b.has(&map));

    a.map_set(map, "from_a", json!(1), Privacy::Trusting)?;
    b.map_set(map, "from_b", json!(2), Privacy::Trusting)?;
    b.map_set(map, "color", json!("blue"), Privacy::Trusting)?;
    a.wait_for_sync(SYNC_TIMEOUT).await?;
    b.wait_for_sync(SYNC_TIMEOUT).await?;

    assert!(eventually(|| json_of(&a, &map) == json_of(&b, &map)).await);
    let content = json_of(&a, &map);
    assert_eq!(content["from_a"], json!(1));
    assert_eq!(content["from_b"], json!(2));
    Ok(())
}

#[tokio::test]
async fn test_receiver_counts_valid_transactions_without_reading() -> Result<()> {
    let server = agent_node();
    let client = agent_node();
    connect(&client, &server);

    let map = client.create_co_value(open_header(CoValueType::Map))?;
    for i in 0..3 {
        client.map_set(map, "n", json!(i), Privacy::Trusting)?;
    }
    client.wait_for_sync(SYNC_TIMEOUT).await?;

    assert!(eventually(|| server.total_valid_transactions(&map) == Some(3)).await);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_list_inserts_keep_anchors() -> Result<()> {
    let a = agent_node();
    let b = agent_node();
    connect(&a, &b);

    let list = a.create_co_value(open_header(CoValueType::List))?;
    a.list_push(list, json!("first"), Privacy::Trusting)?;
    a.list_push(list, json!("second"), Privacy::Trusting)?;
    a.wait_for_sync(SYNC_TIMEOUT).await?;

    a.list_append(list, json!("from a"), 1, Privacy::Trusting)?;
    b.list_append(list, json!("from b"), 1, Privacy::Trusting)?;
    a.wait_for_sync(SYNC_TIMEOUT).await?;
    b.wait_for_sync(SYNC_TIMEOUT).await?;

    assert!(eventually(|| json_of(&a, &list) == json_of(&b, &list)).await);
    let items = json_of(&a, &list);
    let items = items.as_array().cloned().unwrap_or_default();
    assert_eq!(items.len(), 4);
    assert_eq!(items[0], json!("first"));
    assert_eq!(items[1], json!("second"));
    assert!(items.contains(&json!("from a")));
    assert!(items.contains(&json!("from b")));
    Ok(())
}

#[tokio::test]
async fn test_server_relays_between_clients() -> Result<()> {
    let server = agent_node();
    let a = agent_node();
    let c = agent_node();
    connect(&a, &server);
    connect(&c, &server);

    let map = a.create_co_value(open_header(CoValueType::Map))?;
    a.map_set(map, "hello", json!("world"), Privacy::Trusting)?;
    a.wait_for_sync(SYNC_TIMEOUT).await?;

    let content = c.load(map).await?;
    assert_eq!(content.to_json()["hello"], json!("world"));

    let mut updates = c.subscribe(map).await?;
    a.map_set(map, "later", json!(true), Privacy::Trusting)?;

    let seen = tokio::time::timeout(SYNC_TIMEOUT, async {
        while let Some(content) = updates.next().await {
            if content.to_json()["later"] == json!(true) {
                return true;
            }
        }
        false
    })
    .await?;
    assert!(seen);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_peer_loads_long_history() -> Result<()> {
    let a = agent_node();
    let b = agent_node();

    let list = a.create_co_value(open_header(CoValueType::List))?;
    for n in 0..40 {
        a.list_push(list, json!(n), Privacy::Trusting)?;
    }
    connect(&b, &a);

    let content = b.load(list).await?;
    assert_eq!(content.to_json(), json_of(&a, &list));
    assert_eq!(b.known_state(&list).map(|k| k.total()), Some(40));
    Ok(())
}

#[tokio::test]
async fn test_load_unknown_value_from_peer_is_unavailable() -> Result<()> {
    let server = agent_node();
    let client = agent_node();
    connect(&client, &server);

    let missing = CoId([7; 32]);
    let started = tokio::time::Instant::now();
    let result = client.load(missing).await;
    assert!(matches!(result, Err(NodeError::Unavailable(id)) if id == missing));
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn test_load_times_out_when_peer_is_silent() -> Result<()> {
    let config = NodeConfig {
        sync: SyncConfig {
            load_timeout: Duration::from_millis(100),
            ..SyncConfig::default()
        },
        ..NodeConfig::default()
    };
    let node = LocalNode::new(Identity::agent(AgentSecret::generate()), None, config);
    let (ours, theirs) = MemoryTransport::pair();
    node.add_peer(ours, PeerRole::Server);

    let missing = CoId([9; 32]);
    let result = node.load(missing).await;
    assert!(matches!(result, Err(NodeError::Unavailable(id)) if id == missing));

    match theirs.recv().await? {
        SyncMessage::Load(request) => {
            assert_eq!(request.id, missing);
            assert!(!request.known.header);
        }
        other => panic!("expected load, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_wait_for_sync_times_out_without_ack() -> Result<()> {
    let node = agent_node();
    let (ours, _theirs) = MemoryTransport::pair();
    node.add_peer(ours, PeerRole::Server);

    let map = node.create_co_value(open_header(CoValueType::Map))?;
    node.map_set(map, "unacked", json!(true), Privacy::Trusting)?;
    let result = node.wait_for_sync(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(NodeError::Timeout(_))));
    Ok(())
}

/// A content message that skips transactions gets a correction back, and
/// the full content gets an acknowledgement.
#[tokio::test]
async fn test_gap_answered_with_correction() -> Result<()> {
    let node = agent_node();
    let (ours, theirs) = MemoryTransport::pair();
    node.add_peer(ours, PeerRole::Client);

    let author = AgentSecret::generate();
    let session = SessionId::new_random(&ActorId::Agent(author.id()));
    let mut source =
        CoValueCore::new(open_header(CoValueType::Map), DEFAULT_MAX_RECOMMENDED_TX_SIZE)?;
    source.make_transaction(&session, author.signer(), &[MapChange::set("n", json!(1))], 1, None)?;
    let first = source.known_state();
    source.make_transaction(&session, author.signer(), &[MapChange::set("n", json!(2))], 2, None)?;

    let mut ahead = source.new_content_since(Some(&first)).remove(0);
    ahead.header = Some(source.header().clone());
    theirs.send(SyncMessage::Content(ahead)).await?;

    match theirs.recv().await? {
        SyncMessage::Known(known) => {
            assert!(known.is_correction);
            assert!(known.known.header);
            assert_eq!(known.known.count(&session), 0);
        }
        other => panic!("expected correction, got {:?}", other),
    }

    let full = source.new_content_since(None).remove(0);
    theirs.send(SyncMessage::Content(full)).await?;
    match theirs.recv().await? {
        SyncMessage::Known(known) => {
            assert!(!known.is_correction);
            assert_eq!(known.known.count(&session), 2);
        }
        other => panic!("expected ack, got {:?}", other),
    }
    assert_eq!(json_of(&node, &source.id())["n"], json!(2));
    Ok(())
}

#[tokio::test]
async fn test_content_without_header_for_unknown_value() -> Result<()> {
    let node = agent_node();
    let (ours, theirs) = MemoryTransport::pair();
    node.add_peer(ours, PeerRole::Client);

    let author = AgentSecret::generate();
    let session = SessionId::new_random(&ActorId::Agent(author.id()));
    let mut source =
        CoValueCore::new(open_header(CoValueType::Map), DEFAULT_MAX_RECOMMENDED_TX_SIZE)?;
    source.make_transaction(&session, author.signer(), &[MapChange::set("n", json!(1))], 1, None)?;

    let mut headless = source.new_content_since(None).remove(0);
    headless.header = None;
    theirs.send(SyncMessage::Content(headless)).await?;

    match theirs.recv().await? {
        SyncMessage::Known(known) => {
            assert!(known.is_correction);
            assert!(!known.known.header);
        }
        other => panic!("expected correction, got {:?}", other),
    }
    assert!(!node.has(&source.id()));
    Ok(())
}

#[tokio::test]
async fn test_load_request_answered_with_known_and_content() -> Result<()> {
    let node = agent_node();
    let map = node.create_co_value(open_header(CoValueType::Map))?;
    node.map_set(map, "k", json!("v"), Privacy::Trusting)?;

    let (ours, theirs) = MemoryTransport::pair();
    node.add_peer(ours, PeerRole::Client);
    theirs
        .send(SyncMessage::Load(KnownMessage::new(map, Default::default())))
        .await?;

    let mut saw_known = false;
    let mut saw_content = false;
    while !(saw_known && saw_content) {
        match theirs.recv_timeout(SYNC_TIMEOUT).await? {
            Some(SyncMessage::Known(known)) if known.id == map => {
                assert!(known.known.header);
                saw_known = true;
            }
            Some(SyncMessage::Content(content)) if content.id == map => {
                assert!(content.header.is_some());
                assert_eq!(content.transaction_count(), 1);
                saw_content = true;
            }
            Some(_) => {}
            None => panic!("no answer to load"),
        }
    }
    Ok(())
}
