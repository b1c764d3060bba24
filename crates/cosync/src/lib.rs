//! # cosync
//!
//! Local-first collaborative values: maps, lists, streams and binary
//! streams that every replica can edit offline and that converge once
//! replicas exchange their transactions.
//!
//! ## Overview
//!
//! A [`LocalNode`] holds the CoValues an identity has loaded, keeps them in
//! storage and syncs them with peers:
//!
//! - **CoValues**: append-only, signed session logs merged into a view
//! - **Groups**: roles and read keys decide which transactions count and
//!   who can decrypt them
//! - **Sync**: `load` / `known` / `content` / `done` messages over any
//!   transport
//! - **Storage**: SQLite or in-memory, written in order with corrections
//!   when a write assumed too much
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cosync::{LocalNode, NodeConfig};
//! use cosync::core::Privacy;
//! use cosync::store::{SqliteClient, AsyncStorage, StorageConfig};
//! use serde_json::json;
//!
//! async fn example() -> cosync::Result<()> {
//!     let storage = AsyncStorage::new(SqliteClient::open("cosync.db")?, StorageConfig::default());
//!     let node = LocalNode::create_account("Alice", Some(Arc::new(storage)), NodeConfig::default())?;
//!
//!     let group = node.create_group()?;
//!     let list = node.create_list(group)?;
//!     node.list_push(list, json!("milk"), Privacy::Private)?;
//!
//!     let mut updates = node.subscribe(list).await?;
//!     while let Some(content) = updates.next().await {
//!         println!("{}", content.to_json());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `cosync::core` - identifiers, crypto, session logs and merged views
//! - `cosync::perms` - groups, roles, keys and invites
//! - `cosync::store` - storage backends
//! - `cosync::sync` - protocol messages, peers and transports

pub mod account;
pub mod error;
pub mod node;
pub mod peers;
pub mod session_lock;
pub mod subscription;

// Re-export component crates
pub use cosync_core as core;
pub use cosync_perms as perms;
pub use cosync_store as store;
pub use cosync_sync as sync;

pub use error::{NodeError, Result};
pub use node::{LocalNode, NodeConfig};
pub use session_lock::SessionLock;
pub use subscription::Subscription;

// Re-export commonly used types
pub use cosync_core::{
    ActorId, AgentSecret, CoId, CoValueContent, CoValueHeader, CoValueType, Privacy, Ruleset,
    SessionId,
};
pub use cosync_perms::{Identity, ParentRole, Role};
pub use cosync_sync::{MemoryTransport, PeerId, PeerRole, Transport};
