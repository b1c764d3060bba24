//! # cosync core
//!
//! Pure primitives for cosync: CoValue headers, signed session logs and the
//! merge algorithms that turn valid transactions into maps, lists and
//! streams.
//!
//! This crate contains no I/O, no storage, no networking. Permission checks
//! live in `cosync-perms`; this crate only verifies signatures and hashes.
//!
//! ## Key Types
//!
//! - [`CoValueCore`] - Header plus per-session logs of one CoValue
//! - [`SessionLog`] - Hash-chained, signed, append-only log
//! - [`ContentMessage`] - Unit of transfer between peers and into storage
//! - [`CoValueContent`] - Merged view (map, list, stream, binary stream)

pub mod cipher;
pub mod content;
pub mod covalue;
pub mod crypto;
pub mod error;
pub mod header;
pub mod ids;
pub mod known;
pub mod lookup;
pub mod message;
pub mod session;
pub mod transaction;

pub use cipher::{EncryptionNonce, KeyId, KeySecret, SealerPublic, SealerSecret};
pub use content::{
    BinaryCoStream, BinaryStreamInfo, BinaryStreamItem, CoList, CoMap, CoStream, CoValueContent,
    ListChange, MapChange,
};
pub use covalue::{collect_dependencies, CoValueCore, DEFAULT_MAX_RECOMMENDED_TX_SIZE};
pub use crypto::{AgentSecret, Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use error::{CoreError, Result};
pub use header::{CoValueHeader, CoValueType, Ruleset, Uniqueness};
pub use ids::{ActorId, AgentId, CoId, OpId, SessionId, TransactionId};
pub use known::KnownState;
pub use lookup::{resolve_signer, CoValueLookup};
pub use message::{ContentMessage, Priority, SessionContent};
pub use session::SessionLog;
pub use transaction::{DecodedTransaction, Privacy, Transaction};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
