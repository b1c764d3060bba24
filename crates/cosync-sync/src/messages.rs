//! Sync protocol message types.
//!
//! Messages are JSON objects tagged by `action`:
//!
//! ```text
//! {"action":"load",    "id":..., "header":false, "sessions":{}}
//! {"action":"known",   "id":..., "header":true,  "sessions":{...}, "isCorrection":true}
//! {"action":"content", "id":..., "header":{...}, "priority":"high", "new":{...}}
//! {"action":"done",    "id":...}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use cosync_core::{CoId, ContentMessage, KnownState};

/// Identifies a connected peer within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 16]);

impl PeerId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a random peer id.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer_{}", hex::encode(&self.0[..4]))
    }
}

/// A known state for one CoValue, as carried by `load` and `known`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownMessage {
    pub id: CoId,
    #[serde(flatten)]
    pub known: KnownState,
    /// Set when the sender holds less than we assumed and wants the gap.
    #[serde(
        rename = "isCorrection",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub is_correction: bool,
}

impl KnownMessage {
    pub fn new(id: CoId, known: KnownState) -> Self {
        Self {
            id,
            known,
            is_correction: false,
        }
    }

    pub fn correction(id: CoId, known: KnownState) -> Self {
        Self {
            id,
            known,
            is_correction: true,
        }
    }
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    /// Ask for a CoValue, telling the peer what we already hold.
    Load(KnownMessage),

    /// Tell the peer what we hold, in answer to `load` or `content`.
    Known(KnownMessage),

    /// Header and/or transactions.
    Content(ContentMessage),

    /// We are no longer interested in updates to this CoValue.
    Done { id: CoId },
}

impl SyncMessage {
    /// The CoValue this message is about.
    pub fn id(&self) -> CoId {
        match self {
            SyncMessage::Load(m) | SyncMessage::Known(m) => m.id,
            SyncMessage::Content(m) => m.id,
            SyncMessage::Done { id } => *id,
        }
    }

    /// The action name, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known(m) if m.is_correction => "known(correction)",
            SyncMessage::Known(_) => "known",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done { .. } => "done",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
