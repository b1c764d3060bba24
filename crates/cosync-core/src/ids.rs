//! Strong identifier types.
//!
//! All identifiers are newtypes with a prefixed text form. The text form is
//! what appears on the wire, in storage and as map keys inside groups.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cipher::SealerPublic;
use crate::crypto::{decode_prefixed, Blake3Hash, Ed25519PublicKey};
use crate::error::{CoreError, Result};
use crate::header::CoValueHeader;

/// A CoValue identifier: `co_z<hex blake3(header json)>`.
///
/// Two peers that build the same header derive the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoId(pub [u8; 32]);

impl CoId {
    const PREFIX: &'static str = "co_z";

    /// Derive the id of a header.
    pub fn from_header(header: &CoValueHeader) -> Result<Self> {
        let bytes =
            serde_json::to_vec(header).map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(Self(Blake3Hash::hash(&bytes).0))
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.to_hex())
    }
}

impl FromStr for CoId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        decode_prefixed(s, Self::PREFIX).map(Self)
    }
}

impl TryFrom<String> for CoId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CoId> for String {
    fn from(id: CoId) -> Self {
        id.to_string()
    }
}

/// Public identity of an agent: `sealer_z<hex>/signer_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId {
    sealer: SealerPublic,
    signer: Ed25519PublicKey,
}

impl AgentId {
    pub fn new(sealer: SealerPublic, signer: Ed25519PublicKey) -> Self {
        Self { sealer, signer }
    }

    pub fn sealer(&self) -> SealerPublic {
        self.sealer
    }

    pub fn signer(&self) -> Ed25519PublicKey {
        self.signer
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", &self.signer.to_hex()[..16])
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sealer, self.signer)
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (sealer, signer) = s.split_once('/').ok_or(CoreError::InvalidId {
            value: s.to_string(),
            reason: "missing '/' separator",
        })?;
        Ok(Self {
            sealer: sealer.parse()?,
            signer: signer.parse()?,
        })
    }
}

impl TryFrom<String> for AgentId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.to_string()
    }
}

/// Whoever authors a session: an account (by its CoId) or a bare agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActorId {
    Account(CoId),
    Agent(AgentId),
}

impl ActorId {
    pub fn as_account(&self) -> Option<CoId> {
        match self {
            ActorId::Account(id) => Some(*id),
            ActorId::Agent(_) => None,
        }
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::Account(id) => write!(f, "Account({:?})", id),
            ActorId::Agent(id) => write!(f, "{:?}", id),
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::Account(id) => write!(f, "{}", id),
            ActorId::Agent(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for ActorId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with(CoId::PREFIX) {
            s.parse().map(ActorId::Account)
        } else {
            s.parse().map(ActorId::Agent)
        }
    }
}

impl TryFrom<String> for ActorId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ActorId> for String {
    fn from(id: ActorId) -> Self {
        id.to_string()
    }
}

impl From<AgentId> for ActorId {
    fn from(id: AgentId) -> Self {
        ActorId::Agent(id)
    }
}

/// A session: `<actor>_session_z<hex>`.
///
/// Ordered by its text form, which is the tie-break used when merging
/// transactions. The actor is parsed once on construction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId {
    text: String,
    actor: ActorId,
}

impl SessionId {
    const SEPARATOR: &'static str = "_session_z";

    /// A fresh session for `actor` with a random suffix.
    pub fn new_random(actor: &ActorId) -> Self {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            text: format!("{}{}{}", actor, Self::SEPARATOR, hex::encode(nonce)),
            actor: *actor,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The actor that owns this session.
    pub fn actor(&self) -> ActorId {
        self.actor
    }

    fn suffix(&self) -> &str {
        self.text.rsplit(Self::SEPARATOR).next().unwrap_or("")
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:?}, {})", self.actor, self.suffix())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidId {
            value: s.to_string(),
            reason: "expected <actor>_session_z<hex>",
        };
        let (actor, suffix) = s.rsplit_once(Self::SEPARATOR).ok_or_else(invalid)?;
        if suffix.is_empty() || hex::decode(suffix).is_err() {
            return Err(invalid());
        }
        let actor = actor.parse().map_err(|_| invalid())?;
        Ok(Self {
            text: s.to_string(),
            actor,
        })
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.text
    }
}

/// Position of a transaction: (session, index within that session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: usize,
}

impl TransactionId {
    pub fn new(session_id: SessionId, tx_index: usize) -> Self {
        Self {
            session_id,
            tx_index,
        }
    }
}

/// Position of one change inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: usize,
    #[serde(rename = "changeIdx")]
    pub change_idx: usize,
}

impl OpId {
    pub fn new(tx: &TransactionId, change_idx: usize) -> Self {
        Self {
            session_id: tx.session_id.clone(),
            tx_index: tx.tx_index,
            change_idx,
        }
    }
}
