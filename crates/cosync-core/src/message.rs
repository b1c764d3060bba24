//! Content messages: the unit of transfer between peers and into storage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::Ed25519Signature;
use crate::header::CoValueHeader;
use crate::ids::{CoId, SessionId};
use crate::known::KnownState;
use crate::transaction::Transaction;

/// Delivery priority. Groups and accounts go first since other values
/// cannot be verified or decrypted without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn for_header(header: &CoValueHeader) -> Self {
        if header.is_group() {
            Priority::High
        } else {
            Priority::Medium
        }
    }
}

/// A signed run of transactions for one session.
///
/// `after` is the index of the first transaction in `new_transactions`; the
/// signature covers the hash chain through the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContent {
    pub after: usize,
    pub new_transactions: Vec<Transaction>,
    pub last_signature: Ed25519Signature,
}

impl SessionContent {
    /// Session length once this piece is applied.
    pub fn end(&self) -> usize {
        self.after + self.new_transactions.len()
    }
}

/// Header and/or new transactions for one CoValue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMessage {
    pub id: CoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub priority: Priority,
    pub new: BTreeMap<SessionId, SessionContent>,
    /// Set on the first of a multi-part delivery: the known state the
    /// receiver will have once all parts arrive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_content_until: Option<KnownState>,
}

impl ContentMessage {
    pub fn new(id: CoId, priority: Priority) -> Self {
        Self {
            id,
            header: None,
            priority,
            new: BTreeMap::new(),
            expect_content_until: None,
        }
    }

    /// True if the message carries neither a header nor transactions.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.values().all(|s| s.new_transactions.is_empty())
    }

    /// Number of transactions carried.
    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }

    /// Known state after applying this message on top of its assumptions.
    pub fn known_after(&self) -> KnownState {
        KnownState {
            header: self.header.is_some(),
            sessions: self
                .new
                .iter()
                .map(|(session, content)| (session.clone(), content.end()))
                .collect(),
        }
    }
}
