//! Known state: how much of a CoValue a party holds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::SessionId;

/// Whether the header is held, and how many transactions per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub header: bool,
    pub sessions: BTreeMap<SessionId, usize>,
}

impl KnownState {
    /// Nothing known, not even the header.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Transactions known for `session` (0 if none).
    pub fn count(&self, session: &SessionId) -> usize {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Merge another known state in, taking the maximum per session.
    pub fn combine(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, &count) in &other.sessions {
            let entry = self.sessions.entry(session.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Raise one session's count, never lowering it.
    pub fn advance(&mut self, session: &SessionId, count: usize) {
        let entry = self.sessions.entry(session.clone()).or_insert(0);
        *entry = (*entry).max(count);
    }

    /// True if `other` holds everything this state holds.
    pub fn is_covered_by(&self, other: &KnownState) -> bool {
        (!self.header || other.header)
            && self
                .sessions
                .iter()
                .all(|(session, &count)| other.count(session) >= count)
    }

    /// Total transaction count across sessions.
    pub fn total(&self) -> usize {
        self.sessions.values().sum()
    }
}
