//! CoValueCore: the header plus all session logs of one CoValue.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

use crate::cipher::{KeyId, KeySecret};
use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::{CoreError, Result};
use crate::header::{CoValueHeader, Ruleset};
use crate::ids::{ActorId, CoId, SessionId, TransactionId};
use crate::known::KnownState;
use crate::message::{ContentMessage, Priority};
use crate::session::SessionLog;
use crate::transaction::{DecodedTransaction, Transaction};

/// Default checkpoint threshold for session signatures (100 KiB).
pub const DEFAULT_MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// A CoValue's verified state.
#[derive(Debug, Clone)]
pub struct CoValueCore {
    id: CoId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
    max_tx_size: usize,
    valid_seen: HashSet<TransactionId>,
}

impl CoValueCore {
    /// Create a core for a new header; the id is derived from it.
    pub fn new(header: CoValueHeader, max_tx_size: usize) -> Result<Self> {
        let id = CoId::from_header(&header)?;
        Ok(Self::with_id(id, header, max_tx_size))
    }

    /// Create a core for a header received for `id`, checking that it hashes to `id`.
    pub fn from_received_header(
        id: CoId,
        header: CoValueHeader,
        max_tx_size: usize,
    ) -> Result<Self> {
        if CoId::from_header(&header)? != id {
            return Err(CoreError::IdMismatch { expected: id });
        }
        Ok(Self::with_id(id, header, max_tx_size))
    }

    fn with_id(id: CoId, header: CoValueHeader, max_tx_size: usize) -> Self {
        Self {
            id,
            header,
            sessions: BTreeMap::new(),
            max_tx_size,
            valid_seen: HashSet::new(),
        }
    }

    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, SessionLog> {
        &self.sessions
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(id, log)| (id.clone(), log.len()))
                .collect(),
        }
    }

    /// Total transactions held across sessions.
    pub fn transaction_count(&self) -> usize {
        self.sessions.values().map(SessionLog::len).sum()
    }

    /// Append transactions received for `session`. See [`SessionLog::try_add`].
    pub fn try_add_transactions(
        &mut self,
        session: &SessionId,
        after: usize,
        transactions: &[Transaction],
        signature: &Ed25519Signature,
        signer: &Ed25519PublicKey,
    ) -> Result<usize> {
        let max_tx_size = self.max_tx_size;
        let log = self.sessions.entry(session.clone()).or_default();
        let result = log.try_add(session, after, transactions, signature, signer, max_tx_size);
        if log.is_empty() {
            self.sessions.remove(session);
        }
        result
    }

    /// Make, sign and append a transaction in our own `session`.
    ///
    /// With a key the transaction is private, otherwise trusting.
    pub fn make_transaction(
        &mut self,
        session: &SessionId,
        keypair: &Keypair,
        changes: &[Value],
        made_at: i64,
        key: Option<&KeySecret>,
    ) -> Result<TransactionId> {
        let tx_id = TransactionId::new(session.clone(), self.session(session).map_or(0, SessionLog::len));
        let transaction = match key {
            Some(key) => Transaction::private(made_at, changes, key, &self.id, &tx_id)?,
            None => Transaction::trusting(made_at, changes)?,
        };
        let max_tx_size = self.max_tx_size;
        self.sessions
            .entry(session.clone())
            .or_default()
            .add_local(transaction, keypair, max_tx_size)?;
        Ok(tx_id)
    }

    /// Everything we hold beyond `known`, as content messages.
    ///
    /// The first message carries the header if `known` lacks it, plus the
    /// first piece of every session; later messages carry the remaining
    /// pieces in order. If there is more than one message, the first is
    /// tagged with the final known state.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Vec<ContentMessage> {
        let priority = Priority::for_header(&self.header);
        let mut messages: Vec<ContentMessage> = Vec::new();

        let mut first = ContentMessage::new(self.id, priority);
        if !known.map_or(false, |k| k.header) {
            first.header = Some(self.header.clone());
        }
        messages.push(first);

        for (session, log) in &self.sessions {
            let from = known.map_or(0, |k| k.count(session));
            for (n, piece) in log.content_since(from).into_iter().enumerate() {
                if messages.len() <= n {
                    messages.push(ContentMessage::new(self.id, priority));
                }
                messages[n].new.insert(session.clone(), piece);
            }
        }

        if messages.len() > 1 {
            messages[0].expect_content_until = Some(self.known_state());
        }
        messages.retain(|m| !m.is_empty());
        messages
    }

    /// CoValues that must be loaded to verify and interpret this one.
    pub fn depended_on(&self) -> BTreeSet<CoId> {
        collect_dependencies(
            &self.id,
            &self.header,
            self.sessions.keys(),
            self.sessions.values().flat_map(|log| log.transactions()),
        )
    }

    /// All transactions in merge order, decrypted where a key is available.
    ///
    /// Trusting transactions with malformed change lists are logged and
    /// dropped. Private transactions without an available key are kept with
    /// `changes: None`.
    pub fn decoded_transactions(
        &self,
        key_for: &dyn Fn(&KeyId) -> Option<KeySecret>,
    ) -> Vec<DecodedTransaction> {
        let mut decoded = Vec::with_capacity(self.transaction_count());
        for (session, log) in &self.sessions {
            let author = session.actor();
            for (index, tx) in log.transactions().iter().enumerate() {
                let id = TransactionId::new(session.clone(), index);
                if let Some(d) = self.decode_one(id, author, tx, key_for) {
                    decoded.push(d);
                }
            }
        }
        decoded.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        decoded
    }

    fn decode_one(
        &self,
        id: TransactionId,
        author: ActorId,
        tx: &Transaction,
        key_for: &dyn Fn(&KeyId) -> Option<KeySecret>,
    ) -> Option<DecodedTransaction> {
        let changes = match tx {
            Transaction::Trusting { .. } => match tx.trusting_changes() {
                Some(Ok(changes)) => Some(changes),
                Some(Err(e)) => {
                    warn!("Malformed changes in {} {:?}: {}", self.id, id, e);
                    return None;
                }
                None => None,
            },
            Transaction::Private { key_used, .. } => match key_for(key_used) {
                Some(key) => match tx.decrypt_changes(&key, &self.id, &id) {
                    Ok(changes) => Some(changes),
                    Err(e) => {
                        warn!("Failed to decrypt {} {:?}: {}", self.id, id, e);
                        return None;
                    }
                },
                None => {
                    debug!("No key {} for {} {:?}", key_used, self.id, id);
                    None
                }
            },
        };
        Some(DecodedTransaction {
            id,
            author,
            made_at: tx.made_at(),
            changes,
        })
    }

    /// Record transactions found valid; returns the running total.
    ///
    /// The total only counts distinct transactions, so it never decreases.
    pub fn record_valid<'a>(&mut self, ids: impl IntoIterator<Item = &'a TransactionId>) -> usize {
        for id in ids {
            if !self.valid_seen.contains(id) {
                self.valid_seen.insert(id.clone());
            }
        }
        self.valid_seen.len()
    }

    pub fn total_valid_transactions(&self) -> usize {
        self.valid_seen.len()
    }
}

/// Dependencies of a CoValue from its header, sessions and trusting changes.
///
/// Covers the owning group, `parent_<group>` entries of groups, and the
/// accounts that own sessions.
pub fn collect_dependencies<'a>(
    id: &CoId,
    header: &CoValueHeader,
    sessions: impl Iterator<Item = &'a SessionId>,
    transactions: impl Iterator<Item = &'a Transaction>,
) -> BTreeSet<CoId> {
    let mut deps = BTreeSet::new();

    if let Ruleset::OwnedByGroup { group } = &header.ruleset {
        deps.insert(*group);
    }

    for session in sessions {
        if let Some(account) = session.actor().as_account() {
            deps.insert(account);
        }
    }

    if header.is_group() {
        for tx in transactions {
            let Some(Ok(changes)) = tx.trusting_changes() else {
                continue;
            };
            for change in &changes {
                let parent = change
                    .get("key")
                    .and_then(Value::as_str)
                    .and_then(|key| key.strip_prefix("parent_"))
                    .and_then(|parent| parent.parse::<CoId>().ok());
                if let Some(parent) = parent {
                    deps.insert(parent);
                }
            }
        }
    }

    deps.remove(id);
    deps
}
