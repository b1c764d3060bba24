//! Storage traits.
//!
//! [`DbClient`] is the row-level interface a database backend implements.
//! [`Storage`] is what the node talks to: whole content messages in and out,
//! with correction when a store's assumptions are stale.

use async_trait::async_trait;
use std::collections::HashSet;

use cosync_core::{CoId, ContentMessage, Ed25519Signature, KnownState, SessionId};

use crate::error::Result;

/// A stored CoValue. `header` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoValueRow {
    pub row_id: i64,
    pub id: CoId,
    pub header: String,
}

/// A stored session. `last_idx` is the number of stored transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub row_id: i64,
    pub co_value: i64,
    pub session_id: SessionId,
    pub last_idx: usize,
    pub last_signature: Ed25519Signature,
    pub bytes_since_last_signature: usize,
}

/// New values for a session row, inserted or updated by `(session_id, co_value)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub co_value: i64,
    pub session_id: SessionId,
    pub last_idx: usize,
    pub last_signature: Ed25519Signature,
    pub bytes_since_last_signature: usize,
}

/// A stored transaction. `tx` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRow {
    pub idx: usize,
    pub tx: String,
}

/// A signature checkpoint covering transactions up to and including `idx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRow {
    pub idx: usize,
    pub signature: Ed25519Signature,
}

/// Row-level access to the four storage tables.
///
/// Implementations are synchronous; the async wrapper moves calls onto
/// blocking threads.
pub trait DbClient: Send + 'static {
    fn get_co_value(&self, id: &CoId) -> Result<Option<CoValueRow>>;

    /// Sessions of a CoValue, by CoValue row id.
    fn get_sessions(&self, co_value: i64) -> Result<Vec<SessionRow>>;

    fn get_session(&self, co_value: i64, session_id: &SessionId) -> Result<Option<SessionRow>>;

    /// Transactions of a session with `idx >= from_idx`, ascending.
    fn get_transactions(&self, session: i64, from_idx: usize) -> Result<Vec<TransactionRow>>;

    /// Signature checkpoints of a session with `idx >= from_idx`, ascending.
    fn get_signatures(&self, session: i64, from_idx: usize) -> Result<Vec<SignatureRow>>;

    /// Insert a CoValue, returning its row id.
    fn add_co_value(&mut self, id: &CoId, header: &str) -> Result<i64>;

    /// Insert or update a session row, returning its row id.
    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64>;

    fn add_transaction(&mut self, session: i64, idx: usize, tx: &str) -> Result<()>;

    fn add_signature_after(
        &mut self,
        session: i64,
        idx: usize,
        signature: &Ed25519Signature,
    ) -> Result<()>;

    /// Run `f` atomically: all of its writes land, or none do.
    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
        Self: Sized;
}

/// Outcome of storing a content message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Every session was written (or already held).
    Stored,
    /// The message's assumptions were stale; the correction was stored instead.
    Corrected,
    /// The message's assumptions were stale and no correction was supplied.
    /// Carries what storage actually holds.
    NeedsCorrection(KnownState),
}

/// Produces the content that fills the gap between what storage holds and
/// what a rejected message assumed.
pub type CorrectionCallback = Box<dyn FnOnce(KnownState) -> Option<Vec<ContentMessage>> + Send>;

/// Message-level storage used by the node.
///
/// Sync and async backends expose the same contract.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Content messages for `id`, split at signature checkpoints. Empty if
    /// the value is not stored.
    async fn load(&self, id: CoId) -> Result<Vec<ContentMessage>>;

    /// Like [`Storage::load`], preceded by the content of every dependency
    /// not yet in `pushed`. Every value delivered is added to `pushed`.
    async fn load_with_dependencies(
        &self,
        id: CoId,
        pushed: &mut HashSet<CoId>,
    ) -> Result<Vec<ContentMessage>>;

    /// Store `message`. If storage holds less than the message assumes,
    /// `correction` is asked for the missing content.
    async fn store(
        &self,
        message: ContentMessage,
        correction: CorrectionCallback,
    ) -> Result<StoreOutcome>;

    /// What storage holds for `id`, if anything.
    async fn known_state(&self, id: CoId) -> Result<Option<KnownState>>;
}
