//! Message-level storage over a [`DbClient`].
//!
//! [`StorageCore`] turns stored rows into content messages and back.
//! [`SyncStorage`] runs it inline; [`AsyncStorage`] runs it on blocking
//! threads and funnels stores through one worker so storage transactions
//! never interleave.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use cosync_core::{
    collect_dependencies, CoId, CoValueHeader, ContentMessage, KnownState, Priority,
    SessionContent, Transaction, DEFAULT_MAX_RECOMMENDED_TX_SIZE,
};

use crate::error::{Result, StoreError};
use crate::traits::{
    CorrectionCallback, DbClient, SessionRow, SessionUpdate, Storage, StoreOutcome,
};

/// Storage tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Payload bytes after which a session gets a new signature checkpoint.
    pub max_recommended_tx_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_recommended_tx_size: DEFAULT_MAX_RECOMMENDED_TX_SIZE,
        }
    }
}

enum SingleStore {
    Stored,
    InvalidAssumption(KnownState),
}

/// Load and store logic shared by both backends.
pub struct StorageCore<C: DbClient> {
    client: C,
    config: StorageConfig,
}

impl<C: DbClient> StorageCore<C> {
    pub fn new(client: C, config: StorageConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn header(&self, id: &CoId) -> Result<Option<(i64, CoValueHeader)>> {
        let Some(row) = self.client.get_co_value(id)? else {
            return Ok(None);
        };
        match serde_json::from_str(&row.header) {
            Ok(header) => Ok(Some((row.row_id, header))),
            Err(e) => {
                warn!("Skipping stored {} with malformed header: {}", id, e);
                Ok(None)
            }
        }
    }

    /// What storage holds for `id`.
    pub fn known_state(&self, id: &CoId) -> Result<Option<KnownState>> {
        let Some(row) = self.client.get_co_value(id)? else {
            return Ok(None);
        };
        let mut known = KnownState {
            header: true,
            ..KnownState::empty()
        };
        for session in self.client.get_sessions(row.row_id)? {
            known.sessions.insert(session.session_id, session.last_idx);
        }
        Ok(Some(known))
    }

    /// Content messages for `id`.
    ///
    /// Each session is split at its signature checkpoints; piece `n` of every
    /// session goes into message `n`. With more than one message the first
    /// carries `expect_content_until`.
    pub fn load(&self, id: &CoId) -> Result<Vec<ContentMessage>> {
        let Some((row_id, header)) = self.header(id)? else {
            return Ok(Vec::new());
        };
        let priority = Priority::for_header(&header);
        let mut first = ContentMessage::new(*id, priority);
        first.header = Some(header);
        let mut messages = vec![first];
        let mut known = KnownState {
            header: true,
            ..KnownState::empty()
        };

        for session in self.client.get_sessions(row_id)? {
            let pieces = self.session_pieces(id, &session)?;
            if let Some(last) = pieces.last() {
                known.sessions.insert(session.session_id.clone(), last.end());
            }
            for (n, piece) in pieces.into_iter().enumerate() {
                if messages.len() <= n {
                    messages.push(ContentMessage::new(*id, priority));
                }
                messages[n].new.insert(session.session_id.clone(), piece);
            }
        }

        if messages.len() > 1 {
            messages[0].expect_content_until = Some(known);
        }
        Ok(messages)
    }

    /// Stored transactions of one session, split at signature checkpoints.
    ///
    /// A malformed or missing transaction row ends the session at the last
    /// checkpoint before it, since later signatures cannot be verified
    /// without it.
    fn session_pieces(&self, id: &CoId, session: &SessionRow) -> Result<Vec<SessionContent>> {
        let mut transactions: Vec<Transaction> = Vec::with_capacity(session.last_idx);
        for row in self.client.get_transactions(session.row_id, 0)? {
            if row.idx != transactions.len() {
                warn!(
                    "Missing transaction {} in {} {}",
                    transactions.len(),
                    id,
                    session.session_id
                );
                break;
            }
            match serde_json::from_str(&row.tx) {
                Ok(tx) => transactions.push(tx),
                Err(e) => {
                    warn!(
                        "Malformed transaction {} in {} {}: {}",
                        row.idx, id, session.session_id, e
                    );
                    break;
                }
            }
        }
        let complete = transactions.len() >= session.last_idx;
        transactions.truncate(session.last_idx);

        let mut pieces = Vec::new();
        let mut start = 0;
        for checkpoint in self.client.get_signatures(session.row_id, 0)? {
            if checkpoint.idx >= transactions.len() {
                break;
            }
            pieces.push(SessionContent {
                after: start,
                new_transactions: transactions[start..=checkpoint.idx].to_vec(),
                last_signature: checkpoint.signature,
            });
            start = checkpoint.idx + 1;
        }
        if complete && start < transactions.len() {
            pieces.push(SessionContent {
                after: start,
                new_transactions: transactions[start..].to_vec(),
                last_signature: session.last_signature,
            });
        }
        Ok(pieces)
    }

    /// Load `id` preceded by its dependencies, skipping anything in `pushed`.
    pub fn load_with_dependencies(
        &self,
        id: &CoId,
        pushed: &mut HashSet<CoId>,
    ) -> Result<Vec<ContentMessage>> {
        if !pushed.insert(*id) {
            return Ok(Vec::new());
        }
        let messages = self.load(id)?;
        let Some(header) = messages.first().and_then(|m| m.header.as_ref()) else {
            return Ok(messages);
        };

        let dependencies = collect_dependencies(
            id,
            header,
            messages.iter().flat_map(|m| m.new.keys()),
            messages
                .iter()
                .flat_map(|m| m.new.values())
                .flat_map(|content| content.new_transactions.iter()),
        );

        let mut out = Vec::new();
        for dependency in dependencies {
            out.extend(self.load_with_dependencies(&dependency, pushed)?);
        }
        out.extend(messages);
        Ok(out)
    }

    /// Store `message`, asking `correction` for missing content if storage
    /// holds less than the message assumes.
    pub fn store(
        &mut self,
        message: &ContentMessage,
        correction: impl FnOnce(KnownState) -> Option<Vec<ContentMessage>>,
    ) -> Result<StoreOutcome> {
        let known = match self.store_single(message)? {
            SingleStore::Stored => return Ok(StoreOutcome::Stored),
            SingleStore::InvalidAssumption(known) => known,
        };

        debug!("Store of {} needs correction from {:?}", message.id, known);
        let Some(fixes) = correction(known.clone()) else {
            return Ok(StoreOutcome::NeedsCorrection(known));
        };
        for fix in &fixes {
            if let SingleStore::InvalidAssumption(again) = self.store_single(fix)? {
                error!(
                    "Double correction for {}: storage holds {:?} after correcting",
                    message.id, again
                );
                return Err(StoreError::DoubleCorrection(message.id));
            }
        }
        Ok(StoreOutcome::Corrected)
    }

    fn store_single(&mut self, message: &ContentMessage) -> Result<SingleStore> {
        let max_tx_size = self.config.max_recommended_tx_size;
        self.client.transaction(|client| {
            let co_value = match (client.get_co_value(&message.id)?, &message.header) {
                (Some(row), _) => row.row_id,
                (None, Some(header)) => {
                    client.add_co_value(&message.id, &serde_json::to_string(header)?)?
                }
                (None, None) => return Ok(SingleStore::InvalidAssumption(KnownState::empty())),
            };

            let mut stored = Vec::with_capacity(message.new.len());
            for (session_id, content) in &message.new {
                let row = client.get_session(co_value, session_id)?;
                let last_idx = row.as_ref().map_or(0, |r| r.last_idx);
                if last_idx < content.after {
                    let mut known = KnownState {
                        header: true,
                        ..KnownState::empty()
                    };
                    for session in client.get_sessions(co_value)? {
                        known.sessions.insert(session.session_id, session.last_idx);
                    }
                    return Ok(SingleStore::InvalidAssumption(known));
                }
                stored.push((session_id, content, row));
            }

            for (session_id, content, row) in stored {
                let last_idx = row.as_ref().map_or(0, |r| r.last_idx);
                let skip = last_idx - content.after;
                let Some(new) = content.new_transactions.get(skip..).filter(|n| !n.is_empty())
                else {
                    continue;
                };

                let mut bytes = row.as_ref().map_or(0, |r| r.bytes_since_last_signature)
                    + new.iter().map(Transaction::payload_size).sum::<usize>();
                let new_last_idx = last_idx + new.len();
                let checkpoint = bytes > max_tx_size;
                if checkpoint {
                    bytes = 0;
                }

                let session_row = client.add_session_update(&SessionUpdate {
                    co_value,
                    session_id: session_id.clone(),
                    last_idx: new_last_idx,
                    last_signature: content.last_signature,
                    bytes_since_last_signature: bytes,
                })?;
                for (offset, tx) in new.iter().enumerate() {
                    client.add_transaction(
                        session_row,
                        last_idx + offset,
                        &serde_json::to_string(tx)?,
                    )?;
                }
                if checkpoint {
                    client.add_signature_after(
                        session_row,
                        new_last_idx - 1,
                        &content.last_signature,
                    )?;
                }
            }
            Ok(SingleStore::Stored)
        })
    }
}

fn lock<C: DbClient>(core: &Mutex<StorageCore<C>>) -> Result<MutexGuard<'_, StorageCore<C>>> {
    core.lock().map_err(|_| StoreError::LockPoisoned)
}

/// Storage that runs every call inline on the caller's thread.
pub struct SyncStorage<C: DbClient> {
    core: Mutex<StorageCore<C>>,
}

impl<C: DbClient> SyncStorage<C> {
    pub fn new(client: C, config: StorageConfig) -> Self {
        Self {
            core: Mutex::new(StorageCore::new(client, config)),
        }
    }
}

#[async_trait]
impl<C: DbClient> Storage for SyncStorage<C> {
    async fn load(&self, id: CoId) -> Result<Vec<ContentMessage>> {
        lock(&self.core)?.load(&id)
    }

    async fn load_with_dependencies(
        &self,
        id: CoId,
        pushed: &mut HashSet<CoId>,
    ) -> Result<Vec<ContentMessage>> {
        lock(&self.core)?.load_with_dependencies(&id, pushed)
    }

    async fn store(
        &self,
        message: ContentMessage,
        correction: CorrectionCallback,
    ) -> Result<StoreOutcome> {
        lock(&self.core)?.store(&message, correction)
    }

    async fn known_state(&self, id: CoId) -> Result<Option<KnownState>> {
        lock(&self.core)?.known_state(&id)
    }
}

struct StoreJob {
    message: ContentMessage,
    correction: CorrectionCallback,
    reply: oneshot::Sender<Result<StoreOutcome>>,
}

/// Storage that runs calls on blocking threads.
///
/// Stores are queued to a single worker task and applied one at a time;
/// each caller still gets its own completion.
pub struct AsyncStorage<C: DbClient> {
    core: Arc<Mutex<StorageCore<C>>>,
    stores: mpsc::UnboundedSender<StoreJob>,
}

impl<C: DbClient> AsyncStorage<C> {
    /// Start the store worker. Must be called within a tokio runtime.
    pub fn new(client: C, config: StorageConfig) -> Self {
        let core = Arc::new(Mutex::new(StorageCore::new(client, config)));
        let (stores, mut queue) = mpsc::unbounded_channel::<StoreJob>();

        let worker_core = core.clone();
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                let core = worker_core.clone();
                let StoreJob {
                    message,
                    correction,
                    reply,
                } = job;
                let result = tokio::task::spawn_blocking(move || {
                    lock(&core)?.store(&message, correction)
                })
                .await
                .map_err(StoreError::from)
                .and_then(|r| r);
                // The caller may have stopped waiting.
                let _ = reply.send(result);
            }
            debug!("Storage worker stopped");
        });

        Self { core, stores }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StorageCore<C>) -> Result<T> + Send + 'static,
    {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || f(&mut *lock(&core)?)).await?
    }
}

#[async_trait]
impl<C: DbClient> Storage for AsyncStorage<C> {
    async fn load(&self, id: CoId) -> Result<Vec<ContentMessage>> {
        self.blocking(move |core| core.load(&id)).await
    }

    async fn load_with_dependencies(
        &self,
        id: CoId,
        pushed: &mut HashSet<CoId>,
    ) -> Result<Vec<ContentMessage>> {
        let mut owned = pushed.clone();
        let (messages, owned) = self
            .blocking(move |core| {
                let messages = core.load_with_dependencies(&id, &mut owned)?;
                Ok((messages, owned))
            })
            .await?;
        *pushed = owned;
        Ok(messages)
    }

    async fn store(
        &self,
        message: ContentMessage,
        correction: CorrectionCallback,
    ) -> Result<StoreOutcome> {
        let (reply, done) = oneshot::channel();
        self.stores
            .send(StoreJob {
                message,
                correction,
                reply,
            })
            .map_err(|_| StoreError::WorkerStopped)?;
        done.await.map_err(|_| StoreError::WorkerStopped)?
    }

    async fn known_state(&self, id: CoId) -> Result<Option<KnownState>> {
        self.blocking(move |core| core.known_state(&id)).await
    }
}
