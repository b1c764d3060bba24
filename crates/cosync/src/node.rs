//! The local node: one identity's view of every loaded CoValue.
//!
//! All CoValue state lives in one arena behind a mutex that is never held
//! across an await point, so protocol handling behaves like a single
//! logical thread. Storage and peers are the only suspension points.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, warn};

use cosync_core::{
    now_millis, BinaryStreamItem, CoId, CoValueContent, CoValueCore, CoValueHeader, CoValueType,
    ContentMessage, CoreError, DecodedTransaction, KeySecret, Keypair, KnownState, Privacy, SessionId, TransactionId,
};
use cosync_perms::{
    current_write_key, key_resolver, owned_header, valid_transactions, Identity, PermsError,
    Resolver, Role,
};
use cosync_store::{CorrectionCallback, Storage, StorageConfig, StoreOutcome};
use cosync_sync::{IncomingQueue, PeerId, PeerRole, PeerState, SyncConfig, SyncMessage};

use crate::error::{NodeError, Result};
use crate::session_lock::SessionLock;

/// Configuration for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Sync protocol tuning.
    pub sync: SyncConfig,
    /// Storage tuning. Also bounds how large local transactions get before
    /// a signature checkpoint.
    pub storage: StorageConfig,
    /// How often unreferenced values are dropped from memory. `None` leaves
    /// it to [`LocalNode::collect_garbage`].
    pub gc_interval: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
            gc_interval: None,
        }
    }
}

/// Where a load stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadStatus {
    Loading,
    Available,
    Unavailable,
}

/// Everything guarded by the node mutex.
#[derive(Default)]
pub(crate) struct NodeState {
    /// The arena: every loaded CoValue by id.
    pub(crate) cores: HashMap<CoId, CoValueCore>,
    pub(crate) loads: HashMap<CoId, watch::Sender<LoadStatus>>,
    /// Final known states announced by multi-part deliveries in progress.
    pub(crate) streaming: HashMap<CoId, KnownState>,
    pub(crate) peers: HashMap<PeerId, PeerState>,
    /// Content waiting for an account to load, by account.
    pub(crate) parked: HashMap<CoId, Vec<(Option<PeerId>, ContentMessage)>>,
    pub(crate) subscribers: HashMap<CoId, HashMap<u64, mpsc::UnboundedSender<CoValueContent>>>,
    pub(crate) next_subscriber: u64,
}

impl NodeState {
    pub(crate) fn status(&self, id: &CoId) -> Option<LoadStatus> {
        self.loads.get(id).map(|status| *status.borrow())
    }

    pub(crate) fn set_status(&mut self, id: CoId, status: LoadStatus) {
        match self.loads.get(&id) {
            Some(sender) => {
                sender.send_replace(status);
            }
            None => {
                self.loads.insert(id, watch::channel(status).0);
            }
        }
    }

    /// Mark `id` available once it is held and any announced delivery is
    /// complete.
    pub(crate) fn refresh_status(&mut self, id: &CoId) {
        let Some(core) = self.cores.get(id) else {
            return;
        };
        if let Some(target) = self.streaming.get(id) {
            if !target.is_covered_by(&core.known_state()) {
                return;
            }
            self.streaming.remove(id);
        }
        if self.status(id) != Some(LoadStatus::Available) {
            self.set_status(*id, LoadStatus::Available);
        }
    }

    /// Give up on `id` if it is not held and no peer is still asked for it.
    pub(crate) fn fail_load_if_unanswered(&mut self, id: &CoId) {
        if self.cores.contains_key(id) || self.peers.values().any(|p| p.is_loading(id)) {
            return;
        }
        if self.status(id) == Some(LoadStatus::Loading) {
            debug!("No peer holds {}", id);
            self.set_status(*id, LoadStatus::Unavailable);
        }
    }

    /// Valid transactions of `id` as `identity` sees them, recorded in the
    /// core's valid-transaction counter.
    ///
    /// Private transactions are decrypted with the owner group's keys where
    /// readable, then filtered by the ruleset.
    pub(crate) fn validate(
        &mut self,
        id: &CoId,
        identity: &Identity,
    ) -> Option<Vec<DecodedTransaction>> {
        let valid = {
            let core = self.cores.get(id)?;
            let resolver = Resolver::new(&self.cores);
            let owner = core.header().owner().and_then(|group| resolver.group(&group));
            let decoded = match &owner {
                Some(group) => {
                    core.decoded_transactions(&key_resolver(group, identity, &resolver))
                }
                None => core.decoded_transactions(&|_| None),
            };
            valid_transactions(core, decoded, &resolver)
        };
        if let Some(core) = self.cores.get_mut(id) {
            core.record_valid(valid.iter().map(|tx| &tx.id));
        }
        Some(valid)
    }

    /// Merged content of `id` as `identity` sees it.
    pub(crate) fn content_of(&mut self, id: &CoId, identity: &Identity) -> Option<CoValueContent> {
        let valid = self.validate(id, identity)?;
        let core = self.cores.get(id)?;
        Some(CoValueContent::build(*id, core.header(), &valid))
    }

    pub(crate) fn dependencies_of(&self, id: &CoId) -> BTreeSet<CoId> {
        self.cores
            .get(id)
            .map(CoValueCore::depended_on)
            .unwrap_or_default()
    }

    /// Dependencies of `id` we neither hold nor are fetching.
    pub(crate) fn missing_dependencies(&self, id: &CoId) -> Vec<CoId> {
        self.dependencies_of(id)
            .into_iter()
            .filter(|dep| {
                !self.cores.contains_key(dep) && self.status(dep) != Some(LoadStatus::Loading)
            })
            .collect()
    }
}

pub(crate) struct Inner {
    pub(crate) identity: Identity,
    pub(crate) session: SessionId,
    pub(crate) config: NodeConfig,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    state: Mutex<NodeState>,
    queue: Mutex<IncomingQueue>,
    /// Wakes the incoming-message processor.
    pub(crate) incoming: Arc<Notify>,
    /// Signalled whenever peer or storage state may have caught up.
    pub(crate) synced: Notify,
    persist_tx: Option<mpsc::UnboundedSender<ContentMessage>>,
    pending_stores: AtomicUsize,
    _session_lock: Option<SessionLock>,
}

impl Inner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, IncomingQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `message` for storage, in order.
    pub(crate) fn persist(&self, message: ContentMessage) {
        let Some(tx) = &self.persist_tx else {
            return;
        };
        self.pending_stores.fetch_add(1, Ordering::SeqCst);
        if tx.send(message).is_err() {
            self.pending_stores.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.incoming.notify_one();
    }
}

/// A node: the identity it acts as, the CoValues it holds, its storage and
/// its peers.
///
/// Cheap to clone; clones share state. Must be created inside a Tokio
/// runtime.
#[derive(Clone)]
pub struct LocalNode {
    pub(crate) inner: Arc<Inner>,
}

impl LocalNode {
    /// A node acting as `identity` in a fresh session.
    pub fn new(identity: Identity, storage: Option<Arc<dyn Storage>>, config: NodeConfig) -> Self {
        let session = SessionId::new_random(&identity.actor);
        Self::build(identity, session, None, storage, config)
    }

    /// A node writing to the session recorded for a locked slot.
    pub fn with_session_lock(
        identity: Identity,
        lock: SessionLock,
        storage: Option<Arc<dyn Storage>>,
        config: NodeConfig,
    ) -> Result<Self> {
        if lock.session_id().actor() != identity.actor {
            return Err(NodeError::InvalidOperation(format!(
                "session lock belongs to {}, not {}",
                lock.session_id().actor(),
                identity.actor
            )));
        }
        let session = lock.session_id().clone();
        Ok(Self::build(identity, session, Some(lock), storage, config))
    }

    fn build(
        identity: Identity,
        session: SessionId,
        lock: Option<SessionLock>,
        storage: Option<Arc<dyn Storage>>,
        config: NodeConfig,
    ) -> Self {
        let incoming = Arc::new(Notify::new());
        let (persist_tx, persist_rx) = match storage {
            Some(_) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let time_budget = config.sync.time_budget;
        let gc_interval = config.gc_interval;
        let inner = Arc::new(Inner {
            identity,
            session,
            config,
            storage: storage.clone(),
            state: Mutex::new(NodeState::default()),
            queue: Mutex::new(IncomingQueue::new()),
            incoming: incoming.clone(),
            synced: Notify::new(),
            persist_tx,
            pending_stores: AtomicUsize::new(0),
            _session_lock: lock,
        });

        tokio::spawn(crate::peers::process_incoming(
            Arc::downgrade(&inner),
            incoming,
            time_budget,
        ));
        if let (Some(storage), Some(rx)) = (storage, persist_rx) {
            tokio::spawn(persist_worker(Arc::downgrade(&inner), storage, rx));
        }
        if let Some(interval) = gc_interval {
            tokio::spawn(gc_loop(Arc::downgrade(&inner), interval));
        }
        debug!("Started node for {} in {}", inner.identity.actor, inner.session);
        LocalNode { inner }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// The account this node acts as, if it is not a bare agent.
    pub fn account_id(&self) -> Option<CoId> {
        self.inner.identity.actor.as_account()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Whether `id` is loaded.
    pub fn has(&self, id: &CoId) -> bool {
        self.inner.lock_state().cores.contains_key(id)
    }

    pub fn known_state(&self, id: &CoId) -> Option<KnownState> {
        self.inner
            .lock_state()
            .cores
            .get(id)
            .map(CoValueCore::known_state)
    }

    pub fn header(&self, id: &CoId) -> Option<CoValueHeader> {
        self.inner
            .lock_state()
            .cores
            .get(id)
            .map(|core| core.header().clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating Values
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a CoValue from `header`. Creating the same header twice
    /// yields the same id.
    pub fn create_co_value(&self, header: CoValueHeader) -> Result<CoId> {
        let mut state = self.inner.lock_state();
        self.insert_new(&mut state, header)
    }

    pub fn create_map(&self, group: CoId) -> Result<CoId> {
        self.create_owned(CoValueType::Map, group, None)
    }

    pub fn create_list(&self, group: CoId) -> Result<CoId> {
        self.create_owned(CoValueType::List, group, None)
    }

    pub fn create_stream(&self, group: CoId) -> Result<CoId> {
        self.create_owned(CoValueType::Stream, group, None)
    }

    pub fn create_binary_stream(&self, group: CoId) -> Result<CoId> {
        self.create_owned(CoValueType::BinaryStream, group, None)
    }

    /// Create a value of `value_type` owned by `group`, with optional meta.
    pub fn create_owned(
        &self,
        value_type: CoValueType,
        group: CoId,
        meta: Option<Value>,
    ) -> Result<CoId> {
        let mut state = self.inner.lock_state();
        match state.cores.get(&group) {
            Some(core) if core.header().is_group() => {}
            Some(_) => return Err(PermsError::NotAGroup(group).into()),
            None => return Err(NodeError::Unavailable(group)),
        }
        self.insert_new(&mut state, owned_header(value_type, group, meta))
    }

    pub(crate) fn insert_new(&self, state: &mut NodeState, header: CoValueHeader) -> Result<CoId> {
        let core = CoValueCore::new(header, self.inner.config.storage.max_recommended_tx_size)?;
        let id = core.id();
        if state.cores.contains_key(&id) {
            return Ok(id);
        }
        for message in core.new_content_since(None) {
            self.inner.persist(message);
        }
        state.cores.insert(id, core);
        state.set_status(id, LoadStatus::Available);
        debug!("Created {}", id);
        self.sync_to_peers(state, id);
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a transaction of `changes` to `id` in this node's session.
    ///
    /// Values owned by a group need write access; private transactions are
    /// encrypted with the group's current key.
    pub fn make_transaction(
        &self,
        id: CoId,
        changes: Vec<Value>,
        privacy: Privacy,
    ) -> Result<TransactionId> {
        let mut state = self.inner.lock_state();
        let key = self.write_key(&state, &id, privacy)?;
        self.write_as_self(&mut state, id, &changes, key.as_ref())
    }

    /// Set `key` of a map.
    pub fn map_set(
        &self,
        id: CoId,
        key: &str,
        value: Value,
        privacy: Privacy,
    ) -> Result<TransactionId> {
        self.edit(id, privacy, |content| {
            content.as_map().ok_or_else(|| wrong_type(id, "map"))?;
            Ok(vec![cosync_core::MapChange::set(key, value)])
        })
    }

    /// Delete `key` of a map.
    pub fn map_delete(&self, id: CoId, key: &str, privacy: Privacy) -> Result<TransactionId> {
        self.edit(id, privacy, |content| {
            content.as_map().ok_or_else(|| wrong_type(id, "map"))?;
            Ok(vec![cosync_core::MapChange::del(key)])
        })
    }

    /// Insert `value` after the item at `after`.
    pub fn list_append(
        &self,
        id: CoId,
        value: Value,
        after: usize,
        privacy: Privacy,
    ) -> Result<TransactionId> {
        self.edit(id, privacy, |content| {
            let list = content.as_list().ok_or_else(|| wrong_type(id, "list"))?;
            Ok(vec![list.append_change(value, after)?])
        })
    }

    /// Insert `value` before the item at `before`.
    pub fn list_prepend(
        &self,
        id: CoId,
        value: Value,
        before: usize,
        privacy: Privacy,
    ) -> Result<TransactionId> {
        self.edit(id, privacy, |content| {
            let list = content.as_list().ok_or_else(|| wrong_type(id, "list"))?;
            Ok(vec![list.prepend_change(value, before)?])
        })
    }

    /// Add `value` at the end of the list.
    pub fn list_push(&self, id: CoId, value: Value, privacy: Privacy) -> Result<TransactionId> {
        self.edit(id, privacy, |content| {
            let list = content.as_list().ok_or_else(|| wrong_type(id, "list"))?;
            Ok(vec![list.push_change(value)?])
        })
    }

    pub fn list_delete(&self, id: CoId, index: usize, privacy: Privacy) -> Result<TransactionId> {
        self.edit(id, privacy, |content| {
            let list = content.as_list().ok_or_else(|| wrong_type(id, "list"))?;
            Ok(vec![list.delete_change(index)?])
        })
    }

    pub fn list_replace(
        &self,
        id: CoId,
        index: usize,
        value: Value,
        privacy: Privacy,
    ) -> Result<TransactionId> {
        self.edit(id, privacy, |content| {
            let list = content.as_list().ok_or_else(|| wrong_type(id, "list"))?;
            Ok(list.replace_changes(index, value)?)
        })
    }

    /// Push an item to this session's feed of a stream.
    pub fn stream_push(&self, id: CoId, item: Value, privacy: Privacy) -> Result<TransactionId> {
        self.edit(id, privacy, |content| {
            content.as_stream().ok_or_else(|| wrong_type(id, "stream"))?;
            Ok(vec![item])
        })
    }

    /// Write `data` to a binary stream: a start item, chunks of at most
    /// `chunk_size` bytes, and an end item.
    pub fn write_binary(
        &self,
        id: CoId,
        mime_type: &str,
        file_name: Option<&str>,
        data: &[u8],
        chunk_size: usize,
        privacy: Privacy,
    ) -> Result<()> {
        let start = BinaryStreamItem::Start {
            mime_type: mime_type.to_string(),
            file_name: file_name.map(str::to_string),
            total_size_bytes: Some(data.len() as u64),
        };
        self.edit(id, privacy, |content| {
            content
                .as_binary_stream()
                .ok_or_else(|| wrong_type(id, "binary stream"))?;
            Ok(vec![start.to_value()?])
        })?;
        for chunk in data.chunks(chunk_size.max(1)) {
            self.make_transaction(id, vec![BinaryStreamItem::chunk(chunk).to_value()?], privacy)?;
        }
        self.make_transaction(id, vec![BinaryStreamItem::End.to_value()?], privacy)?;
        Ok(())
    }

    /// Compute changes from the current content and write them in one
    /// transaction.
    fn edit<F>(&self, id: CoId, privacy: Privacy, edit: F) -> Result<TransactionId>
    where
        F: FnOnce(&CoValueContent) -> Result<Vec<Value>>,
    {
        let mut state = self.inner.lock_state();
        let content = state
            .content_of(&id, &self.inner.identity)
            .ok_or(NodeError::Unavailable(id))?;
        let changes = edit(&content)?;
        let key = self.write_key(&state, &id, privacy)?;
        self.write_as_self(&mut state, id, &changes, key.as_ref())
    }

    /// The key a write to `id` uses, after checking we may write at all.
    fn write_key(
        &self,
        state: &NodeState,
        id: &CoId,
        privacy: Privacy,
    ) -> Result<Option<KeySecret>> {
        let core = state.cores.get(id).ok_or(NodeError::Unavailable(*id))?;
        let Some(group_id) = core.header().owner() else {
            return match privacy {
                Privacy::Trusting => Ok(None),
                Privacy::Private => Err(CoreError::MissingKey.into()),
            };
        };

        let identity = &self.inner.identity;
        let resolver = Resolver::new(&state.cores);
        let group = resolver
            .group(&group_id)
            .ok_or(PermsError::MissingDependency(group_id))?;
        if !group
            .role_of(&identity.actor, &resolver)
            .map_or(false, Role::can_write)
        {
            return Err(PermsError::PermissionDenied(format!(
                "{} cannot write to {}",
                identity.actor, id
            ))
            .into());
        }
        match privacy {
            Privacy::Trusting => Ok(None),
            Privacy::Private => current_write_key(&group, identity, &resolver)
                .map(Some)
                .ok_or_else(|| PermsError::MissingReadKey(group_id).into()),
        }
    }

    pub(crate) fn write_as_self(
        &self,
        state: &mut NodeState,
        id: CoId,
        changes: &[Value],
        key: Option<&KeySecret>,
    ) -> Result<TransactionId> {
        let session = self.inner.session.clone();
        self.write_locked(
            state,
            id,
            &session,
            self.inner.identity.agent.signer(),
            changes,
            key,
        )
    }

    /// Sign and append a transaction, then store it, push it to peers and
    /// notify subscribers.
    pub(crate) fn write_locked(
        &self,
        state: &mut NodeState,
        id: CoId,
        session: &SessionId,
        signer: &Keypair,
        changes: &[Value],
        key: Option<&KeySecret>,
    ) -> Result<TransactionId> {
        let core = state.cores.get_mut(&id).ok_or(NodeError::Unavailable(id))?;
        let before = core.known_state();
        let tx_id = core.make_transaction(session, signer, changes, now_millis(), key)?;
        for message in core.new_content_since(Some(&before)) {
            self.inner.persist(message);
        }
        self.sync_to_peers(state, id);
        self.notify_changed(state, &[id]);
        Ok(tx_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Current merged content of a loaded value.
    pub fn content(&self, id: &CoId) -> Result<CoValueContent> {
        self.inner
            .lock_state()
            .content_of(id, &self.inner.identity)
            .ok_or(NodeError::Unavailable(*id))
    }

    /// Distinct transactions found valid so far. Never decreases.
    pub fn total_valid_transactions(&self, id: &CoId) -> Option<usize> {
        self.inner
            .lock_state()
            .cores
            .get(id)
            .map(CoValueCore::total_valid_transactions)
    }

    /// Load `id` and everything it depends on from storage or peers.
    ///
    /// Fails with [`NodeError::Unavailable`] once the load timeout passes or
    /// every asked peer answered that it does not hold the value.
    pub async fn load(&self, id: CoId) -> Result<CoValueContent> {
        self.load_core(id, None).await?;
        self.load_dependencies(id).await;
        self.content(&id)
    }

    /// Make `id` available locally. Peers other than `requester` are asked.
    pub(crate) async fn load_core(&self, id: CoId, requester: Option<PeerId>) -> Result<()> {
        let (mut status, first) = {
            let mut state = self.inner.lock_state();
            match state.loads.get(&id) {
                Some(sender) if *sender.borrow() != LoadStatus::Unavailable => {
                    (sender.subscribe(), false)
                }
                _ => {
                    let (sender, receiver) = watch::channel(LoadStatus::Loading);
                    state.loads.insert(id, sender);
                    (receiver, true)
                }
            }
        };

        if first {
            debug!("Loading {}", id);
            self.load_from_storage(id).await;
            self.request_from_peers(id, requester);
        }

        let wait = status.wait_for(|s| *s != LoadStatus::Loading);
        let outcome = match tokio::time::timeout(self.inner.config.sync.load_timeout, wait).await {
            Ok(Ok(status)) => *status,
            _ => LoadStatus::Unavailable,
        };
        if outcome == LoadStatus::Available {
            return Ok(());
        }

        let mut state = self.inner.lock_state();
        if state.cores.contains_key(&id) {
            warn!("Delivery of {} incomplete after timeout", id);
            state.streaming.remove(&id);
            state.set_status(id, LoadStatus::Available);
            return Ok(());
        }
        if state.status(&id) == Some(LoadStatus::Loading) {
            state.set_status(id, LoadStatus::Unavailable);
        }
        for peer in state.peers.values_mut() {
            peer.finish_load(&id);
        }
        if let Some(waiting) = state.parked.remove(&id) {
            debug!("Dropping {} messages signed by unavailable {}", waiting.len(), id);
        }
        debug!("{} is unavailable", id);
        Err(NodeError::Unavailable(id))
    }

    async fn load_from_storage(&self, id: CoId) {
        let Some(storage) = self.inner.storage.clone() else {
            return;
        };
        let mut pushed = HashSet::new();
        match storage.load_with_dependencies(id, &mut pushed).await {
            Ok(messages) => {
                let mut state = self.inner.lock_state();
                for message in messages {
                    self.handle_content(&mut state, None, message);
                }
            }
            Err(e) => warn!("Failed to load {} from storage: {}", id, e),
        }
    }

    /// Load the dependency closure of `id`. Unavailable dependencies are
    /// logged and skipped.
    async fn load_dependencies(&self, id: CoId) {
        let mut seen = HashSet::from([id]);
        let mut pending: Vec<CoId> = self.inner.lock_state().dependencies_of(&id).into_iter().collect();
        while let Some(dep) = pending.pop() {
            if !seen.insert(dep) {
                continue;
            }
            if let Err(e) = self.load_core(dep, None).await {
                warn!("Dependency {} of {}: {}", dep, id, e);
                continue;
            }
            pending.extend(self.inner.lock_state().dependencies_of(&dep));
        }
    }

    pub(crate) fn spawn_load(&self, id: CoId) {
        let node = self.clone();
        tokio::spawn(async move {
            if let Err(e) = node.load_core(id, None).await {
                debug!("Background load of {} failed: {}", id, e);
            }
        });
    }

    /// Wait until storage has every local change and every peer holds
    /// everything it wants from us.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = std::pin::pin!(self.inner.synced.notified());
            notified.as_mut().enable();
            if self.is_synced() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NodeError::Timeout(format!(
                    "sync incomplete after {:?}",
                    timeout
                )));
            }
        }
    }

    fn is_synced(&self) -> bool {
        if self.inner.pending_stores.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let state = self.inner.lock_state();
        state.peers.values().all(|peer| {
            state.cores.iter().all(|(id, core)| {
                !peer.wants(id)
                    || peer
                        .known(id)
                        .map_or(false, |known| core.known_state().is_covered_by(known))
            })
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Memory
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop `id` from memory if nothing references it. Loading it again
    /// brings it back from storage or peers.
    pub fn unload(&self, id: &CoId) -> bool {
        if self.inner.pending_stores.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let mut state = self.inner.lock_state();
        if !self.is_unreferenced(&state, id) {
            return false;
        }
        self.evict(&mut state, *id);
        true
    }

    /// Drop every unreferenced value. Returns how many were dropped.
    pub fn collect_garbage(&self) -> usize {
        if self.inner.pending_stores.load(Ordering::SeqCst) > 0 {
            return 0;
        }
        let mut state = self.inner.lock_state();
        let mut dropped = 0;
        loop {
            // Dependents go first, which can free what they depended on.
            let idle: Vec<CoId> = state
                .cores
                .keys()
                .copied()
                .filter(|id| self.is_unreferenced(&state, id))
                .collect();
            if idle.is_empty() {
                break;
            }
            for id in idle {
                self.evict(&mut state, id);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("Unloaded {} values", dropped);
        }
        dropped
    }

    /// Held, and safe to drop: not our account, no subscriber, no load in
    /// flight, no held value depending on it, no client peer following it,
    /// and everything we hold is also kept by storage or a server.
    fn is_unreferenced(&self, state: &NodeState, id: &CoId) -> bool {
        let Some(core) = state.cores.get(id) else {
            return false;
        };
        if self.account_id() == Some(*id)
            || state.subscribers.contains_key(id)
            || state.status(id) == Some(LoadStatus::Loading)
            || state.streaming.contains_key(id)
        {
            return false;
        }
        if state
            .cores
            .iter()
            .any(|(other, c)| other != id && c.depended_on().contains(id))
        {
            return false;
        }

        let held = core.known_state();
        let mut has_server = false;
        for peer in state.peers.values() {
            match peer.role() {
                PeerRole::Client if peer.wants(id) => return false,
                PeerRole::Client => {}
                PeerRole::Server => {
                    has_server = true;
                    if !peer.known(id).map_or(false, |known| held.is_covered_by(known)) {
                        return false;
                    }
                }
            }
        }
        self.inner.storage.is_some() || has_server
    }

    fn evict(&self, state: &mut NodeState, id: CoId) {
        state.cores.remove(&id);
        state.loads.remove(&id);
        for peer in state.peers.values() {
            if peer.role() == PeerRole::Server {
                peer.send(SyncMessage::Done { id });
            }
        }
        debug!("Unloaded {}", id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// Revalidate `changed` values and values owned by a changed group, then
    /// send fresh content to their subscribers.
    pub(crate) fn notify_changed(&self, state: &mut NodeState, changed: &[CoId]) {
        let affected: BTreeSet<CoId> = state
            .cores
            .iter()
            .filter(|(id, core)| {
                changed.contains(id)
                    || core
                        .header()
                        .owner()
                        .map_or(false, |owner| changed.contains(&owner))
            })
            .map(|(id, _)| *id)
            .collect();

        for id in affected {
            if !state.subscribers.contains_key(&id) {
                state.validate(&id, &self.inner.identity);
                continue;
            }
            let Some(content) = state.content_of(&id, &self.inner.identity) else {
                continue;
            };
            if let Some(listeners) = state.subscribers.get_mut(&id) {
                listeners.retain(|_, tx| tx.send(content.clone()).is_ok());
            }
        }
    }
}

fn wrong_type(id: CoId, expected: &str) -> NodeError {
    NodeError::InvalidOperation(format!("{} is not a {}", id, expected))
}

/// Periodically drops unreferenced values until the node is gone.
async fn gc_loop(node: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = node.upgrade() else {
            return;
        };
        LocalNode { inner }.collect_garbage();
    }
}

/// Writes queued content to storage one message at a time.
///
/// When storage turns out to hold less than a message assumes, the gap is
/// filled from the node's current core.
async fn persist_worker(
    node: Weak<Inner>,
    storage: Arc<dyn Storage>,
    mut jobs: mpsc::UnboundedReceiver<ContentMessage>,
) {
    while let Some(message) = jobs.recv().await {
        let id = message.id;
        let source = node.clone();
        let correction: CorrectionCallback = Box::new(move |known| {
            let inner = source.upgrade()?;
            let state = inner.lock_state();
            let core = state.cores.get(&id)?;
            Some(core.new_content_since(Some(&known)))
        });

        match storage.store(message, correction).await {
            Ok(StoreOutcome::Stored) => {}
            Ok(StoreOutcome::Corrected) => debug!("Storage of {} corrected", id),
            Ok(StoreOutcome::NeedsCorrection(known)) => warn!(
                "Storage of {} still holds only {} transactions",
                id,
                known.total()
            ),
            Err(e) => error!("Failed to store {}: {}", id, e),
        }

        if let Some(inner) = node.upgrade() {
            inner.pending_stores.fetch_sub(1, Ordering::SeqCst);
            inner.synced.notify_waiters();
        }
    }
}
