//! Peers: connecting transports and handling protocol messages.
//!
//! Each peer gets a reader task that feeds the shared incoming queue and a
//! writer task that drains the peer's outgoing channel. One processor task
//! pulls from the queue round-robin and handles messages under the node
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use cosync_core::{
    resolve_signer, CoId, CoValueCore, ContentMessage, Ed25519PublicKey, KnownState, SessionId,
};
use cosync_sync::{
    apply_content, content_for, KnownMessage, PeerId, PeerRole, PeerState, SyncError,
    SyncMessage, TimeBudget, Transport,
};

use crate::node::{Inner, LoadStatus, LocalNode, NodeState};

impl LocalNode {
    /// Connect a peer over `transport`.
    ///
    /// On connecting to a server every held value is offered with a `load`,
    /// so both sides learn what the other is missing.
    pub fn add_peer<T: Transport + 'static>(&self, transport: T, role: PeerRole) -> PeerId {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let id = PeerId::random();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock_state();
            let mut peer = PeerState::new(id, role, tx);
            if role == PeerRole::Server {
                for (co_id, core) in &state.cores {
                    peer.send(SyncMessage::Load(KnownMessage::new(*co_id, core.known_state())));
                }
            }
            state.peers.insert(id, peer);
        }
        info!("Connected {:?} peer {}", role, id);

        tokio::spawn(write_loop(id, transport.clone(), rx));
        tokio::spawn(read_loop(
            id,
            transport,
            Arc::downgrade(&self.inner),
            self.inner.incoming.clone(),
        ));
        id
    }

    /// Disconnect a peer. Loads only it was serving move on to the other
    /// servers, or fail if there are none.
    pub fn remove_peer(&self, peer: PeerId) {
        self.inner.lock_queue().remove_peer(&peer);
        {
            let mut state = self.inner.lock_state();
            let Some(removed) = state.peers.remove(&peer) else {
                return;
            };
            info!("Disconnected peer {}", peer);

            let orphaned: Vec<CoId> = state
                .loads
                .keys()
                .copied()
                .filter(|id| removed.is_loading(id))
                .collect();
            for id in orphaned {
                if state.status(&id) == Some(LoadStatus::Loading)
                    && !state.peers.values().any(|p| p.is_loading(&id))
                {
                    self.request_locked(&mut state, id, None);
                }
            }
        }
        self.inner.synced.notify_waiters();
    }

    /// Peers currently connected.
    pub fn peers(&self) -> Vec<(PeerId, PeerRole)> {
        self.inner
            .lock_state()
            .peers
            .values()
            .map(|p| (p.id(), p.role()))
            .collect()
    }

    /// Tell servers we no longer need updates to `id`.
    ///
    /// The value stays loaded; loading it again resumes updates.
    pub fn stop_syncing(&self, id: CoId) {
        let mut state = self.inner.lock_state();
        for peer in state.peers.values() {
            if peer.role() == PeerRole::Server {
                peer.send(SyncMessage::Done { id });
            }
        }
        state.loads.remove(&id);
    }

    pub(crate) fn request_from_peers(&self, id: CoId, exclude: Option<PeerId>) {
        let mut state = self.inner.lock_state();
        self.request_locked(&mut state, id, exclude);
    }

    /// Ask every server peer except `exclude` for `id`.
    fn request_locked(&self, state: &mut NodeState, id: CoId, exclude: Option<PeerId>) {
        let known = state
            .cores
            .get(&id)
            .map(CoValueCore::known_state)
            .unwrap_or_else(KnownState::empty);
        let mut asked = 0;
        for peer in state.peers.values_mut() {
            if peer.role() != PeerRole::Server || Some(peer.id()) == exclude {
                continue;
            }
            peer.start_load(id);
            if peer.send(SyncMessage::Load(KnownMessage::new(id, known.clone()))) {
                asked += 1;
            } else {
                peer.finish_load(&id);
            }
        }
        if asked == 0 {
            state.refresh_status(&id);
            state.fail_load_if_unanswered(&id);
        }
    }

    fn send_to(&self, state: &NodeState, peer: PeerId, message: SyncMessage) {
        if let Some(p) = state.peers.get(&peer) {
            p.send(message);
        }
    }

    /// Push `id` to every peer that wants it.
    pub(crate) fn sync_to_peers(&self, state: &mut NodeState, id: CoId) {
        let targets: Vec<PeerId> = state
            .peers
            .values()
            .filter(|p| p.wants(&id))
            .map(PeerState::id)
            .collect();
        for peer in targets {
            self.push_with_dependencies(state, peer, id, &mut HashSet::new());
        }
    }

    /// Send `peer` what it lacks of `id`, dependencies first.
    fn push_with_dependencies(
        &self,
        state: &mut NodeState,
        peer: PeerId,
        id: CoId,
        visited: &mut HashSet<CoId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        for dep in state.dependencies_of(&id) {
            self.push_with_dependencies(state, peer, dep, visited);
        }

        let Some(core) = state.cores.get(&id) else {
            return;
        };
        let Some(p) = state.peers.get_mut(&peer) else {
            return;
        };
        let messages = content_for(core, p.optimistic(&id), &self.inner.config.sync);
        // A peer holding a value gets its updates.
        p.subscribe(id);
        for message in messages {
            if !p.send_content(message) {
                return;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Message Handling
    // ─────────────────────────────────────────────────────────────────────────

    fn handle_message(&self, peer: PeerId, message: SyncMessage) {
        let mut state = self.inner.lock_state();
        if !state.peers.contains_key(&peer) {
            return;
        }
        debug!("<- {} {} {}", peer, message.action(), message.id());
        match message {
            SyncMessage::Load(msg) => self.handle_load(&mut state, peer, msg),
            SyncMessage::Known(msg) => self.handle_known(&mut state, peer, msg),
            SyncMessage::Content(msg) => self.handle_content(&mut state, Some(peer), msg),
            SyncMessage::Done { id } => {
                if let Some(p) = state.peers.get_mut(&peer) {
                    p.unsubscribe(&id);
                }
            }
        }
    }

    /// The peer wants `id` and holds `msg.known` of it.
    fn handle_load(&self, state: &mut NodeState, peer: PeerId, msg: KnownMessage) {
        let id = msg.id;
        let Some(p) = state.peers.get_mut(&peer) else {
            return;
        };
        p.correct_known(id, msg.known);
        p.subscribe(id);

        if state.cores.contains_key(&id) {
            self.answer_load(state, peer, id);
            return;
        }

        // Look for it ourselves without asking the requester back.
        let node = self.clone();
        tokio::spawn(async move {
            let found = node.load_core(id, Some(peer)).await.is_ok();
            let mut state = node.inner.lock_state();
            if found {
                node.answer_load(&mut state, peer, id);
            } else {
                node.send_to(
                    &state,
                    peer,
                    SyncMessage::Known(KnownMessage::new(id, KnownState::empty())),
                );
            }
        });
    }

    fn answer_load(&self, state: &mut NodeState, peer: PeerId, id: CoId) {
        let Some(core) = state.cores.get(&id) else {
            return;
        };
        let known = core.known_state();
        self.send_to(state, peer, SyncMessage::Known(KnownMessage::new(id, known)));
        self.push_with_dependencies(state, peer, id, &mut HashSet::new());
    }

    /// The peer told us what it holds of `id`.
    fn handle_known(&self, state: &mut NodeState, peer: PeerId, msg: KnownMessage) {
        let id = msg.id;
        let Some(p) = state.peers.get_mut(&peer) else {
            return;
        };
        let answered_load = p.finish_load(&id);
        if msg.is_correction {
            debug!("{} corrected its state of {}", peer, id);
            p.correct_known(id, msg.known.clone());
        } else {
            p.set_known(id, &msg.known);
        }

        if state.cores.contains_key(&id) {
            self.push_with_dependencies(state, peer, id, &mut HashSet::new());
        } else if answered_load && !msg.known.header {
            state.fail_load_if_unanswered(&id);
        }
    }

    /// Apply content from `source` (a peer, or storage when `None`).
    pub(crate) fn handle_content(
        &self,
        state: &mut NodeState,
        source: Option<PeerId>,
        message: ContentMessage,
    ) {
        let id = message.id;
        if let Some(p) = source.and_then(|peer| state.peers.get_mut(&peer)) {
            p.finish_load(&id);
            p.set_known(id, &message.known_after());
            if p.role() == PeerRole::Client {
                p.subscribe(id);
            }
        }

        let created = !state.cores.contains_key(&id);
        if created {
            let Some(header) = message.header.clone() else {
                debug!("Content for {} arrived without its header", id);
                if let Some(peer) = source {
                    let ask = KnownMessage::correction(id, KnownState::empty());
                    self.send_to(state, peer, SyncMessage::Known(ask));
                }
                return;
            };
            let max_tx_size = self.inner.config.storage.max_recommended_tx_size;
            match CoValueCore::from_received_header(id, header, max_tx_size) {
                Ok(core) => {
                    state.cores.insert(id, core);
                }
                Err(e) => {
                    warn!("Rejected header of {}: {}", id, e);
                    return;
                }
            }
        }

        let signers = signers_for(&state.cores, &message);
        let Some(core) = state.cores.get_mut(&id) else {
            return;
        };
        let since = if created {
            KnownState::empty()
        } else {
            core.known_state()
        };
        let report = apply_content(core, &message, &signers);
        let held = core.known_state();
        let changed = created || report.added > 0;
        if changed && source.is_some() {
            for stored in core.new_content_since(Some(&since)) {
                self.inner.persist(stored);
            }
        }

        for account in report.missing_accounts() {
            let mut parked = ContentMessage::new(id, message.priority);
            parked.new = message
                .new
                .iter()
                .filter(|(session, _)| {
                    session.actor().as_account() == Some(account)
                        && report.missing_signer.contains(*session)
                })
                .map(|(session, content)| (session.clone(), content.clone()))
                .collect();
            debug!("Parking content of {} until {} loads", id, account);
            state.parked.entry(account).or_default().push((source, parked));
            if state.status(&account) != Some(LoadStatus::Loading) {
                self.spawn_load(account);
            }
        }

        if let Some(peer) = source {
            let reply = if report.needs_correction() {
                KnownMessage::correction(id, held)
            } else {
                KnownMessage::new(id, held)
            };
            self.send_to(state, peer, SyncMessage::Known(reply));
        }

        if let Some(target) = message.expect_content_until {
            state.streaming.entry(id).or_default().combine(&target);
        }
        state.refresh_status(&id);

        if changed {
            for dep in state.missing_dependencies(&id) {
                self.spawn_load(dep);
            }
            self.sync_to_peers(state, id);
            self.notify_changed(state, &[id]);
        }

        if let Some(waiting) = state.parked.remove(&id) {
            for (from, content) in waiting {
                self.handle_content(state, from, content);
            }
        }
    }
}

/// Signers for the sessions in `message` that we can resolve now.
fn signers_for(
    cores: &HashMap<CoId, CoValueCore>,
    message: &ContentMessage,
) -> HashMap<SessionId, Ed25519PublicKey> {
    message
        .new
        .keys()
        .filter_map(|session| Some((session.clone(), resolve_signer(cores, session)?)))
        .collect()
}

/// Drain the incoming queue, yielding whenever the time budget runs out.
pub(crate) async fn process_incoming(node: Weak<Inner>, wake: Arc<Notify>, budget: Duration) {
    let mut budget = TimeBudget::new(budget);
    loop {
        let Some(inner) = node.upgrade() else {
            return;
        };
        let next = inner.lock_queue().pull();
        match next {
            Some((peer, message)) => {
                let node = LocalNode { inner };
                node.handle_message(peer, message);
                node.inner.synced.notify_waiters();
            }
            None => {
                drop(inner);
                wake.notified().await;
                continue;
            }
        }
        budget.checkpoint().await;
    }
}

async fn read_loop(
    peer: PeerId,
    transport: Arc<dyn Transport>,
    node: Weak<Inner>,
    wake: Arc<Notify>,
) {
    loop {
        match transport.recv().await {
            Ok(message) => {
                let Some(inner) = node.upgrade() else {
                    return;
                };
                inner.lock_queue().push(peer, message);
                wake.notify_one();
            }
            Err(SyncError::InvalidMessage(e)) => {
                warn!("Dropping undecodable message from {}: {}", peer, e);
            }
            Err(e) => {
                debug!("Connection to {} ended: {}", peer, e);
                break;
            }
        }
    }
    if let Some(inner) = node.upgrade() {
        LocalNode { inner }.remove_peer(peer);
    }
}

async fn write_loop(
    peer: PeerId,
    transport: Arc<dyn Transport>,
    mut outgoing: mpsc::UnboundedReceiver<SyncMessage>,
) {
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = transport.send(message).await {
            warn!("Send to {} failed: {}", peer, e);
            break;
        }
    }
    transport.close().await;
}
